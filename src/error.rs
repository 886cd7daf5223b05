use std::io;

/// Errors returned by the public [`crate::IceAgent`] surface.
///
/// Internal protocol failures (a bad STUN datagram, a failed integrity check)
/// are logged and dropped rather than surfaced here — see the module docs on
/// [`crate::agent`]. This enum is only for operations that fail synchronously.
#[derive(Debug, thiserror::Error)]
pub enum IceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("STUN protocol error: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state for this operation: {0}")]
    InvalidState(String),

    #[error("table full: {0}")]
    Full(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connectivity timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, IceError>;
