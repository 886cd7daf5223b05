//! STUN (RFC 5389/8489) codec: header, attributes, and message framing.
//!
//! Scoped to exactly what ICE connectivity checks need: Binding
//! requests/responses/error-responses with the ICE attribute set, plus
//! MESSAGE-INTEGRITY and FINGERPRINT. Not a general-purpose STUN library.

mod attribute;
mod header;
mod message;

pub use attribute::{
    ERROR_CODE, FINGERPRINT, ICE_CONTROLLED, ICE_CONTROLLING, MAPPED_ADDRESS, MESSAGE_INTEGRITY,
    PRIORITY, SOFTWARE, UNKNOWN_ATTRIBUTES, USE_CANDIDATE, USERNAME, XOR_MAPPED_ADDRESS,
};
pub use header::{Class, Method, TransactionId, HEADER_LEN, MAGIC_COOKIE, TRANSACTION_ID_LEN};
pub use message::{Message, MessageBuilder};
