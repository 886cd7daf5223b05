//! Tuning knobs and the RFC 8445 constants the agent is built around.
//!
//! These are `pub const` rather than buried inside [`AgentConfig`] because
//! several of them (the table-size caps) define the shape of fixed-capacity
//! collections used throughout the crate.

use std::net::SocketAddr;
use std::time::Duration;

/// RFC 8445: agents MUST NOT use an RTO smaller than 500ms.
pub const MIN_STUN_RETRANSMISSION_TIMEOUT: Duration = Duration::from_millis(500);
/// Gives ~31.5s of retries at the default RTO before a check fails.
pub const MAX_STUN_RETRANSMISSION_COUNT: u32 = 5;

/// RFC 8445: agents SHOULD use a default Ta value of 50ms.
pub const STUN_PACING_TIME: Duration = Duration::from_millis(50);

/// RFC 8445: agents SHOULD use a Tr value of 15s and MUST NOT go below it.
pub const STUN_KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

/// Bounds the unconnected lifetime of an agent after trickling begins.
pub const ICE_FAIL_TIMEOUT: Duration = Duration::from_secs(30);

pub const ICE_MAX_CANDIDATES: usize = 32;
pub const MAX_STUN_SERVER_RECORDS: usize = 2;
/// The "-2" headroom keeps one slot free for the loopback candidate and one
/// spare even when both STUN server slots and every other interface are in
/// use.
pub const MAX_HOST_CANDIDATES: usize = ICE_MAX_CANDIDATES - MAX_STUN_SERVER_RECORDS - 2;
pub const MAX_CANDIDATE_PAIRS: usize = ICE_MAX_CANDIDATES * 2;
pub const MAX_STUN_ENTRIES: usize = MAX_CANDIDATE_PAIRS + MAX_STUN_SERVER_RECORDS;

/// Per-agent configuration, supplied at construction time.
///
/// A small plain struct of knobs the constructor takes, instead of hardcoded
/// constants wired straight into the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// STUN servers to probe for server-reflexive candidates (at most
    /// [`MAX_STUN_SERVER_RECORDS`] are used).
    pub stun_servers: Vec<SocketAddr>,
    pub initial_rto: Duration,
    pub max_retransmissions: u32,
    pub pacing_time: Duration,
    pub keepalive_period: Duration,
    pub fail_timeout: Duration,
    pub max_candidate_pairs: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            stun_servers: Vec::new(),
            initial_rto: MIN_STUN_RETRANSMISSION_TIMEOUT,
            max_retransmissions: MAX_STUN_RETRANSMISSION_COUNT,
            pacing_time: STUN_PACING_TIME,
            keepalive_period: STUN_KEEPALIVE_PERIOD,
            fail_timeout: ICE_FAIL_TIMEOUT,
            max_candidate_pairs: MAX_CANDIDATE_PAIRS,
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stun_server(mut self, server: SocketAddr) -> Self {
        self.stun_servers.truncate(MAX_STUN_SERVER_RECORDS.saturating_sub(1));
        self.stun_servers.push(server);
        self
    }
}
