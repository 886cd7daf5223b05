//! A threaded ICE (RFC 8445) connectivity-check agent and the STUN
//! (RFC 5389/8489) binding exchange it runs over.
//!
//! Scoped to exactly what a single-component UDP agent needs: candidate
//! gathering, candidate-pair formation and prioritization, the STUN
//! transaction/retransmission/pacing machinery, and the controlling/
//! controlled role-conflict dance. Multi-component (RTP/RTCP bundling),
//! TURN relaying, and ICE restarts are out of scope — see the crate's
//! design notes for why.

pub mod addr;
pub mod agent;
pub mod candidate;
pub mod config;
pub mod entry;
pub mod error;
pub mod pair;
pub mod sdp;
pub mod stun;

pub use agent::{AgentState, IceAgent, IceCredentials, IceDescription, Role, SelectedPair};
pub use candidate::{Candidate, CandidateKind};
pub use config::AgentConfig;
pub use error::{IceError, Result};
