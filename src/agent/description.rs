//! ICE credentials and the local/remote candidate descriptions exchanged
//! out of band (normally over SDP, see [`crate::sdp`]).

use rand::distributions::{Alphanumeric, DistString};

use crate::candidate::Candidate;
use crate::sdp::format_candidate_line;

/// `ice-ufrag`/`ice-pwd`, exchanged once per agent and used to verify
/// STUN USERNAME/MESSAGE-INTEGRITY on connectivity checks.
#[derive(Debug, Clone)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        IceCredentials {
            ufrag: Alphanumeric.sample_string(&mut rng, 8),
            pwd: Alphanumeric.sample_string(&mut rng, 24),
        }
    }
}

/// One side's ufrag, pwd, candidate list, and whether its gathering has
/// finished — the unit exchanged out of band between the two agents.
#[derive(Debug, Clone)]
pub struct IceDescription {
    pub credentials: IceCredentials,
    pub candidates: Vec<Candidate>,
    pub gathering_done: bool,
}

impl IceDescription {
    pub fn new(credentials: IceCredentials) -> Self {
        IceDescription {
            credentials,
            candidates: Vec::new(),
            gathering_done: false,
        }
    }

    /// Renders `ice-ufrag`, `ice-pwd` and one `candidate` attribute line per
    /// known candidate, trickling-compatible (callers may call this again
    /// as more candidates are gathered).
    pub fn to_sdp_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("a=ice-ufrag:{}", self.credentials.ufrag),
            format!("a=ice-pwd:{}", self.credentials.pwd),
        ];
        for candidate in &self.candidates {
            lines.push(format!("a={}", format_candidate_line(candidate, 1)));
        }
        lines
    }
}
