//! ICE candidates: local/remote endpoints offered during connectivity checks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use crate::addr::AddrRecord;

/// RFC 8445 §5.1.2.2 type preferences, used as the top byte of priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host = 126,
    PeerReflexive = 110,
    ServerReflexive = 100,
}

impl CandidateKind {
    fn type_preference(self) -> u32 {
        self as u32
    }

    /// Breaks ties between same-type local candidates (RFC 8445 §5.1.2.1):
    /// host candidates get the top quarter of the local-preference range,
    /// peer-reflexive the next, server-reflexive the next.
    pub(crate) fn local_preference_offset(self) -> u32 {
        match self {
            CandidateKind::Host => (65535 / 4) * 3,
            CandidateKind::PeerReflexive => (65535 / 4) * 2,
            CandidateKind::ServerReflexive => 65535 / 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "host" => Some(CandidateKind::Host),
            "prflx" => Some(CandidateKind::PeerReflexive),
            "srflx" => Some(CandidateKind::ServerReflexive),
            _ => None,
        }
    }
}

/// A single ICE candidate, local or remote, for the agent's one component.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub addr: AddrRecord,
    /// For host candidates equal to `addr`; for server-reflexive the local
    /// socket the mapped address was learned through; for peer-reflexive the
    /// socket the triggering datagram arrived on.
    pub base: AddrRecord,
    pub priority: u32,
    pub foundation: String,
    /// The real-address:port that produced a server-reflexive candidate.
    pub related_addr: Option<AddrRecord>,
}

impl Candidate {
    pub fn new_host(addr: AddrRecord, count_of_kind: u32) -> Self {
        Self::new(CandidateKind::Host, addr, addr, count_of_kind, None)
    }

    pub fn new_server_reflexive(mapped: AddrRecord, base: AddrRecord, count_of_kind: u32) -> Self {
        Self::new(CandidateKind::ServerReflexive, mapped, base, count_of_kind, Some(base))
    }

    pub fn new_peer_reflexive(addr: AddrRecord, base: AddrRecord, priority: u32) -> Self {
        Candidate {
            kind: CandidateKind::PeerReflexive,
            addr,
            base,
            priority,
            foundation: "prflx".into(),
            related_addr: None,
        }
    }

    fn new(
        kind: CandidateKind,
        addr: AddrRecord,
        base: AddrRecord,
        count_of_kind: u32,
        related_addr: Option<AddrRecord>,
    ) -> Self {
        let priority = compute_priority(kind, count_of_kind);
        let foundation = compute_foundation(kind, base.ip(), related_addr.map(|a| a.ip()));
        Candidate {
            kind,
            addr,
            base,
            priority,
            foundation,
            related_addr,
        }
    }

    /// Builds a candidate learned directly from an incoming `candidate:` line
    /// (RFC 8445 §5.1.2.1), trusting the peer's stated priority/foundation.
    pub fn from_remote(
        kind: CandidateKind,
        addr: AddrRecord,
        priority: u32,
        foundation: String,
        related_addr: Option<AddrRecord>,
    ) -> Self {
        Candidate {
            kind,
            addr,
            base: addr,
            priority,
            foundation,
            related_addr,
        }
    }
}

/// RFC 8445 §5.1.2.1: priority = (2^24)*type_pref + (2^8)*local_pref + (256 - component_id).
/// This agent has exactly one component, so `256 - component_id` is always `255`.
fn compute_priority(kind: CandidateKind, count_of_kind: u32) -> u32 {
    let type_preference = kind.type_preference() << 24;
    let local_preference = (kind.local_preference_offset().saturating_sub(count_of_kind)) << 8;
    type_preference + local_preference + 255
}

/// Foundations only need to be distinct per (type, base, related address,
/// protocol) tuple (RFC 8445 §5.1.1.3); a hash collapses that tuple into a
/// short opaque string the same way `ezk-ice` does, except rendered as text
/// since foundations are exchanged over SDP as strings.
fn compute_foundation(kind: CandidateKind, base: IpAddr, rel_addr: Option<IpAddr>) -> String {
    let mut hasher = DefaultHasher::new();
    (kind, base, rel_addr, "udp").hash(&mut hasher);
    format!("{:x}", hasher.finish())
}
