//! Mutex-protected agent state: tables, role, and the bits of bookkeeping
//! that are pure data manipulation rather than network I/O. Everything here
//! runs with the agent's single mutex held, by either the worker thread or
//! a public entry point.

use std::net::SocketAddr;
use std::time::Instant;

use log::debug;

use crate::addr::AddrRecord;
use crate::agent::description::{IceCredentials, IceDescription};
use crate::agent::state::{AgentState, Role};
use crate::candidate::{Candidate, CandidateKind};
use crate::config::{AgentConfig, ICE_MAX_CANDIDATES, MAX_CANDIDATE_PAIRS, MAX_HOST_CANDIDATES};
use crate::entry::{StunEntry, StunEntryKind};
use crate::pair::{
    ordered_pairs, pair_foundation, pair_priority, recompute_all, unfreeze_if_new_foundation,
    unfreeze_matching_foundation, CandidatePair, CandidatePairState,
};

pub type StateCallback = Box<dyn Fn(AgentState) + Send>;
pub type DataCallback = Box<dyn Fn(&[u8]) + Send>;

pub struct AgentInner {
    pub config: AgentConfig,
    pub role: Role,
    pub tiebreaker: u64,

    pub local: IceDescription,
    pub remote: Option<IceDescription>,

    pub pairs: Vec<CandidatePair>,
    pub ordered_pairs: Vec<usize>,
    pub entries: Vec<StunEntry>,

    pub state: AgentState,
    pub fail_timestamp: Option<Instant>,
    pub selected_pair: Option<usize>,
    pub last_initial_transmission: Option<Instant>,
    pending_server_entries: usize,
    host_candidate_count: usize,

    pub on_state_change: Option<StateCallback>,
    pub on_data: Option<DataCallback>,
}

impl AgentInner {
    pub fn new(config: AgentConfig, role: Role) -> Self {
        AgentInner {
            config,
            role,
            tiebreaker: rand::random(),
            local: IceDescription::new(IceCredentials::random()),
            remote: None,
            pairs: Vec::new(),
            ordered_pairs: Vec::new(),
            entries: Vec::new(),
            state: AgentState::Disconnected,
            fail_timestamp: None,
            selected_pair: None,
            last_initial_transmission: None,
            pending_server_entries: 0,
            host_candidate_count: 0,
            on_state_change: None,
            on_data: None,
        }
    }

    pub fn is_controlling(&self) -> bool {
        self.role == Role::Controlling
    }

    pub fn set_state(&mut self, new: AgentState) {
        if self.state == new {
            return;
        }
        debug!("agent state {} -> {}", self.state, new);
        self.state = new;
        if new == AgentState::Connecting {
            self.fail_timestamp = Some(Instant::now() + self.config.fail_timeout);
        }
        if let Some(cb) = &self.on_state_change {
            cb(new);
        }
    }

    /// Appends a local candidate, subject to the type-specific cap, and
    /// forms pairs against every already-known remote candidate.
    pub fn add_local_candidate(&mut self, candidate: Candidate) -> Option<usize> {
        if candidate.kind == CandidateKind::Host && self.host_candidate_count >= MAX_HOST_CANDIDATES {
            debug!("dropping host candidate, table full");
            return None;
        }
        if self.local.candidates.len() >= ICE_MAX_CANDIDATES {
            debug!("dropping local candidate, table full");
            return None;
        }
        if candidate.kind == CandidateKind::Host {
            self.host_candidate_count += 1;
        }
        self.local.candidates.push(candidate);
        let local_idx = self.local.candidates.len() - 1;

        if let Some(remote) = &self.remote {
            for remote_idx in 0..remote.candidates.len() {
                self.form_pair(local_idx, remote_idx);
            }
        }
        Some(local_idx)
    }

    /// Appends a remote candidate (after deduplicating by base+address+type,
    /// RFC 8445 §5.1.3) and forms pairs against every local candidate.
    pub fn add_remote_candidate(&mut self, candidate: Candidate) -> Option<usize> {
        let remote = self.remote.get_or_insert_with(|| IceDescription::new(IceCredentials::random()));

        if let Some(existing) = remote
            .candidates
            .iter()
            .position(|c| c.addr == candidate.addr && c.kind == candidate.kind)
        {
            self.on_remote_description_set();
            return Some(existing);
        }

        if remote.candidates.len() >= ICE_MAX_CANDIDATES {
            debug!("dropping remote candidate, table full");
            return None;
        }

        remote.candidates.push(candidate);
        let remote_idx = remote.candidates.len() - 1;

        for local_idx in 0..self.local.candidates.len() {
            self.form_pair(local_idx, remote_idx);
        }
        self.on_remote_description_set();
        Some(remote_idx)
    }

    /// Forms (or finds) the pair for `(local_idx, remote_idx)`, de-duplicated
    /// by (local base, remote address): RFC 8445 §6.1.2.2 keeps one pair per
    /// such tuple rather than one per raw candidate combination.
    pub fn form_pair(&mut self, local_idx: usize, remote_idx: usize) -> Option<usize> {
        let local_base = self.local.candidates[local_idx].base;
        let remote_addr = self.remote.as_ref()?.candidates[remote_idx].addr;

        if !local_base.compatible_family(&remote_addr) {
            return None;
        }

        if let Some(existing) = self.pairs.iter().position(|p| {
            self.local.candidates[p.local].base == local_base
                && self.remote.as_ref().unwrap().candidates[p.remote].addr == remote_addr
        }) {
            return Some(existing);
        }

        if self.pairs.len() >= MAX_CANDIDATE_PAIRS.min(self.config.max_candidate_pairs) {
            debug!("dropping candidate pair, table full");
            return None;
        }

        let local = &self.local.candidates[local_idx];
        let remote = &self.remote.as_ref().unwrap().candidates[remote_idx];
        let priority = pair_priority(local, remote, self.is_controlling());
        let foundation = pair_foundation(local, remote);

        self.pairs.push(CandidatePair::new(local_idx, remote_idx, priority, foundation));
        let new_idx = self.pairs.len() - 1;
        unfreeze_if_new_foundation(&mut self.pairs, new_idx);
        self.update_ordered_pairs();
        Some(new_idx)
    }

    pub fn update_ordered_pairs(&mut self) {
        self.ordered_pairs = ordered_pairs(&self.pairs);
    }

    /// RFC 8445 §7.3.1.1: the losing side flips role and every pair
    /// priority is recomputed since the formula depends on role.
    pub fn flip_role(&mut self) {
        self.role = match self.role {
            Role::Controlling => Role::Controlled,
            Role::Controlled | Role::Unknown => Role::Controlling,
        };
        let is_controlling = self.is_controlling();
        let remote_candidates = self.remote.as_ref().map(|r| r.candidates.clone()).unwrap_or_default();
        recompute_all(&mut self.pairs, &self.local.candidates, &remote_candidates, is_controlling);
        self.update_ordered_pairs();
    }

    pub fn unfreeze_foundation(&mut self, foundation: &str) {
        unfreeze_matching_foundation(&mut self.pairs, foundation);
    }

    pub fn push_entry(&mut self, entry: StunEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn register_server_entry(&mut self) {
        self.pending_server_entries += 1;
    }

    /// Called once a SERVER entry finishes (success or exhausted retries).
    /// Flips local gathering-done once every configured server has reported.
    pub fn server_entry_finished(&mut self) {
        self.pending_server_entries = self.pending_server_entries.saturating_sub(1);
        if self.pending_server_entries == 0 {
            self.local.gathering_done = true;
            self.maybe_advance_from_gathering();
        }
    }

    pub fn maybe_advance_from_gathering(&mut self) {
        if self.state == AgentState::Gathering && self.local.gathering_done {
            if self.remote.is_some() {
                self.set_state(AgentState::Connecting);
            }
        }
    }

    /// A remote candidate or description just became known. Trickle ICE
    /// (RFC 8840) allows this before local gathering finishes; only
    /// `disconnected` needs nudging forward, since `gathering` already
    /// advances to `connecting` on its own once gathering completes
    /// (`maybe_advance_from_gathering`).
    pub fn on_remote_description_set(&mut self) {
        if self.state == AgentState::Disconnected {
            self.set_state(AgentState::Connecting);
        }
        self.maybe_advance_from_gathering();
    }

    pub fn find_local_candidate_by_base(&self, base: AddrRecord) -> Option<usize> {
        self.local.candidates.iter().position(|c| c.base == base)
    }

    pub fn find_local_candidate_by_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.local.candidates.iter().position(|c| c.addr.0 == addr)
    }

    pub fn find_pair_by_entry(&self, entry_idx: usize) -> Option<usize> {
        self.pairs.iter().position(|p| p.stun_entry == Some(entry_idx))
    }

    /// Highest-priority `succeeded` pair that has not yet been nominated,
    /// used by the controlling side to decide whether to send a follow-up
    /// USE-CANDIDATE check (RFC 8445 §7.3.1).
    pub fn highest_priority_unnominated_succeeded(&self) -> Option<usize> {
        self.ordered_pairs
            .iter()
            .copied()
            .find(|&idx| self.pairs[idx].state == CandidatePairState::Succeeded && !self.pairs[idx].nominated)
    }
}
