//! The worker thread's event loop: socket wait, bookkeeping, and STUN
//! message dispatch. Everything in this module except the socket wait
//! itself runs with the agent mutex held.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use log::{debug, trace, warn};

use crate::agent::description::IceDescription;
use crate::agent::inner::AgentInner;
use crate::agent::state::{AgentState, Role};
use crate::candidate::{Candidate, CandidateKind};
use crate::config::MAX_STUN_ENTRIES;
use crate::entry::{StunEntry, StunEntryKind};
use crate::pair::CandidatePairState;
use crate::socket::{AgentSocket, SocketWaiter};
use crate::stun::{Class, Message, MessageBuilder, Method, TransactionId, HEADER_LEN, MAGIC_COOKIE};

const DEFAULT_PEER_PRIORITY: u32 = 1;

pub struct Worker {
    pub inner: Arc<Mutex<AgentInner>>,
    pub socket: Arc<AgentSocket>,
    pub waiter: SocketWaiter,
    pub selected_entry: Arc<AtomicUsize>,
    pub selected_target: Arc<RwLock<Option<SocketAddr>>>,
    pub stop: Arc<AtomicBool>,
}

impl Worker {
    pub fn run(mut self) {
        let mut buf = vec![0u8; 2048];
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }

            let now = Instant::now();
            let deadline = {
                let mut inner = self.inner.lock().unwrap();
                let bookkeeping_deadline = self.bookkeeping(&mut *inner, now);
                match (bookkeeping_deadline, inner.fail_timestamp) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            };

            let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let readable = match self.waiter.wait(timeout) {
                Ok(r) => r,
                Err(err) => {
                    warn!("socket wait failed: {err}");
                    let mut inner = self.inner.lock().unwrap();
                    inner.set_state(AgentState::Failed);
                    return;
                }
            };

            if self.stop.load(Ordering::SeqCst) {
                return;
            }

            if readable {
                loop {
                    match self.socket.recv_from(&mut buf) {
                        Ok((len, source)) => self.handle_datagram(&buf[0..len], source),
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            warn!("recv failed: {err}");
                            break;
                        }
                    }
                }
            }

            let now = Instant::now();
            let mut inner = self.inner.lock().unwrap();
            if let Some(fail_at) = inner.fail_timestamp {
                if now > fail_at && inner.state.rank() < AgentState::Connected.rank() {
                    inner.set_state(AgentState::Failed);
                    return;
                }
            }
        }
    }

    /// Sends due transmissions and returns the next wakeup deadline.
    /// Finished CHECK entries fail their pair; finished SERVER entries mark
    /// that server's gathering done.
    fn bookkeeping(&self, inner: &mut AgentInner, now: Instant) -> Option<Instant> {
        self.start_checks(inner, now);

        let mut next_deadline: Option<Instant> = None;
        let pacing = inner.config.pacing_time;

        for idx in 0..inner.entries.len() {
            let due = inner.entries[idx].next_transmission <= now || inner.entries[idx].take_armed();
            if inner.entries[idx].finished || !due {
                if !inner.entries[idx].finished {
                    next_deadline = Some(min_deadline(next_deadline, inner.entries[idx].next_transmission));
                }
                continue;
            }

            let is_initial = inner.entries[idx].retransmissions == 0;
            if is_initial {
                if let Some(last) = inner.last_initial_transmission {
                    let elapsed = now.saturating_duration_since(last);
                    if elapsed < pacing {
                        inner.entries[idx].next_transmission = now + (pacing - elapsed);
                        next_deadline = Some(min_deadline(next_deadline, inner.entries[idx].next_transmission));
                        continue;
                    }
                }
                inner.last_initial_transmission = Some(now);
            }

            if let StunEntryKind::Check { .. } = inner.entries[idx].kind {
                inner.entries[idx].role_at_send = Some(inner.is_controlling());
            }
            self.transmit(inner, idx, now);

            if let StunEntryKind::Keepalive { .. } = inner.entries[idx].kind {
                // Indications get no response and never back off: just
                // re-arm for the next period with a fresh transaction id.
                inner.entries[idx].transaction_id = TransactionId::random();
                inner.entries[idx].next_transmission = now + inner.config.keepalive_period;
                next_deadline = Some(min_deadline(next_deadline, inner.entries[idx].next_transmission));
                continue;
            }

            let max_retransmissions = inner.config.max_retransmissions;
            let finished = !inner.entries[idx].schedule_retransmission(max_retransmissions, now);
            if finished {
                self.finish_entry(inner, idx);
            } else {
                next_deadline = Some(min_deadline(next_deadline, inner.entries[idx].next_transmission));
            }
        }

        next_deadline
    }

    /// Promotes every `waiting` pair to `in-progress` by creating its CHECK
    /// entry. Entry creation is pure bookkeeping; the
    /// generic transmission loop above is what actually paces the wire
    /// send, so multiple pairs becoming `waiting` at once still respect
    /// `STUN_PACING_TIME` between their first transmissions.
    fn start_checks(&self, inner: &mut AgentInner, now: Instant) {
        if inner.remote.is_none() {
            return;
        }
        let waiting: Vec<usize> = inner
            .ordered_pairs
            .iter()
            .copied()
            .filter(|&idx| inner.pairs[idx].state == CandidatePairState::Waiting)
            .collect();

        for idx in waiting {
            if inner.entries.len() >= MAX_STUN_ENTRIES {
                debug!("dropping connectivity check for pair {idx}, STUN entry table full");
                break;
            }
            let target = inner.remote.as_ref().unwrap().candidates[inner.pairs[idx].remote].addr.0;
            let entry = StunEntry::new(StunEntryKind::Check { pair: idx }, target, inner.config.initial_rto, now);
            let entry_idx = inner.push_entry(entry);
            inner.pairs[idx].stun_entry = Some(entry_idx);
            inner.pairs[idx].state = CandidatePairState::InProgress;
        }
    }

    fn finish_entry(&self, inner: &mut AgentInner, idx: usize) {
        inner.entries[idx].mark_finished();
        match inner.entries[idx].kind {
            StunEntryKind::Server => {
                debug!("STUN server binding entry {idx} exhausted retries");
                inner.server_entry_finished();
            }
            StunEntryKind::Check { .. } => {
                if let Some(pair_idx) = inner.find_pair_by_entry(idx) {
                    debug!("candidate pair {pair_idx} failed: check exhausted retries");
                    inner.pairs[pair_idx].state = CandidatePairState::Failed;
                }
            }
            StunEntryKind::Keepalive { .. } => {}
        }
    }

    fn transmit(&self, inner: &AgentInner, idx: usize, now: Instant) {
        let entry = &inner.entries[idx];
        let bytes = match entry.kind {
            StunEntryKind::Server => build_server_binding_request(entry.transaction_id),
            StunEntryKind::Check { pair } => {
                let use_candidate = inner.is_controlling() && inner.pairs[pair].nominated;
                build_check_request(inner, pair, entry.transaction_id, use_candidate)
            }
            StunEntryKind::Keepalive { pair } => build_keepalive_indication(inner, pair, entry.transaction_id),
        };
        trace!("sending STUN message to {} ({} bytes)", entry.target, bytes.len());
        let _ = self.socket.send_to(&bytes, entry.target);
        let _ = now;
    }

    fn handle_datagram(&self, buf: &[u8], source: SocketAddr) {
        if is_stun(buf) {
            match Message::parse(buf) {
                Ok(msg) => self.dispatch_stun(msg, source),
                Err(err) => debug!("dropping malformed STUN datagram from {source}: {err}"),
            }
        } else {
            let inner = self.inner.lock().unwrap();
            let selected_remote = inner
                .selected_pair
                .and_then(|p| inner.remote.as_ref().map(|r| r.candidates[inner.pairs[p].remote].addr.0));
            if selected_remote == Some(source) {
                if let Some(cb) = &inner.on_data {
                    cb(buf);
                }
            } else {
                trace!("dropping application datagram from unselected source {source}");
            }
        }
    }

    /// Routes an inbound STUN message by transaction id.
    fn dispatch_stun(&self, msg: Message, source: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();

        let matching_entry = inner
            .entries
            .iter()
            .position(|e| !e.finished && e.transaction_id == msg.transaction_id && e.target == source);

        match matching_entry {
            Some(idx) if msg.class == Class::Success || msg.class == Class::Error => {
                self.handle_response(&mut *inner, idx, &msg, source);
            }
            _ if msg.class == Class::Request => {
                self.handle_peer_request(&mut *inner, &msg, source);
            }
            _ => {
                trace!("dropping unsolicited STUN {:?} from {source}", msg.class);
            }
        }
    }

    fn handle_peer_request(&self, inner: &mut AgentInner, msg: &Message, source: SocketAddr) {
        let local_pwd = inner.local.credentials.pwd.clone();
        if !msg.verify_message_integrity(local_pwd.as_bytes()) {
            debug!("rejecting check from {source}: bad MESSAGE-INTEGRITY");
            self.send_error(inner, msg, source, 401, "Unauthorized");
            return;
        }

        let expected_prefix = format!("{}:", inner.local.credentials.ufrag);
        let username_ok = msg
            .username()
            .map(|u| u.starts_with(&expected_prefix))
            .unwrap_or(false);
        if !username_ok {
            debug!("rejecting check from {source}: bad USERNAME");
            self.send_error(inner, msg, source, 400, "Bad Request");
            return;
        }

        if let Some(conflict_response) = self.resolve_role_conflict(inner, msg) {
            self.send_error(inner, msg, source, conflict_response, "Role Conflict");
            return;
        }

        let local_idx = inner.find_local_candidate_by_addr(local_receiving_addr(inner, source));
        let remote_idx = self.ensure_remote_peer_reflexive(inner, msg, source);

        let pair_idx = match (local_idx, remote_idx) {
            (Some(local_idx), Some(remote_idx)) => inner.form_pair(local_idx, remote_idx),
            _ => None,
        };

        if msg.use_candidate() && !inner.is_controlling() {
            if let Some(pair_idx) = pair_idx {
                inner.pairs[pair_idx].received_use_candidate = true;
                // Our own check for this pair may already have succeeded
                // before this USE-CANDIDATE request arrived; handle_check_success
                // won't run again for it, so select eagerly here too.
                if inner.pairs[pair_idx].state == CandidatePairState::Succeeded && inner.selected_pair.is_none() {
                    self.select_pair(inner, pair_idx);
                }
            }
        }

        self.send_success(inner, msg, source);
    }

    /// RFC 8445 §7.3.1.1. Returns `Some(487)` if we must reject the request
    /// because we kept our role (tie or we have the higher tiebreaker).
    fn resolve_role_conflict(&self, inner: &mut AgentInner, msg: &Message) -> Option<u16> {
        let their_controlling = msg.ice_controlling();
        let their_controlled = msg.ice_controlled();

        if let Some(their_tiebreaker) = their_controlling {
            if inner.is_controlling() {
                if inner.tiebreaker >= their_tiebreaker {
                    return Some(487);
                }
                inner.flip_role();
            }
        } else if let Some(their_tiebreaker) = their_controlled {
            if !inner.is_controlling() && inner.role != Role::Unknown {
                if inner.tiebreaker < their_tiebreaker {
                    return Some(487);
                }
                inner.flip_role();
            }
        }
        None
    }

    fn ensure_remote_peer_reflexive(&self, inner: &mut AgentInner, msg: &Message, source: SocketAddr) -> Option<usize> {
        let remote = inner.remote.get_or_insert_with(|| IceDescription::new(crate::agent::description::IceCredentials::random()));
        if let Some(idx) = remote.candidates.iter().position(|c| c.addr.0 == source) {
            return Some(idx);
        }
        let priority = msg.priority().unwrap_or(DEFAULT_PEER_PRIORITY);
        let candidate = Candidate::new_peer_reflexive(source.into(), source.into(), priority);
        debug!("learned peer-reflexive candidate {source}");
        inner.add_remote_candidate(candidate)
    }

    fn handle_response(&self, inner: &mut AgentInner, entry_idx: usize, msg: &Message, source: SocketAddr) {
        if msg.class == Class::Error {
            if let Some((487, _)) = msg.error_code() {
                // The request this answers advertised whatever role was
                // current at send time (`role_at_send`). If we've since
                // flipped — resolved from the other direction already —
                // this is a stale response to that earlier role and must
                // not flip us back into a loop.
                let stale = inner.entries[entry_idx].role_at_send != Some(inner.is_controlling());
                if stale {
                    debug!("ignoring stale role conflict response from {source}");
                } else {
                    debug!("role conflict response from {source}, flipping role");
                    inner.flip_role();
                }
                inner.entries[entry_idx].arm();
                return;
            }
            debug!("STUN error response from {source}: {:?}", msg.error_code());
            self.finish_entry(inner, entry_idx);
            return;
        }

        match inner.entries[entry_idx].kind {
            StunEntryKind::Server => self.handle_server_success(inner, entry_idx, msg),
            StunEntryKind::Check { .. } => self.handle_check_success(inner, entry_idx, msg, source),
        }
    }

    fn handle_server_success(&self, inner: &mut AgentInner, entry_idx: usize, msg: &Message) {
        if let Some(mapped) = msg.xor_mapped_address() {
            let base_addr = inner.entries[entry_idx].target;
            if let Some(host_idx) = inner.local.candidates.iter().position(|c| c.kind == CandidateKind::Host) {
                let base = inner.local.candidates[host_idx].base;
                // No NAT between us and the server: the mapped address is
                // just our own host address, so there's nothing reflexive to
                // add (it would be a pointless duplicate of the host
                // candidate at the same address/port).
                if mapped == base.0 {
                    debug!("STUN server {base_addr} reports no NAT (mapped address equals host candidate)");
                } else {
                    let count = inner
                        .local
                        .candidates
                        .iter()
                        .filter(|c| c.kind == CandidateKind::ServerReflexive)
                        .count() as u32;
                    let candidate = Candidate::new_server_reflexive(mapped.into(), base, count);
                    debug!("discovered server-reflexive candidate {mapped} via {base_addr}");
                    inner.add_local_candidate(candidate);
                }
            }
        }
        inner.entries[entry_idx].mark_finished();
        inner.server_entry_finished();
    }

    fn handle_check_success(&self, inner: &mut AgentInner, entry_idx: usize, msg: &Message, _source: SocketAddr) {
        let Some(pair_idx) = inner.find_pair_by_entry(entry_idx) else {
            return;
        };
        inner.pairs[pair_idx].state = CandidatePairState::Succeeded;
        inner.entries[entry_idx].mark_finished();

        if inner.state.rank() < AgentState::Connected.rank() {
            inner.set_state(AgentState::Connected);
        }

        if let Some(mapped) = msg.xor_mapped_address() {
            if inner.find_local_candidate_by_addr(mapped).is_none() {
                let base = inner.local.candidates[inner.pairs[pair_idx].local].base;
                let priority = inner.local.candidates[inner.pairs[pair_idx].local].priority;
                let candidate = Candidate::new_peer_reflexive(mapped.into(), base, priority);
                debug!("learned local peer-reflexive candidate {mapped}");
                inner.add_local_candidate(candidate);
            }
        }

        let foundation = inner.pairs[pair_idx].foundation.clone();
        inner.unfreeze_foundation(&foundation);

        let should_nominate = inner.is_controlling()
            && inner.highest_priority_unnominated_succeeded() == Some(pair_idx)
            && !inner.pairs[pair_idx].nominated;

        if should_nominate {
            debug!("nominating pair {pair_idx} (controlling)");
            inner.pairs[pair_idx].nominated = true;
            self.send_nomination(inner, pair_idx);
        }

        let ready_to_complete = inner.pairs[pair_idx].nominated
            || (inner.pairs[pair_idx].received_use_candidate && !inner.is_controlling());

        if ready_to_complete && inner.selected_pair.is_none() {
            self.select_pair(inner, pair_idx);
        }
    }

    /// Marks `pair_idx` as the agent's final, permanent selected pair (spec
    /// §3 invariant: set once, never replaced outside of `failed`) and
    /// starts its keepalive entry. Its former CHECK entry, if any, is left
    /// `finished` in the table rather than removed (entries are never
    /// removed once created, only retired).
    fn select_pair(&self, inner: &mut AgentInner, pair_idx: usize) {
        inner.selected_pair = Some(pair_idx);
        let remote_addr = inner.remote.as_ref().unwrap().candidates[inner.pairs[pair_idx].remote].addr.0;
        *self.selected_target.write().unwrap() = Some(remote_addr);

        let now = Instant::now();
        let mut keepalive = StunEntry::new(StunEntryKind::Keepalive { pair: pair_idx }, remote_addr, inner.config.keepalive_period, now);
        keepalive.next_transmission = now + inner.config.keepalive_period;
        let entry_idx = inner.push_entry(keepalive);
        self.selected_entry.store(entry_idx + 1, Ordering::SeqCst);

        debug!("selected candidate pair {pair_idx}");
        inner.set_state(AgentState::Completed);
        inner.fail_timestamp = None;
    }

    /// Controlling-side nomination (RFC 8445 §7.3.1): sends a fresh
    /// connectivity check carrying USE-CANDIDATE. This is a new STUN
    /// transaction, not a retransmission of the original check — its entry
    /// is picked up and paced by the normal bookkeeping pass like any other
    /// initial send.
    fn send_nomination(&self, inner: &mut AgentInner, pair_idx: usize) {
        let target = inner.remote.as_ref().unwrap().candidates[inner.pairs[pair_idx].remote].addr.0;
        let entry = StunEntry::new(StunEntryKind::Check { pair: pair_idx }, target, inner.config.initial_rto, Instant::now());
        let entry_idx = inner.push_entry(entry);
        inner.pairs[pair_idx].stun_entry = Some(entry_idx);
    }

    fn send_success(&self, inner: &AgentInner, request: &Message, source: SocketAddr) {
        let mut builder = MessageBuilder::new(Class::Success, Method::Binding, request.transaction_id);
        builder.add_xor_mapped_address(source);
        builder.add_message_integrity(inner.local.credentials.pwd.as_bytes());
        builder.add_fingerprint();
        let _ = self.socket.send_to(&builder.finish(), source);
    }

    fn send_error(&self, inner: &AgentInner, request: &Message, source: SocketAddr, code: u16, reason: &str) {
        let mut builder = MessageBuilder::new(Class::Error, Method::Binding, request.transaction_id);
        builder.add_error_code(code, reason);
        builder.add_message_integrity(inner.local.credentials.pwd.as_bytes());
        builder.add_fingerprint();
        let _ = self.socket.send_to(&builder.finish(), source);
    }
}

fn min_deadline(a: Option<Instant>, b: Instant) -> Instant {
    match a {
        Some(a) if a < b => a,
        _ => b,
    }
}

fn is_stun(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && buf[0] & 0xC0 == 0 && buf[4..8] == MAGIC_COOKIE.to_be_bytes()
}

fn local_receiving_addr(inner: &AgentInner, _source: SocketAddr) -> SocketAddr {
    // This agent has a single component bound to one socket, so any
    // incoming datagram was received on the (sole) host candidate's
    // address regardless of the peer's source address.
    inner
        .local
        .candidates
        .iter()
        .find(|c| c.kind == CandidateKind::Host)
        .map(|c| c.addr.0)
        .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap())
}

fn build_server_binding_request(transaction_id: TransactionId) -> Vec<u8> {
    let mut builder = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);
    builder.add_fingerprint();
    builder.finish()
}

fn build_check_request(inner: &AgentInner, pair_idx: usize, transaction_id: TransactionId, use_candidate: bool) -> Vec<u8> {
    let pair = &inner.pairs[pair_idx];
    let local = &inner.local.candidates[pair.local];
    let remote_ufrag = inner
        .remote
        .as_ref()
        .map(|r| r.credentials.ufrag.clone())
        .unwrap_or_default();
    let remote_pwd = inner
        .remote
        .as_ref()
        .map(|r| r.credentials.pwd.clone())
        .unwrap_or_default();

    let username = format!("{}:{}", remote_ufrag, inner.local.credentials.ufrag);

    let mut builder = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);
    builder.add_username(&username);
    builder.add_priority(local.priority);
    if inner.is_controlling() {
        builder.add_ice_controlling(inner.tiebreaker);
    } else {
        builder.add_ice_controlled(inner.tiebreaker);
    }
    if use_candidate {
        builder.add_use_candidate();
    }
    builder.add_message_integrity(remote_pwd.as_bytes());
    builder.add_fingerprint();
    builder.finish()
}

/// A keepalive is a Binding indication, not a request: no MESSAGE-INTEGRITY
/// key round-trips a response since none is expected, but the agent still
/// signs it with the remote password so a path-validating middlebox (or a
/// stricter peer) doesn't flag it as malformed.
fn build_keepalive_indication(inner: &AgentInner, pair_idx: usize, transaction_id: TransactionId) -> Vec<u8> {
    let pair = &inner.pairs[pair_idx];
    let local = &inner.local.candidates[pair.local];
    let remote_pwd = inner
        .remote
        .as_ref()
        .map(|r| r.credentials.pwd.clone())
        .unwrap_or_default();

    let mut builder = MessageBuilder::new(Class::Indication, Method::Binding, transaction_id);
    builder.add_priority(local.priority);
    if inner.is_controlling() {
        builder.add_ice_controlling(inner.tiebreaker);
    } else {
        builder.add_ice_controlled(inner.tiebreaker);
    }
    builder.add_message_integrity(remote_pwd.as_bytes());
    builder.add_fingerprint();
    builder.finish()
}
