//! STUN transaction bookkeeping for outstanding binding requests.
//!
//! Each entry tracks one in-flight (or about-to-be-armed) STUN transaction,
//! whether it is a server-reflexive discovery probe or a connectivity check
//! tied to a candidate pair.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::stun::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunEntryKind {
    /// A binding request sent to a configured STUN server to discover a
    /// server-reflexive candidate.
    Server,
    /// A connectivity check tied to a candidate pair.
    Check { pair: usize },
    /// A periodic Binding indication on the selected pair, keeping the NAT
    /// binding alive once the agent has completed.
    /// Never retransmitted or marked finished; `bookkeeping` just reschedules
    /// it `STUN_KEEPALIVE_PERIOD` out with a fresh transaction id each time.
    Keepalive { pair: usize },
}

/// One outstanding (or retired) STUN transaction.
///
/// `armed` is the only field touched outside the worker thread's own
/// bookkeeping pass: the public `send`/nomination paths flip it to request
/// an immediate (re)transmission without taking the agent mutex.
pub struct StunEntry {
    pub kind: StunEntryKind,
    pub target: SocketAddr,
    pub transaction_id: TransactionId,
    pub next_transmission: Instant,
    pub retransmission_timeout: Duration,
    pub retransmissions: u32,
    pub finished: bool,
    /// Whether this entry's most recent (re)transmission advertised
    /// ICE-CONTROLLING. Lets a 487 response be ignored as stale once the
    /// agent has since resolved its role from the other direction, rather
    /// than flipping back and forth in a race (see `handle_response`).
    pub role_at_send: Option<bool>,
    armed: AtomicBool,
}

impl StunEntry {
    pub fn new(kind: StunEntryKind, target: SocketAddr, initial_rto: Duration, now: Instant) -> Self {
        StunEntry {
            kind,
            target,
            transaction_id: TransactionId::random(),
            next_transmission: now,
            retransmission_timeout: initial_rto,
            retransmissions: 0,
            finished: false,
            role_at_send: None,
            armed: AtomicBool::new(true),
        }
    }

    /// Requests an immediate (re)transmission on the next worker wakeup.
    /// Idempotent: calling it repeatedly before the worker consumes the
    /// flag has no additional effect.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Consumes the arm request, if any was pending. Only the worker thread
    /// calls this.
    pub fn take_armed(&self) -> bool {
        self.armed.swap(false, Ordering::SeqCst)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Arms the next retransmission using the CURRENT timeout, then doubles
    /// it for the retry after that. Returns `false` once the retry budget
    /// (`max_retransmissions`) is exhausted; the caller marks the entry
    /// finished/failed in that case.
    ///
    /// Order matters: the next send is `now + (the RTO that was already in
    /// effect)`, not `now + (the doubled RTO)` — doubling first would delay
    /// every retransmission by one extra RTO against the schedule STUN
    /// clients converge on (0, 500, 1500, 3500, ... from a 500ms initial RTO).
    ///
    /// Retries are bounded by count alone, not by an absolute millisecond
    /// ceiling: doubling five times from a 500ms RTO reaches 16s for the
    /// final wait, well short of any such cap mattering.
    pub fn schedule_retransmission(&mut self, max_retransmissions: u32, now: Instant) -> bool {
        if self.retransmissions >= max_retransmissions {
            return false;
        }
        self.retransmissions += 1;
        self.next_transmission = now + self.retransmission_timeout;
        self.retransmission_timeout *= 2;
        true
    }

    pub fn mark_finished(&mut self) {
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_is_idempotent_until_consumed() {
        let entry = StunEntry::new(
            StunEntryKind::Server,
            "127.0.0.1:3478".parse().unwrap(),
            Duration::from_millis(500),
            Instant::now(),
        );
        assert!(entry.take_armed());
        assert!(!entry.take_armed());
        entry.arm();
        entry.arm();
        assert!(entry.take_armed());
        assert!(!entry.take_armed());
    }

    #[test]
    fn retransmission_schedules_next_send_before_doubling() {
        let start = Instant::now();
        let mut entry = StunEntry::new(
            StunEntryKind::Check { pair: 0 },
            "127.0.0.1:3478".parse().unwrap(),
            Duration::from_millis(500),
            start,
        );
        // Initial transmission happens at offset 0 (entry.next_transmission
        // starts at `now` in `new`); every subsequent send offset below is
        // relative to that same `start`.
        let mut offsets_ms = Vec::new();
        let mut now = start;
        while entry.schedule_retransmission(5, now) {
            offsets_ms.push(entry.next_transmission.duration_since(start).as_millis() as u64);
            now = entry.next_transmission;
        }
        assert_eq!(offsets_ms, vec![500, 1500, 3500, 7500, 15500]);
        assert!(!entry.schedule_retransmission(5, now));
    }
}
