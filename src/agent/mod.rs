//! Public agent surface: construction, control operations, and the worker
//! thread they talk to.
//!
//! An [`IceAgent`] owns one UDP socket and one background worker thread.
//! Every control operation below takes the agent mutex just long enough to
//! mutate the shared tables, then lets the worker's own bookkeeping pass
//! (woken via [`AgentSocket::waker`]) do the actual network I/O.

pub mod description;
pub mod inner;
pub mod state;
mod worker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use log::debug;

use crate::candidate::{Candidate, CandidateKind};
use crate::config::AgentConfig;
use crate::entry::{StunEntry, StunEntryKind};
use crate::error::{IceError, Result};
use crate::sdp::parse_candidate_line;
use crate::socket::AgentSocket;

pub use description::{IceCredentials, IceDescription};
pub use state::{AgentState, Role};

use inner::{AgentInner, DataCallback, StateCallback};
use worker::Worker;

/// A connected pair of local/remote addresses, as reported by
/// [`IceAgent::selected_candidate_pair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedPair {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// An ICE agent for a single component, bound to one UDP socket.
///
/// Construct with [`IceAgent::new`], call [`IceAgent::gather_candidates`] to
/// start, exchange descriptions with the remote side via
/// [`IceAgent::set_remote_description`]/[`IceAgent::add_remote_candidate`],
/// then send data once [`IceAgent::state`] reaches `connected`.
pub struct IceAgent {
    inner: Arc<Mutex<AgentInner>>,
    socket: Arc<AgentSocket>,
    selected_entry: Arc<AtomicUsize>,
    selected_target: Arc<RwLock<Option<SocketAddr>>>,
    stop: Arc<AtomicBool>,
    worker_handle: Option<JoinHandle<()>>,
}

impl IceAgent {
    /// Binds a UDP socket on `bind_addr` (use `0.0.0.0:0`/`[::]:0` for an
    /// OS-assigned ephemeral port) and starts the worker thread. The agent
    /// starts in `disconnected`; call [`IceAgent::gather_candidates`] to
    /// begin.
    pub fn new(bind_addr: SocketAddr, config: AgentConfig, role: Role) -> Result<Self> {
        let (socket, waiter) = AgentSocket::bind(bind_addr)?;
        let socket = Arc::new(socket);
        let inner = Arc::new(Mutex::new(AgentInner::new(config, role)));
        let selected_entry = Arc::new(AtomicUsize::new(0));
        let selected_target = Arc::new(RwLock::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            inner: inner.clone(),
            socket: socket.clone(),
            waiter,
            selected_entry: selected_entry.clone(),
            selected_target: selected_target.clone(),
            stop: stop.clone(),
        };
        let worker_handle = std::thread::Builder::new()
            .name("ice-agent".into())
            .spawn(move || worker.run())
            .map_err(IceError::Io)?;

        Ok(IceAgent {
            inner,
            socket,
            selected_entry,
            selected_target,
            stop,
            worker_handle: Some(worker_handle),
        })
    }

    /// Registers a callback invoked from the worker thread on every state
    /// transition.
    pub fn on_state_change<F: Fn(AgentState) + Send + 'static>(&self, cb: F) {
        self.inner.lock().unwrap().on_state_change = Some(Box::new(cb) as StateCallback);
    }

    /// Registers a callback invoked from the worker thread for every
    /// application datagram received on the selected pair.
    pub fn on_data<F: Fn(&[u8]) + Send + 'static>(&self, cb: F) {
        self.inner.lock().unwrap().on_data = Some(Box::new(cb) as DataCallback);
    }

    /// Enumerates local interface addresses, creates a host candidate for
    /// each (subject to `MAX_HOST_CANDIDATES`), and arms a SERVER binding
    /// entry per configured STUN server. Returns immediately; candidates
    /// appear as gathering completes (trickle-compatible, see
    /// [`IceAgent::local_description`]).
    pub fn gather_candidates(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.set_state(AgentState::Gathering);

        let local_addr = self.socket.local_addr()?;
        for ip in local_interface_addrs() {
            if ip.is_loopback() && !local_addr.ip().is_loopback() {
                continue;
            }
            let addr: SocketAddr = SocketAddr::new(ip, local_addr.port());
            let record: crate::addr::AddrRecord = addr.into();
            if record.is_link_local() || record.is_ipv4_like_v6() {
                continue;
            }
            let count = inner
                .local
                .candidates
                .iter()
                .filter(|c| c.kind == CandidateKind::Host)
                .count() as u32;
            inner.add_local_candidate(Candidate::new_host(addr.into(), count));
        }
        if inner.local.candidates.is_empty() {
            inner.add_local_candidate(Candidate::new_host(local_addr.into(), 0));
        }

        let mut servers = inner.config.stun_servers.clone();
        servers.truncate(crate::config::MAX_STUN_SERVER_RECORDS);
        if servers.is_empty() {
            inner.local.gathering_done = true;
            inner.maybe_advance_from_gathering();
        }
        for server in servers {
            inner.register_server_entry();
            let entry = StunEntry::new(StunEntryKind::Server, server, inner.config.initial_rto, std::time::Instant::now());
            inner.push_entry(entry);
        }

        drop(inner);
        let _ = self.socket.waker().wake();
        Ok(())
    }

    /// Renders the local description's SDP lines (`ice-ufrag`, `ice-pwd`,
    /// one `candidate` line per known local candidate). Safe to call
    /// repeatedly as gathering trickles in more candidates.
    pub fn local_description(&self) -> Vec<String> {
        self.inner.lock().unwrap().local.to_sdp_lines()
    }

    /// Installs the remote ufrag/pwd, replacing any previously set remote
    /// credentials. Existing remote candidates (if any) are kept.
    pub fn set_remote_description(&self, ufrag: String, pwd: String) {
        let mut inner = self.inner.lock().unwrap();
        let remote = inner
            .remote
            .get_or_insert_with(|| IceDescription::new(IceCredentials { ufrag: ufrag.clone(), pwd: pwd.clone() }));
        remote.credentials = IceCredentials { ufrag, pwd };
        inner.on_remote_description_set();
        drop(inner);
        let _ = self.socket.waker().wake();
    }

    /// Parses and adds a single `a=candidate:...` SDP line from the remote
    /// side, forming pairs against every known local candidate.
    pub fn add_remote_candidate(&self, sdp_line: &str) -> Result<()> {
        let candidate = parse_candidate_line(sdp_line)?;
        let mut inner = self.inner.lock().unwrap();
        let added = inner.add_remote_candidate(candidate).is_some();
        drop(inner);
        if !added {
            return Err(IceError::Full("remote candidate table full".into()));
        }
        let _ = self.socket.waker().wake();
        Ok(())
    }

    /// Adds a remote candidate directly, bypassing SDP parsing. Exposed for
    /// test harnesses that construct candidates in-process.
    pub fn add_remote_candidate_raw(&self, candidate: Candidate) {
        let mut inner = self.inner.lock().unwrap();
        inner.add_remote_candidate(candidate);
        drop(inner);
        let _ = self.socket.waker().wake();
    }

    /// Adds a local host candidate directly, bypassing interface
    /// enumeration. Exposed for test harnesses that want deterministic
    /// loopback addresses instead of whatever `gather_candidates` finds.
    pub fn add_host_candidate(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.set_state(AgentState::Gathering);
        let count = inner
            .local
            .candidates
            .iter()
            .filter(|c| c.kind == CandidateKind::Host)
            .count() as u32;
        inner.add_local_candidate(Candidate::new_host(addr.into(), count));
        if inner.config.stun_servers.is_empty() {
            inner.local.gathering_done = true;
            inner.maybe_advance_from_gathering();
        }
        drop(inner);
        let _ = self.socket.waker().wake();
    }

    /// Marks the remote side's gathering as complete. Without this, an
    /// agent that never hears of more remote candidates still transitions
    /// out of `gathering` once *local* gathering finishes, since trickle
    /// ICE allows connecting with a partial remote candidate set; this
    /// just mirrors the peer's own signal into the local description.
    pub fn set_remote_gathering_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(remote) = &mut inner.remote {
            remote.gathering_done = true;
        }
    }

    /// Sends an application datagram on the selected candidate pair.
    /// Fails with [`IceError::InvalidState`] before a pair has been
    /// selected. This is the lock-free fast path: it only touches the
    /// atomic `selected_entry`/`selected_target` published by the worker,
    /// never the agent mutex.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if self.selected_entry.load(Ordering::SeqCst) == 0 {
            return Err(IceError::InvalidState("no selected candidate pair yet".into()));
        }
        let target = *self.selected_target.read().unwrap();
        let Some(target) = target else {
            return Err(IceError::InvalidState("no selected candidate pair yet".into()));
        };
        self.socket.send_to(data, target)?;
        Ok(())
    }

    pub fn state(&self) -> AgentState {
        self.inner.lock().unwrap().state
    }

    /// The local/remote address pair the agent has settled on, once one
    /// has been selected (`completed` state or later).
    pub fn selected_candidate_pair(&self) -> Option<SelectedPair> {
        let inner = self.inner.lock().unwrap();
        let pair_idx = inner.selected_pair?;
        let pair = &inner.pairs[pair_idx];
        let local = inner.local.candidates[pair.local].addr.0;
        let remote = inner.remote.as_ref()?.candidates[pair.remote].addr.0;
        Some(SelectedPair { local, remote })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Drop for IceAgent {
    /// Stops and joins the worker thread so callers can't forget to tear it
    /// down explicitly.
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.socket.waker().wake();
        if let Some(handle) = self.worker_handle.take() {
            debug!("joining ice agent worker thread");
            let _ = handle.join();
        }
    }
}

/// Enumerates non-loopback local interface addresses for host candidate
/// gathering. Falls back to an empty list (the caller then falls back to
/// the bound wildcard address) if enumeration fails, e.g. in a sandboxed
/// environment without `/proc/net` access.
fn local_interface_addrs() -> Vec<std::net::IpAddr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(ifaces) => ifaces.into_iter().map(|(_, addr)| addr).collect(),
        Err(err) => {
            debug!("interface enumeration failed, falling back to bound address: {err}");
            Vec::new()
        }
    }
}
