//! End-to-end scenarios over real loopback UDP sockets and the real worker
//! thread (no simulated clock — this crate is threaded, not sans-io, so
//! these tests poll wall-clock state with short sleeps instead of stepping
//! a virtual `now`).

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ice_agent::stun::{Class, Message, MessageBuilder, Method};
use ice_agent::{AgentConfig, AgentState, IceAgent, Role};

fn loopback(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}

fn fast_config() -> AgentConfig {
    AgentConfig {
        initial_rto: Duration::from_millis(100),
        max_retransmissions: 3,
        pacing_time: Duration::from_millis(10),
        keepalive_period: Duration::from_millis(150),
        fail_timeout: Duration::from_secs(2),
        ..AgentConfig::default()
    }
}

/// S1 — host-to-host success: both agents reach `completed` and data sent
/// on the selected pair arrives at the peer's data callback.
#[test]
fn host_to_host_success_and_data_delivery() {
    let _ = env_logger::builder().is_test(true).try_init();

    let controlling = IceAgent::new(loopback(0), fast_config(), Role::Controlling).unwrap();
    let controlled = IceAgent::new(loopback(0), fast_config(), Role::Controlled).unwrap();

    let a_addr = controlling.local_addr().unwrap();
    let b_addr = controlled.local_addr().unwrap();
    controlling.add_host_candidate(a_addr);
    controlled.add_host_candidate(b_addr);

    for line in controlled.local_description() {
        if line.starts_with("a=candidate:") {
            controlling.add_remote_candidate(&line).unwrap();
        } else if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
            controlling.set_remote_description(ufrag.to_string(), String::new());
        }
    }
    for line in controlling.local_description() {
        if line.starts_with("a=candidate:") {
            controlled.add_remote_candidate(&line).unwrap();
        } else if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
            controlled.set_remote_description(ufrag.to_string(), String::new());
        }
    }

    assert!(wait_until(
        || controlling.state() == AgentState::Completed && controlled.state() == AgentState::Completed,
        Duration::from_secs(2),
    ));

    assert!(controlling.selected_candidate_pair().is_some());
    assert!(controlled.selected_candidate_pair().is_some());

    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    controlled.on_data(move |data| {
        received_clone.lock().unwrap().extend_from_slice(data);
    });

    controlling.send(b"hi").unwrap();
    assert!(wait_until(|| !received.lock().unwrap().is_empty(), Duration::from_millis(500)));
    assert_eq!(&*received.lock().unwrap(), b"hi");
}

/// S2 — role conflict: both sides start as controlling; the losing
/// tiebreaker flips to controlled and the connection still completes.
#[test]
fn role_conflict_resolves_and_completes() {
    let _ = env_logger::builder().is_test(true).try_init();

    let a = IceAgent::new(loopback(0), fast_config(), Role::Controlling).unwrap();
    let b = IceAgent::new(loopback(0), fast_config(), Role::Controlling).unwrap();

    let a_addr = a.local_addr().unwrap();
    let b_addr = b.local_addr().unwrap();
    a.add_host_candidate(a_addr);
    b.add_host_candidate(b_addr);

    for line in b.local_description() {
        if line.starts_with("a=candidate:") {
            a.add_remote_candidate(&line).unwrap();
        } else if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
            a.set_remote_description(ufrag.to_string(), String::new());
        }
    }
    for line in a.local_description() {
        if line.starts_with("a=candidate:") {
            b.add_remote_candidate(&line).unwrap();
        } else if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
            b.set_remote_description(ufrag.to_string(), String::new());
        }
    }

    assert!(wait_until(
        || a.state() == AgentState::Completed && b.state() == AgentState::Completed,
        Duration::from_secs(2),
    ));
}

/// S3 — peer-reflexive learning: the checking side sends from a source
/// address the controlling agent never learned as a remote candidate
/// (simulated with a raw socket standing in for a NAT rebinding). The
/// controlling agent must learn a prflx candidate with the PRIORITY the
/// request carried, form a pair for it, and reply with success; the new
/// pair is then live enough for the controlling agent's own connectivity
/// check to that address to succeed and get nominated/selected, which is
/// only possible once the prflx candidate and pair actually exist.
#[test]
fn peer_reflexive_candidate_is_learned_from_unexpected_source() {
    let _ = env_logger::builder().is_test(true).try_init();

    let controlling = IceAgent::new(loopback(0), fast_config(), Role::Controlling).unwrap();
    let a_addr = controlling.local_addr().unwrap();
    controlling.add_host_candidate(a_addr);

    // A raw socket stands in for the peer's NAT-rebound address: the
    // controlling agent has never heard of it as a remote candidate.
    let peer_socket = UdpSocket::bind(loopback(0)).unwrap();
    let peer_addr = peer_socket.local_addr().unwrap();
    peer_socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

    let remote_ufrag = "peerufrag".to_string();
    let remote_pwd = "peerpwdpeerpwdpeerpwd11".to_string();
    controlling.set_remote_description(remote_ufrag.clone(), remote_pwd.clone());

    let local_description = controlling.local_description();
    let local_ufrag = local_description
        .iter()
        .find_map(|l| l.strip_prefix("a=ice-ufrag:").map(str::to_string))
        .unwrap();
    // Requests are authenticated with the *receiver's* password (RFC 5389
    // short-term credentials): controlling's own, since it's the one
    // verifying this request.
    let local_pwd = local_description
        .iter()
        .find_map(|l| l.strip_prefix("a=ice-pwd:").map(str::to_string))
        .unwrap();

    let peer_priority: u32 = 1_694_498_815;
    let txn = ice_agent::stun::TransactionId::random();
    let mut builder = MessageBuilder::new(Class::Request, Method::Binding, txn);
    builder
        .add_username(&format!("{local_ufrag}:{remote_ufrag}"))
        .add_priority(peer_priority)
        .add_ice_controlled(7)
        .add_message_integrity(local_pwd.as_bytes())
        .add_fingerprint();
    peer_socket.send_to(&builder.finish(), a_addr).unwrap();

    let mut buf = [0u8; 512];
    let (len, from) = peer_socket.recv_from(&mut buf).unwrap();
    assert_eq!(from, a_addr);
    let response = Message::parse(&buf[0..len]).unwrap();
    assert_eq!(response.class, Class::Success);
    assert_eq!(response.transaction_id, txn);
    assert_eq!(response.xor_mapped_address(), Some(peer_addr));

    // Now act as a well-behaved peer for whatever the controlling agent
    // sends next: its own check against the newly learned prflx candidate.
    let stop = Arc::new(AtomicUsize::new(0));
    let stop_clone = stop.clone();
    let peer_thread = std::thread::spawn(move || {
        let mut buf = [0u8; 512];
        while stop_clone.load(Ordering::SeqCst) == 0 {
            if let Ok((len, from)) = peer_socket.recv_from(&mut buf) {
                if let Ok(req) = Message::parse(&buf[0..len]) {
                    if req.class == Class::Request {
                        let mut builder = MessageBuilder::new(Class::Success, Method::Binding, req.transaction_id);
                        builder.add_xor_mapped_address(from);
                        builder.add_message_integrity(remote_pwd.as_bytes());
                        builder.add_fingerprint();
                        let _ = peer_socket.send_to(&builder.finish(), from);
                    }
                }
            }
        }
    });

    assert!(wait_until(
        || controlling.selected_candidate_pair().map(|p| p.remote) == Some(peer_addr),
        Duration::from_secs(1),
    ));

    stop.store(1, Ordering::SeqCst);
    peer_thread.join().unwrap();
}

/// S4 — timeout: gathering succeeds but the remote never answers, so the
/// agent fails once its configured `fail_timeout` elapses.
#[test]
fn unreachable_remote_times_out_to_failed() {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = AgentConfig {
        fail_timeout: Duration::from_millis(300),
        ..fast_config()
    };
    let agent = IceAgent::new(loopback(0), config, Role::Controlling).unwrap();
    let own_addr = agent.local_addr().unwrap();
    agent.add_host_candidate(own_addr);

    // A remote candidate that nothing is listening on, so every check
    // exhausts its retries and the pair (and then the agent) fails.
    let dead_remote = loopback(0);
    let dead_listener = UdpSocket::bind(dead_remote).unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    drop(dead_listener);

    agent
        .add_remote_candidate(&format!(
            "a=candidate:1 1 udp 2130706431 {} {} typ host",
            dead_addr.ip(),
            dead_addr.port()
        ))
        .unwrap();
    agent.set_remote_description("deadufrag".into(), "deadpwd".into());

    assert!(wait_until(|| agent.state() == AgentState::Failed, Duration::from_secs(2)));
}

/// S5 — STUN server reflexive: a mock STUN server replies with a fixed
/// XOR-MAPPED-ADDRESS, which should surface as a server-reflexive
/// candidate in the local description.
#[test]
fn stun_server_reflexive_discovery() {
    let _ = env_logger::builder().is_test(true).try_init();

    let server_socket = UdpSocket::bind(loopback(0)).unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let mapped: SocketAddr = "203.0.113.5:40000".parse().unwrap();

    let stop = Arc::new(AtomicUsize::new(0));
    let stop_clone = stop.clone();
    let server_thread = std::thread::spawn(move || {
        let mut buf = [0u8; 512];
        server_socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        while stop_clone.load(Ordering::SeqCst) == 0 {
            if let Ok((len, from)) = server_socket.recv_from(&mut buf) {
                if let Ok(req) = Message::parse(&buf[0..len]) {
                    let mut builder = MessageBuilder::new(Class::Success, Method::Binding, req.transaction_id);
                    builder.add_xor_mapped_address(mapped);
                    builder.add_fingerprint();
                    let _ = server_socket.send_to(&builder.finish(), from);
                }
            }
        }
    });

    let config = AgentConfig {
        stun_servers: vec![server_addr],
        ..fast_config()
    };
    let agent = IceAgent::new(loopback(0), config, Role::Controlling).unwrap();
    agent.gather_candidates().unwrap();

    assert!(wait_until(
        || agent.local_description().iter().any(|l| l.contains("typ srflx")),
        Duration::from_millis(500),
    ));

    stop.store(1, Ordering::SeqCst);
    server_thread.join().unwrap();
}

/// S6 — keepalive: once completed, the selected pair keeps receiving
/// Binding indications at roughly the configured period. Stands in for
/// the peer with a bare socket that always answers Binding requests with
/// success, so incoming Indications afterward can only be keepalives.
#[test]
fn keepalive_indications_after_completion() {
    let _ = env_logger::builder().is_test(true).try_init();

    let fake_ufrag = "fakeufrag".to_string();
    let fake_pwd = "fakepwdfakepwdfakepwd".to_string();

    let peer_socket = UdpSocket::bind(loopback(0)).unwrap();
    let peer_addr = peer_socket.local_addr().unwrap();
    peer_socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

    let indication_count = Arc::new(AtomicUsize::new(0));
    let indication_count_clone = indication_count.clone();
    let stop = Arc::new(AtomicUsize::new(0));
    let stop_clone = stop.clone();
    let fake_pwd_clone = fake_pwd.clone();

    let peer_thread = std::thread::spawn(move || {
        let mut buf = [0u8; 512];
        while stop_clone.load(Ordering::SeqCst) == 0 {
            if let Ok((len, from)) = peer_socket.recv_from(&mut buf) {
                if let Ok(msg) = Message::parse(&buf[0..len]) {
                    match msg.class {
                        Class::Request => {
                            let mut builder = MessageBuilder::new(Class::Success, Method::Binding, msg.transaction_id);
                            builder.add_xor_mapped_address(from);
                            builder.add_message_integrity(fake_pwd_clone.as_bytes());
                            builder.add_fingerprint();
                            let _ = peer_socket.send_to(&builder.finish(), from);
                        }
                        Class::Indication => {
                            indication_count_clone.fetch_add(1, Ordering::SeqCst);
                        }
                        _ => {}
                    }
                }
            }
        }
    });

    let config = fast_config();
    let keepalive_period = config.keepalive_period;
    let a = IceAgent::new(loopback(0), config, Role::Controlling).unwrap();
    let a_addr = a.local_addr().unwrap();
    a.add_host_candidate(a_addr);
    a.add_remote_candidate(&format!(
        "a=candidate:1 1 udp 2130706431 {} {} typ host",
        peer_addr.ip(),
        peer_addr.port()
    ))
    .unwrap();
    a.set_remote_description(fake_ufrag, fake_pwd);

    assert!(wait_until(|| a.state() == AgentState::Completed, Duration::from_secs(2)));

    let before = indication_count.load(Ordering::SeqCst);
    std::thread::sleep(keepalive_period * 3 + Duration::from_millis(200));
    let after = indication_count.load(Ordering::SeqCst);
    assert!(after - before >= 2, "expected at least two keepalive indications, saw {}", after - before);

    stop.store(1, Ordering::SeqCst);
    peer_thread.join().unwrap();
}
