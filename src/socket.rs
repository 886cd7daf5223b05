//! The UDP socket the worker thread owns, plus the interrupt mechanism used
//! to wake a blocked `recv` when the public API arms a STUN entry or asks
//! for the agent to stop.
//!
//! `mio::Waker` is the idiomatic Rust equivalent of a self-pipe: it's backed
//! by one on platforms without a native eventfd, registered into the same
//! [`mio::Poll`] instance as the socket so one blocking call covers both.
//!
//! The socket itself and the `Poll`/`Events` pair that waits on it are kept
//! as two separate types rather than one. [`AgentSocket`] only exposes `&self`
//! methods (send/recv/local_addr/waker) so it can live behind an `Arc` shared
//! between the worker thread and the public [`crate::agent::IceAgent`]
//! handle; [`SocketWaiter`] wraps the `Poll`/`Events` pair that genuinely
//! needs `&mut self` to poll, and is owned exclusively by the worker thread,
//! never shared.

use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Duration;

use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};

const SOCKET_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// The agent's one UDP socket and the wakeup source used to interrupt a
/// blocked [`SocketWaiter::wait`]. Shared behind an `Arc`; every method here
/// takes `&self`.
pub struct AgentSocket {
    socket: MioUdpSocket,
    waker: Waker,
}

/// The `Poll`/`Events` pair that blocks on an [`AgentSocket`]. Owned
/// exclusively by the worker thread: polling needs `&mut self`, so this type
/// is deliberately not `Arc`-shared.
pub struct SocketWaiter {
    poll: Poll,
    events: Events,
}

impl AgentSocket {
    /// Binds a UDP socket to `addr` (use `0.0.0.0:0` to let the OS pick an
    /// ephemeral port on an arbitrary interface) and returns it alongside the
    /// `Poll`/`Events` pair used to wait on it.
    pub fn bind(addr: SocketAddr) -> io::Result<(Self, SocketWaiter)> {
        let std_socket = StdUdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        let mut socket = MioUdpSocket::from_std(std_socket);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let agent_socket = AgentSocket { socket, waker };
        let waiter = SocketWaiter {
            poll,
            events: Events::with_capacity(16),
        };
        Ok((agent_socket, waiter))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The wakeup source: calling `wake()` on it makes a blocked
    /// [`SocketWaiter::wait`] return promptly, even though the waiter itself
    /// lives on another thread.
    pub fn waker(&self) -> &Waker {
        &self.waker
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target)
    }
}

impl SocketWaiter {
    /// Blocks until either the socket becomes readable or `timeout` elapses
    /// (or the waker fires). Returns `true` if the socket is (probably)
    /// readable; a `false` wakeup still requires the caller to re-check its
    /// own deadlines, since this may have returned because of a waker call.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        self.events.clear();
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self.events.iter().any(|e| e.token() == SOCKET_TOKEN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_picks_ephemeral_port_and_sends_to_self() {
        let (a, mut a_wait) = AgentSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let (b, _b_wait) = AgentSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b_addr = b.local_addr().unwrap();

        b.send_to(b"hello", a.local_addr().unwrap()).unwrap();
        assert!(a_wait.wait(Some(Duration::from_secs(2))).unwrap());

        let mut buf = [0u8; 16];
        let (n, from) = a.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[0..n], b"hello");
        assert_eq!(from, b_addr);
    }

    #[test]
    fn waker_interrupts_blocking_wait() {
        let (socket, mut waiter) = AgentSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            socket.waker().wake().unwrap();
        });
        let readable = waiter.wait(Some(Duration::from_secs(5))).unwrap();
        assert!(!readable);
        handle.join().unwrap();
    }
}
