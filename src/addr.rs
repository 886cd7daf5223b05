//! Address record used throughout the candidate/pair/STUN tables.
//!
//! This wraps [`SocketAddr`] rather than replacing it: family, raw address
//! bytes, port and scope id are exactly what [`SocketAddr`] already models
//! in the standard library, so the wrapper only adds the classification
//! helpers the agent needs (link-local checks, v4/v6 mapping).

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// A transport address, equality-compared on family + address + port.
///
/// `AddrRecord` is a thin newtype over [`SocketAddr`] (which already carries
/// an IPv6 scope id via [`std::net::SocketAddrV6::scope_id`]) plus the
/// address-family classification ICE needs when forming candidate pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrRecord(pub SocketAddr);

impl AddrRecord {
    pub fn new(addr: SocketAddr) -> Self {
        AddrRecord(addr)
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn is_loopback(&self) -> bool {
        self.0.ip().is_loopback()
    }

    pub fn is_unspecified(&self) -> bool {
        self.0.ip().is_unspecified()
    }

    /// True for IPv4, IPv4-mapped-IPv6 and 6to4/Teredo-style addresses that
    /// should not be treated as distinct v6 candidates (RFC 8445 §5.1.1.1
    /// excludes these from being gathered as separate candidates).
    pub fn is_ipv4_like_v6(&self) -> bool {
        match self.0.ip() {
            IpAddr::V4(_) => false,
            IpAddr::V6(v6) => is_ipv4_mapped(&v6) || v6.to_ipv4().is_some(),
        }
    }

    pub fn is_link_local(&self) -> bool {
        match self.0.ip() {
            IpAddr::V4(v4) => v4.is_link_local(),
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        }
    }

    /// Same address family and "link-localness" — RFC 8445 §4.1.1.1 forbids
    /// pairing a link-local candidate with a routable one of the same family.
    pub fn compatible_family(&self, other: &AddrRecord) -> bool {
        match (self.0.ip(), other.0.ip()) {
            (IpAddr::V4(_), IpAddr::V4(_)) => self.is_link_local() == other.is_link_local(),
            (IpAddr::V6(_), IpAddr::V6(_)) => self.is_link_local() == other.is_link_local(),
            _ => false,
        }
    }
}

impl From<SocketAddr> for AddrRecord {
    fn from(addr: SocketAddr) -> Self {
        AddrRecord(addr)
    }
}

impl std::fmt::Display for AddrRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn is_ipv4_mapped(v6: &Ipv6Addr) -> bool {
    let seg = v6.segments();
    seg[0] == 0 && seg[1] == 0 && seg[2] == 0 && seg[3] == 0 && seg[4] == 0 && seg[5] == 0xffff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_family_addr_port() {
        let a: AddrRecord = "127.0.0.1:1234".parse::<SocketAddr>().unwrap().into();
        let b: AddrRecord = "127.0.0.1:1234".parse::<SocketAddr>().unwrap().into();
        let c: AddrRecord = "127.0.0.1:1235".parse::<SocketAddr>().unwrap().into();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn link_local_classification() {
        let ll: AddrRecord = "169.254.1.1:0".parse::<SocketAddr>().unwrap().into();
        let routable: AddrRecord = "10.0.0.1:0".parse::<SocketAddr>().unwrap().into();
        assert!(ll.is_link_local());
        assert!(!routable.is_link_local());
        assert!(!ll.compatible_family(&routable));
    }
}
