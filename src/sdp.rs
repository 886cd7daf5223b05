//! Parsing and serializing the single SDP construct this core understands:
//! the `a=candidate` attribute line (RFC 5245 §15.1 / RFC 8839 §5.1).
//!
//! This is not an SDP library: it knows nothing about `m=`/`c=` lines,
//! session-level attributes, or offer/answer bundling. Callers that need a
//! full SDP body own that layer and hand individual candidate lines (and
//! the `ice-ufrag`/`ice-pwd` values) to this core.

use std::net::SocketAddr;

use crate::addr::AddrRecord;
use crate::candidate::{Candidate, CandidateKind};
use crate::error::IceError;

/// `candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> [raddr <addr> rport <port>]`
pub fn format_candidate_line(candidate: &Candidate, component: u8) -> String {
    let mut line = format!(
        "candidate:{} {} udp {} {} {} typ {}",
        candidate.foundation,
        component,
        candidate.priority,
        candidate.addr.ip(),
        candidate.addr.port(),
        candidate.kind.as_str(),
    );
    if let Some(related) = candidate.related_addr {
        line.push_str(&format!(" raddr {} rport {}", related.ip(), related.port()));
    }
    line
}

/// Parses a `candidate:` attribute line into a remote [`Candidate`].
///
/// Accepts the line with or without the leading `a=` and/or `candidate:`
/// prefix, since callers may hand this either a bare value or a full SDP
/// attribute line.
pub fn parse_candidate_line(line: &str) -> Result<Candidate, IceError> {
    let line = line
        .trim()
        .trim_start_matches("a=")
        .trim_start_matches("candidate:");

    let mut fields = line.split_ascii_whitespace();

    let foundation = fields
        .next()
        .ok_or_else(|| IceError::InvalidArgument("candidate line missing foundation".into()))?
        .to_string();

    let _component: u8 = fields
        .next()
        .ok_or_else(|| IceError::InvalidArgument("candidate line missing component".into()))?
        .parse()
        .map_err(|_| IceError::InvalidArgument("candidate line has non-numeric component".into()))?;

    let transport = fields
        .next()
        .ok_or_else(|| IceError::InvalidArgument("candidate line missing transport".into()))?;
    if !transport.eq_ignore_ascii_case("udp") {
        return Err(IceError::InvalidArgument(format!("unsupported transport {transport}")));
    }

    let priority: u32 = fields
        .next()
        .ok_or_else(|| IceError::InvalidArgument("candidate line missing priority".into()))?
        .parse()
        .map_err(|_| IceError::InvalidArgument("candidate line has non-numeric priority".into()))?;

    let address = fields
        .next()
        .ok_or_else(|| IceError::InvalidArgument("candidate line missing address".into()))?;

    let port: u16 = fields
        .next()
        .ok_or_else(|| IceError::InvalidArgument("candidate line missing port".into()))?
        .parse()
        .map_err(|_| IceError::InvalidArgument("candidate line has non-numeric port".into()))?;

    let socket_addr: SocketAddr = format!("{address}:{port}")
        .parse()
        .map_err(|_| IceError::InvalidArgument(format!("invalid candidate address {address}")))?;

    let typ_kw = fields.next();
    if typ_kw != Some("typ") {
        return Err(IceError::InvalidArgument("candidate line missing 'typ' keyword".into()));
    }
    let typ_str = fields
        .next()
        .ok_or_else(|| IceError::InvalidArgument("candidate line missing candidate type".into()))?;
    let kind = CandidateKind::from_str(typ_str)
        .ok_or_else(|| IceError::InvalidArgument(format!("unsupported candidate type {typ_str}")))?;

    let mut related_addr = None;
    let mut raddr = None;
    let mut rport = None;
    while let Some(token) = fields.next() {
        match token {
            "raddr" => {
                raddr = fields.next();
            }
            "rport" => {
                rport = fields.next().and_then(|p| p.parse::<u16>().ok());
            }
            _ => {}
        }
    }
    if let (Some(raddr), Some(rport)) = (raddr, rport) {
        if let Ok(addr) = format!("{raddr}:{rport}").parse::<SocketAddr>() {
            related_addr = Some(AddrRecord::from(addr));
        }
    }

    Ok(Candidate::from_remote(kind, AddrRecord::from(socket_addr), priority, foundation, related_addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_candidate_line() {
        let c = parse_candidate_line("candidate:1 1 udp 2130706431 192.0.2.1 9000 typ host").unwrap();
        assert_eq!(c.kind, CandidateKind::Host);
        assert_eq!(c.priority, 2130706431);
        assert_eq!(c.addr.0.to_string(), "192.0.2.1:9000");
        assert_eq!(c.foundation, "1");
    }

    #[test]
    fn parses_srflx_with_related_address() {
        let c = parse_candidate_line(
            "a=candidate:2 1 udp 1694498815 203.0.113.1 9000 typ srflx raddr 192.0.2.1 rport 9000",
        )
        .unwrap();
        assert_eq!(c.kind, CandidateKind::ServerReflexive);
        assert_eq!(c.related_addr.unwrap().0.to_string(), "192.0.2.1:9000");
    }

    #[test]
    fn rejects_non_udp_transport() {
        assert!(parse_candidate_line("candidate:1 1 tcp 2130706431 192.0.2.1 9000 typ host").is_err());
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse_candidate_line("candidate:1 1 udp").is_err());
    }

    #[test]
    fn format_then_parse_roundtrips_core_fields() {
        let addr: SocketAddr = "198.51.100.2:4000".parse().unwrap();
        let candidate = Candidate::new_host(AddrRecord::from(addr), 0);
        let line = format_candidate_line(&candidate, 1);
        let parsed = parse_candidate_line(&line).unwrap();
        assert_eq!(parsed.addr, candidate.addr);
        assert_eq!(parsed.priority, candidate.priority);
        assert_eq!(parsed.kind, candidate.kind);
    }
}
