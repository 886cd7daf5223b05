//! STUN/ICE attribute type codes and the XOR-MAPPED-ADDRESS transform.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::header::{TransactionId, MAGIC_COOKIE};

pub const MAPPED_ADDRESS: u16 = 0x0001;
pub const USERNAME: u16 = 0x0006;
pub const MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ERROR_CODE: u16 = 0x0009;
pub const UNKNOWN_ATTRIBUTES: u16 = 0x000a;
pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const PRIORITY: u16 = 0x0024;
pub const USE_CANDIDATE: u16 = 0x0025;
pub const SOFTWARE: u16 = 0x8022;
pub const FINGERPRINT: u16 = 0x8028;
pub const ICE_CONTROLLED: u16 = 0x8029;
pub const ICE_CONTROLLING: u16 = 0x802A;

const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

/// Encodes a (MAPPED-ADDRESS-shaped) socket address attribute value.
pub fn encode_mapped_address(addr: SocketAddr) -> Vec<u8> {
    encode_address_attr(addr, |b, _| b.to_vec())
}

/// Encodes the XOR-MAPPED-ADDRESS value: port xored with the top 16 bits of
/// the magic cookie, address xored with cookie (+transaction id for v6).
pub fn encode_xor_mapped_address(addr: SocketAddr, txn: &TransactionId) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    match addr.ip() {
        IpAddr::V4(v4) => {
            let mut out = vec![0u8, FAMILY_V4];
            let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
            out.extend_from_slice(&xport.to_be_bytes());
            let octets = v4.octets();
            for i in 0..4 {
                out.push(octets[i] ^ cookie[i]);
            }
            out
        }
        IpAddr::V6(v6) => {
            let mut out = vec![0u8, FAMILY_V6];
            let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
            out.extend_from_slice(&xport.to_be_bytes());
            let mut pad = [0u8; 16];
            pad[0..4].copy_from_slice(&cookie);
            pad[4..16].copy_from_slice(&txn.0);
            let octets = v6.octets();
            for i in 0..16 {
                out.push(octets[i] ^ pad[i]);
            }
            out
        }
    }
}

fn encode_address_attr(addr: SocketAddr, xor: impl Fn(&[u8], u8) -> Vec<u8>) -> Vec<u8> {
    match addr.ip() {
        IpAddr::V4(v4) => {
            let mut out = vec![0u8, FAMILY_V4];
            out.extend_from_slice(&addr.port().to_be_bytes());
            out.extend_from_slice(&xor(&v4.octets(), FAMILY_V4));
            out
        }
        IpAddr::V6(v6) => {
            let mut out = vec![0u8, FAMILY_V6];
            out.extend_from_slice(&addr.port().to_be_bytes());
            out.extend_from_slice(&xor(&v6.octets(), FAMILY_V6));
            out
        }
    }
}

pub fn decode_mapped_address(value: &[u8]) -> Option<SocketAddr> {
    decode_address_attr(value, false, None)
}

pub fn decode_xor_mapped_address(value: &[u8], txn: &TransactionId) -> Option<SocketAddr> {
    decode_address_attr(value, true, Some(txn))
}

fn decode_address_attr(value: &[u8], xored: bool, txn: Option<&TransactionId>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let cookie = MAGIC_COOKIE.to_be_bytes();
    if xored {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    match family {
        f if f == FAMILY_V4 => {
            if value.len() < 8 {
                return None;
            }
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xored {
                for i in 0..4 {
                    octets[i] ^= cookie[i];
                }
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        f if f == FAMILY_V6 => {
            if value.len() < 20 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xored {
                let mut pad = [0u8; 16];
                pad[0..4].copy_from_slice(&cookie);
                if let Some(txn) = txn {
                    pad[4..16].copy_from_slice(&txn.0);
                }
                for i in 0..16 {
                    octets[i] ^= pad[i];
                }
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::header::TransactionId;

    #[test]
    fn xor_mapped_address_v4_roundtrip() {
        let txn = TransactionId::random();
        let addr: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let encoded = encode_xor_mapped_address(addr, &txn);
        let decoded = decode_xor_mapped_address(&encoded, &txn).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn xor_mapped_address_v6_roundtrip() {
        let txn = TransactionId::random();
        let addr: SocketAddr = "[2001:db8::1]:12345".parse().unwrap();
        let encoded = encode_xor_mapped_address(addr, &txn);
        let decoded = decode_xor_mapped_address(&encoded, &txn).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn mapped_address_is_not_obfuscated() {
        let addr: SocketAddr = "198.51.100.7:9".parse().unwrap();
        let encoded = encode_mapped_address(addr);
        // raw IP bytes appear verbatim, unlike XOR-MAPPED-ADDRESS
        assert_eq!(&encoded[4..8], &[198, 51, 100, 7]);
        assert_eq!(decode_mapped_address(&encoded).unwrap(), addr);
    }
}
