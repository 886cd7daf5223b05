//! STUN message parsing and building (RFC 5389 §6, RFC 8445 ICE attributes).

use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::SocketAddr;

use super::attribute::{
    self, ERROR_CODE, FINGERPRINT, ICE_CONTROLLED, ICE_CONTROLLING, MAPPED_ADDRESS,
    MESSAGE_INTEGRITY, PRIORITY, SOFTWARE, UNKNOWN_ATTRIBUTES, USE_CANDIDATE, USERNAME,
    XOR_MAPPED_ADDRESS,
};
use super::header::{decode_type, encode_type, Class, Method, HEADER_LEN, MAGIC_COOKIE, TransactionId};
use crate::error::IceError;

type HmacSha1 = Hmac<Sha1>;

const FINGERPRINT_XOR: u32 = 0x5354_554e;

struct RawAttr {
    typ: u16,
    /// byte offset of the attribute's type field within the parsed buffer
    start: usize,
    value: Vec<u8>,
}

/// A parsed, read-only STUN message.
pub struct Message {
    pub class: Class,
    pub method: Method,
    pub transaction_id: TransactionId,
    raw: Vec<u8>,
    attrs: Vec<RawAttr>,
}

impl Message {
    /// Parses and structurally validates a STUN message header and
    /// attributes (RFC 5389 §6/§15). Does not itself verify MESSAGE-INTEGRITY (the
    /// caller supplies the key, see [`Message::verify_message_integrity`]);
    /// FINGERPRINT, if present, is required to be the last attribute and is
    /// verified eagerly.
    pub fn parse(buf: &[u8]) -> Result<Self, IceError> {
        if buf.len() < HEADER_LEN {
            return Err(IceError::Protocol("STUN message shorter than header".into()));
        }
        if buf[0] & 0xC0 != 0 {
            return Err(IceError::Protocol("top two bits of STUN header must be zero".into()));
        }
        let type_bits = u16::from_be_bytes([buf[0], buf[1]]);
        let (class, method) = decode_type(type_bits)
            .ok_or_else(|| IceError::Protocol("unsupported STUN method".into()))?;

        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if HEADER_LEN + length != buf.len() {
            return Err(IceError::Protocol("STUN length field does not match buffer".into()));
        }

        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(IceError::Protocol("bad STUN magic cookie".into()));
        }

        let mut txn = [0u8; 12];
        txn.copy_from_slice(&buf[8..20]);
        let transaction_id = TransactionId::from_bytes(txn);

        let mut attrs = Vec::new();
        let mut offset = HEADER_LEN;
        let mut seen_fingerprint = false;
        while offset < buf.len() {
            if seen_fingerprint {
                return Err(IceError::Protocol("FINGERPRINT must be the last attribute".into()));
            }
            if offset + 4 > buf.len() {
                return Err(IceError::Protocol("truncated attribute header".into()));
            }
            let typ = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let val_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let val_start = offset + 4;
            if val_start + val_len > buf.len() {
                return Err(IceError::Protocol("truncated attribute value".into()));
            }
            let value = buf[val_start..val_start + val_len].to_vec();
            let padded = (val_len + 3) / 4 * 4;

            if typ == FINGERPRINT {
                seen_fingerprint = true;
                let expected = crc32fast::hash(&buf[0..offset]) ^ FINGERPRINT_XOR;
                if value.len() != 4 || u32::from_be_bytes([value[0], value[1], value[2], value[3]]) != expected {
                    return Err(IceError::Protocol("FINGERPRINT mismatch".into()));
                }
            }

            attrs.push(RawAttr { typ, start: offset, value });
            offset = val_start + padded;
        }

        Ok(Message {
            class,
            method,
            transaction_id,
            raw: buf.to_vec(),
            attrs,
        })
    }

    fn find(&self, typ: u16) -> Option<&RawAttr> {
        self.attrs.iter().find(|a| a.typ == typ)
    }

    pub fn has_fingerprint(&self) -> bool {
        self.find(FINGERPRINT).is_some()
    }

    pub fn username(&self) -> Option<String> {
        self.find(USERNAME)
            .and_then(|a| String::from_utf8(a.value.clone()).ok())
    }

    pub fn priority(&self) -> Option<u32> {
        self.find(PRIORITY)
            .filter(|a| a.value.len() == 4)
            .map(|a| u32::from_be_bytes([a.value[0], a.value[1], a.value[2], a.value[3]]))
    }

    pub fn ice_controlling(&self) -> Option<u64> {
        self.find(ICE_CONTROLLING).filter(|a| a.value.len() == 8).map(read_u64)
    }

    pub fn ice_controlled(&self) -> Option<u64> {
        self.find(ICE_CONTROLLED).filter(|a| a.value.len() == 8).map(read_u64)
    }

    pub fn use_candidate(&self) -> bool {
        self.find(USE_CANDIDATE).is_some()
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.find(XOR_MAPPED_ADDRESS)
            .and_then(|a| attribute::decode_xor_mapped_address(&a.value, &self.transaction_id))
    }

    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.find(MAPPED_ADDRESS).and_then(|a| attribute::decode_mapped_address(&a.value))
    }

    /// Decodes UNKNOWN-ATTRIBUTES (RFC 5389 §15.9) into the list of
    /// comprehension-required attribute types the peer rejected.
    pub fn unknown_attributes(&self) -> Option<Vec<u16>> {
        let attr = self.find(UNKNOWN_ATTRIBUTES)?;
        Some(attr.value.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
    }

    pub fn error_code(&self) -> Option<(u16, String)> {
        let a = self.find(ERROR_CODE)?;
        if a.value.len() < 4 {
            return None;
        }
        let class = (a.value[2] & 0x07) as u16;
        let number = a.value[3] as u16;
        let reason = String::from_utf8_lossy(&a.value[4..]).into_owned();
        Some((class * 100 + number, reason))
    }

    pub fn software(&self) -> Option<String> {
        self.find(SOFTWARE).and_then(|a| String::from_utf8(a.value.clone()).ok())
    }

    /// Verifies MESSAGE-INTEGRITY against `key`, per the truncate-and-patch
    /// algorithm in RFC 5389 §15.4. Returns `false` if the attribute is absent.
    pub fn verify_message_integrity(&self, key: &[u8]) -> bool {
        let Some(attr) = self.find(MESSAGE_INTEGRITY) else {
            return false;
        };
        if attr.value.len() != 20 {
            return false;
        }
        let attr_start = attr.start;
        let adjusted_len = (attr_start - HEADER_LEN + 24) as u16;
        let mut patched = self.raw[0..attr_start].to_vec();
        patched[2..4].copy_from_slice(&adjusted_len.to_be_bytes());

        let Ok(mut mac) = HmacSha1::new_from_slice(key) else {
            return false;
        };
        mac.update(&patched);
        mac.verify_slice(&attr.value).is_ok()
    }
}

fn read_u64(a: &RawAttr) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&a.value);
    u64::from_be_bytes(b)
}

/// Builds a STUN message attribute-by-attribute in RFC-mandated order:
/// USERNAME, PRIORITY, ICE-CONTROLLED/ICE-CONTROLLING, USE-CANDIDATE,
/// XOR-MAPPED-ADDRESS, ERROR-CODE, MESSAGE-INTEGRITY, FINGERPRINT.
pub struct MessageBuilder {
    transaction_id: TransactionId,
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(class: Class, method: Method, transaction_id: TransactionId) -> Self {
        let mut buf = vec![0u8; HEADER_LEN];
        let type_bits = encode_type(class, method);
        buf[0..2].copy_from_slice(&type_bits.to_be_bytes());
        buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf[8..20].copy_from_slice(&transaction_id.0);
        MessageBuilder { transaction_id, buf }
    }

    fn patch_length(&mut self, len: u16) {
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
    }

    /// Sets the length header to cover everything appended so far plus an
    /// attribute about to be written with the given value length, without
    /// yet writing the attribute's bytes. Used so MESSAGE-INTEGRITY and
    /// FINGERPRINT can be hashed over a buffer whose length field already
    /// reflects their own presence.
    fn begin_attr(&mut self, value_len: usize) {
        let padded = (value_len + 3) / 4 * 4;
        let new_total = (self.buf.len() - HEADER_LEN) + 4 + padded;
        self.patch_length(new_total as u16);
    }

    fn finish_attr(&mut self, typ: u16, value: &[u8]) {
        self.buf.extend_from_slice(&typ.to_be_bytes());
        self.buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        let padded = (value.len() + 3) / 4 * 4;
        self.buf.resize(self.buf.len() + (padded - value.len()), 0);
    }

    fn push_attr(&mut self, typ: u16, value: &[u8]) {
        self.begin_attr(value.len());
        self.finish_attr(typ, value);
    }

    pub fn add_username(&mut self, username: &str) -> &mut Self {
        self.push_attr(USERNAME, username.as_bytes());
        self
    }

    pub fn add_priority(&mut self, priority: u32) -> &mut Self {
        self.push_attr(PRIORITY, &priority.to_be_bytes());
        self
    }

    pub fn add_ice_controlling(&mut self, tiebreaker: u64) -> &mut Self {
        self.push_attr(ICE_CONTROLLING, &tiebreaker.to_be_bytes());
        self
    }

    pub fn add_ice_controlled(&mut self, tiebreaker: u64) -> &mut Self {
        self.push_attr(ICE_CONTROLLED, &tiebreaker.to_be_bytes());
        self
    }

    pub fn add_use_candidate(&mut self) -> &mut Self {
        self.push_attr(USE_CANDIDATE, &[]);
        self
    }

    pub fn add_xor_mapped_address(&mut self, addr: SocketAddr) -> &mut Self {
        let value = attribute::encode_xor_mapped_address(addr, &self.transaction_id);
        self.push_attr(XOR_MAPPED_ADDRESS, &value);
        self
    }

    pub fn add_error_code(&mut self, code: u16, reason: &str) -> &mut Self {
        let class = (code / 100) as u8;
        let number = (code % 100) as u8;
        let mut value = vec![0, 0, class & 0x07, number];
        value.extend_from_slice(reason.as_bytes());
        self.push_attr(ERROR_CODE, &value);
        self
    }

    pub fn add_software(&mut self, software: &str) -> &mut Self {
        self.push_attr(SOFTWARE, software.as_bytes());
        self
    }

    pub fn add_mapped_address(&mut self, addr: SocketAddr) -> &mut Self {
        let value = attribute::encode_mapped_address(addr);
        self.push_attr(MAPPED_ADDRESS, &value);
        self
    }

    /// Appends UNKNOWN-ATTRIBUTES (RFC 5389 §15.9), used on a 420 error
    /// response to list the comprehension-required attribute types that
    /// caused the request to be rejected.
    pub fn add_unknown_attributes(&mut self, types: &[u16]) -> &mut Self {
        let mut value = Vec::with_capacity(types.len() * 2);
        for t in types {
            value.extend_from_slice(&t.to_be_bytes());
        }
        self.push_attr(UNKNOWN_ATTRIBUTES, &value);
        self
    }

    /// Computes HMAC-SHA1 over everything written so far (with the length
    /// header patched to include this attribute) and appends it.
    pub fn add_message_integrity(&mut self, key: &[u8]) -> &mut Self {
        self.begin_attr(20);
        let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
        mac.update(&self.buf);
        let mac = mac.finalize().into_bytes();
        self.finish_attr(MESSAGE_INTEGRITY, &mac);
        self
    }

    /// Computes the CRC-32 fingerprint over everything written so far (with
    /// the length header patched to include this attribute) and appends it.
    /// Must be called last.
    pub fn add_fingerprint(&mut self) -> &mut Self {
        self.begin_attr(4);
        let crc = crc32fast::hash(&self.buf) ^ FINGERPRINT_XOR;
        self.finish_attr(FINGERPRINT, &crc.to_be_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
