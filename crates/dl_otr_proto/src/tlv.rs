//! TLV records carried inside decrypted data-message payloads.
//!
//! Payload layout: human-readable bytes, a NUL separator, then zero or
//! more `type (SHORT) | length (SHORT) | value` records.

use rand::{rngs::OsRng, RngCore};

use crate::error::ProtoError;

pub mod tlv_type {
    pub const PADDING: u16 = 0;
    pub const DISCONNECT: u16 = 1;
    pub const SMP1: u16 = 2;
    pub const SMP2: u16 = 3;
    pub const SMP3: u16 = 4;
    pub const SMP4: u16 = 5;
    pub const SMP_ABORT: u16 = 6;
    pub const EXTRA_KEY: u16 = 7;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tlv_type: u16, value: Vec<u8>) -> Self {
        Self { tlv_type, value }
    }

    /// Padding filled with random bytes so ciphertext length reveals less.
    pub fn padding(len: usize) -> Self {
        let mut value = vec![0u8; len.min(u16::MAX as usize)];
        OsRng.fill_bytes(&mut value);
        Self { tlv_type: tlv_type::PADDING, value }
    }
}

pub fn encode_tlvs(tlvs: &[Tlv]) -> Vec<u8> {
    let mut out = Vec::new();
    for tlv in tlvs {
        out.extend_from_slice(&tlv.tlv_type.to_be_bytes());
        out.extend_from_slice(&(tlv.value.len() as u16).to_be_bytes());
        out.extend_from_slice(&tlv.value);
    }
    out
}

pub fn decode_tlvs(mut bytes: &[u8]) -> Result<Vec<Tlv>, ProtoError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            return Err(ProtoError::TlvTruncated);
        }
        let tlv_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + len {
            return Err(ProtoError::TlvTruncated);
        }
        out.push(Tlv::new(tlv_type, bytes[4..4 + len].to_vec()));
        bytes = &bytes[4 + len..];
    }
    Ok(out)
}

/// message || NUL || TLVs.
pub fn encode_payload(text: &[u8], tlvs: &[Tlv]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 1);
    out.extend_from_slice(text);
    out.push(0);
    out.extend_from_slice(&encode_tlvs(tlvs));
    out
}

pub fn decode_payload(bytes: &[u8]) -> Result<(Vec<u8>, Vec<Tlv>), ProtoError> {
    match bytes.iter().position(|&b| b == 0) {
        Some(nul) => Ok((bytes[..nul].to_vec(), decode_tlvs(&bytes[nul + 1..])?)),
        None => Ok((bytes.to_vec(), Vec::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip() {
        let tlvs = vec![
            Tlv::new(tlv_type::DISCONNECT, vec![]),
            Tlv::new(tlv_type::SMP1, vec![1, 2, 3]),
        ];
        let bytes = encode_payload(b"hello", &tlvs);
        let (text, decoded) = decode_payload(&bytes).unwrap();
        assert_eq!(text, b"hello");
        assert_eq!(decoded, tlvs);
    }

    #[test]
    fn bare_text_has_no_tlvs() {
        let (text, tlvs) = decode_payload(b"no separator").unwrap();
        assert_eq!(text, b"no separator");
        assert!(tlvs.is_empty());
    }

    #[test]
    fn truncated_tlv_rejected() {
        let mut bytes = encode_payload(b"x", &[Tlv::new(tlv_type::SMP2, vec![9; 8])]);
        bytes.truncate(bytes.len() - 1);
        assert!(decode_payload(&bytes).is_err());
    }

    #[test]
    fn padding_is_bounded() {
        let tlv = Tlv::padding(100_000);
        assert_eq!(tlv.value.len(), u16::MAX as usize);
    }
}
