//! Version 3 compatibility primitives: AES-128-CTR, HMAC-SHA1/SHA-256 and
//! the plain digests. The v3 wire format fixes all of these; none of them
//! appear anywhere in the version 4 path.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// AES-128-CTR with the 8-byte wire counter in the top half of the block;
/// the low half starts at zero and increments.
pub fn aes128_ctr(key: &[u8; 16], top_half: &[u8; 8], data: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(top_half);
    let mut out = data.to_vec();
    let mut cipher = Aes128Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut out);
    out
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// SHA-256 over a single prefix byte followed by `data`; the v3 key
/// derivations are all of this shape.
pub fn sha256_prefixed(prefix: u8, data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    Digest::update(&mut h, [prefix]);
    Digest::update(&mut h, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&h.finalize());
    out
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// First 160 bits of HMAC-SHA256; the v3 AKE MACs are truncated this way.
pub fn hmac_sha256_160(key: &[u8], data: &[u8]) -> [u8; 20] {
    let full = hmac_sha256(key, data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&full[..20]);
    out
}

pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctr_roundtrip() {
        let key = [1u8; 16];
        let ctr = [2u8; 8];
        let ct = aes128_ctr(&key, &ctr, b"legacy payload");
        assert_ne!(ct.as_slice(), b"legacy payload");
        assert_eq!(aes128_ctr(&key, &ctr, &ct).as_slice(), b"legacy payload");
    }

    #[test]
    fn ctr_counter_separates_streams() {
        let key = [1u8; 16];
        let a = aes128_ctr(&key, &[0u8; 8], &[0u8; 32]);
        let b = aes128_ctr(&key, &[1u8; 8], &[0u8; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn sha1_known_vector() {
        // SHA-1("abc")
        assert_eq!(
            hex::encode(sha1(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn hmac_truncation_is_prefix() {
        let full = hmac_sha256(b"key", b"data");
        let short = hmac_sha256_160(b"key", b"data");
        assert_eq!(&full[..20], &short[..]);
    }
}
