//! SHAKE-256 usage-tagged key derivation.
//!
//! Every derived value in the protocol is `SHAKE-256("OTRv4" || usage ||
//! input, n)`. The usage byte separates domains; two derivations with
//! different usage bytes never collide even on identical input.

use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake256,
};
use subtle::ConstantTimeEq;

/// Domain prefix mixed into every derivation.
const PREFIX: &[u8] = b"OTRv4";

// ── Usage bytes ──────────────────────────────────────────────────────────────

pub mod usage {
    pub const AUTH_TRANSCRIPT: u8 = 0x00;
    pub const SSID: u8 = 0x01;
    pub const FIRST_ROOT_KEY: u8 = 0x02;
    pub const INITIAL_CHAIN_KEY: u8 = 0x03;
    pub const SHARED_SECRET: u8 = 0x04;
    pub const SMP_SECRET: u8 = 0x05;
    pub const FINGERPRINT: u8 = 0x06;
    pub const SIGNATURE: u8 = 0x07;
    pub const ROOT_KEY: u8 = 0x14;
    pub const CHAIN_KEY: u8 = 0x15;
    pub const NEXT_CHAIN_KEY: u8 = 0x17;
    pub const MESSAGE_KEY: u8 = 0x18;
    pub const MAC_KEY: u8 = 0x19;
    pub const AUTHENTICATOR: u8 = 0x1A;
    pub const NONCE: u8 = 0x1B;
    pub const SMP_SCALAR: u8 = 0x1C;
    pub const RING_CHALLENGE: u8 = 0x1D;
    pub const EXTRA_KEY: u8 = 0x7A;
}

/// Fill `out` with SHAKE-256(PREFIX || usage || data).
pub fn kdf_into(usage: u8, data: &[u8], out: &mut [u8]) {
    let mut reader = Shake256::default()
        .chain(PREFIX)
        .chain([usage])
        .chain(data)
        .finalize_xof();
    reader.read(out);
}

pub fn kdf(usage: u8, data: &[u8], n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    kdf_into(usage, data, &mut out);
    out
}

pub fn kdf_32(usage: u8, data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    kdf_into(usage, data, &mut out);
    out
}

pub fn kdf_64(usage: u8, data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    kdf_into(usage, data, &mut out);
    out
}

pub fn kdf_24(usage: u8, data: &[u8]) -> [u8; 24] {
    let mut out = [0u8; 24];
    kdf_into(usage, data, &mut out);
    out
}

/// Compare two byte strings in time dependent only on their lengths.
/// Slices of unequal length compare unequal without inspecting contents.
pub fn constant_time_equals(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdf_is_deterministic() {
        let a = kdf(usage::MESSAGE_KEY, b"chain key material", 32);
        let b = kdf(usage::MESSAGE_KEY, b"chain key material", 32);
        assert_eq!(a, b);
    }

    #[test]
    fn usage_byte_separates_domains() {
        let a = kdf(usage::MESSAGE_KEY, b"same input", 64);
        let b = kdf(usage::MAC_KEY, b"same input", 64);
        assert_ne!(a, b);
    }

    #[test]
    fn constant_time_equals_semantics() {
        assert!(constant_time_equals(b"abc", b"abc"));
        assert!(!constant_time_equals(b"abc", b"abd"));
        assert!(!constant_time_equals(b"abc", b"abcd"));
        assert!(constant_time_equals(b"", b""));
    }
}
