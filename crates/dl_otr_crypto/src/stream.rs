//! XSalsa20 data-message cipher.
//!
//! Message keys are 32 bytes; nonces are 24 bytes and arrive from the
//! caller (the ratchet derives them deterministically from the message
//! coordinates, so a key/nonce pair is never reused).

use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::XSalsa20;

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 24;

/// Encrypt or decrypt in one pass (the keystream is its own inverse).
pub fn xsalsa20(key: &[u8; KEY_LENGTH], nonce: &[u8; NONCE_LENGTH], data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let mut cipher = XSalsa20::new(key.into(), nonce.into());
    cipher.apply_keystream(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_roundtrip() {
        let key = [9u8; KEY_LENGTH];
        let nonce = [4u8; NONCE_LENGTH];
        let ct = xsalsa20(&key, &nonce, b"attack at dawn");
        assert_ne!(ct.as_slice(), b"attack at dawn");
        let pt = xsalsa20(&key, &nonce, &ct);
        assert_eq!(pt.as_slice(), b"attack at dawn");
    }

    #[test]
    fn distinct_nonces_give_distinct_streams() {
        let key = [9u8; KEY_LENGTH];
        let a = xsalsa20(&key, &[0u8; NONCE_LENGTH], &[0u8; 32]);
        let b = xsalsa20(&key, &[1u8; NONCE_LENGTH], &[0u8; 32]);
        assert_ne!(a, b);
    }
}
