//! Modular Diffie-Hellman over the RFC 3526 groups.
//!
//! The ratchet's slow DH runs in the 3072-bit group (id 15); the legacy
//! version 3 path uses the 1536-bit group (id 5). Generator is 2 for both.
//!
//! Secrets are 80-byte random exponents. `close()` replaces the exponent
//! with zero; big-integer heap storage cannot be wiped in place, so the
//! value is dropped as early as possible instead.

use std::sync::OnceLock;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::{rngs::OsRng, RngCore};

use crate::error::CryptoError;

pub const GENERATOR: u32 = 2;
pub const SECRET_LENGTH: usize = 80;
/// Byte width of a 3072-bit shared secret, left-padded.
pub const SHARED_LENGTH: usize = 384;

const MODP_3072_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF",
);

const MODP_1536_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF",
);

pub fn modp3072() -> &'static BigUint {
    static P: OnceLock<BigUint> = OnceLock::new();
    P.get_or_init(|| BigUint::parse_bytes(MODP_3072_HEX.as_bytes(), 16).expect("fixed constant"))
}

pub fn modp1536() -> &'static BigUint {
    static P: OnceLock<BigUint> = OnceLock::new();
    P.get_or_init(|| BigUint::parse_bytes(MODP_1536_HEX.as_bytes(), 16).expect("fixed constant"))
}

/// Reject public values outside `[2, p-2]`.
pub fn validate_public(public: &BigUint, p: &BigUint) -> Result<(), CryptoError> {
    let two = BigUint::from(2u32);
    if public < &two || public > &(p - &two) {
        return Err(CryptoError::DhPublicOutOfRange);
    }
    Ok(())
}

/// Serialise to a fixed big-endian width, left-padded with zeros.
pub fn to_fixed_bytes(value: &BigUint, width: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    let mut out = vec![0u8; width.saturating_sub(raw.len())];
    out.extend_from_slice(&raw);
    out
}

// ── 3072-bit key pair ────────────────────────────────────────────────────────

/// One slow-ratchet generation's DH key pair (created on every third
/// rotation).
pub struct DhKeyPair {
    secret: BigUint,
    public: BigUint,
    closed: bool,
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        let secret = BigUint::from_bytes_be(&bytes);
        let public = BigUint::from(GENERATOR).modpow(&secret, modp3072());
        Self { secret, public, closed: false }
    }

    pub fn public(&self) -> &BigUint {
        &self.public
    }

    /// `their^secret mod p`, fixed at 384 bytes.
    pub fn shared_secret(&self, their: &BigUint) -> Result<Vec<u8>, CryptoError> {
        if self.closed {
            return Err(CryptoError::KeyPairClosed);
        }
        validate_public(their, modp3072())?;
        let shared = their.modpow(&self.secret, modp3072());
        Ok(to_fixed_bytes(&shared, SHARED_LENGTH))
    }

    pub fn close(&mut self) {
        self.secret = BigUint::zero();
        self.closed = true;
    }
}

impl Drop for DhKeyPair {
    fn drop(&mut self) {
        self.secret = BigUint::zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moduli_have_expected_widths() {
        assert_eq!(modp3072().bits(), 3072);
        assert_eq!(modp1536().bits(), 1536);
    }

    #[test]
    fn dh_is_symmetric() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        let k_ab = a.shared_secret(b.public()).unwrap();
        let k_ba = b.shared_secret(a.public()).unwrap();
        assert_eq!(k_ab, k_ba);
        assert_eq!(k_ab.len(), SHARED_LENGTH);
    }

    #[test]
    fn rejects_degenerate_publics() {
        let a = DhKeyPair::generate();
        assert!(a.shared_secret(&BigUint::one()).is_err());
        assert!(a.shared_secret(&(modp3072() - BigUint::one())).is_err());
    }

    #[test]
    fn closed_pair_refuses_dh() {
        let mut a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        a.close();
        assert!(matches!(
            a.shared_secret(b.public()),
            Err(CryptoError::KeyPairClosed)
        ));
    }
}
