//! Version 3 compatibility path.
//!
//! The legacy protocol keeps its own crypto suite: 1536-bit MODP DH,
//! AES-128-CTR, HMAC-SHA1/SHA-256 and DSA long-term keys. Nothing here is
//! shared with the version 4 engine beyond the session plumbing.

pub mod ake;
pub mod data;

use num_bigint::BigUint;
use rand::{rngs::OsRng, RngCore};

use dl_otr_crypto::dh3072::{modp1536, validate_public, GENERATOR};

use crate::error::OtrError;

/// Exponent width for the 1536-bit group.
pub const DH_SECRET_LENGTH: usize = 40;

/// One generation of the legacy DH ratchet.
#[derive(Clone)]
pub struct DhPair {
    pub secret: BigUint,
    pub public: BigUint,
}

impl DhPair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; DH_SECRET_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        let secret = BigUint::from_bytes_be(&bytes);
        let public = BigUint::from(GENERATOR).modpow(&secret, modp1536());
        Self { secret, public }
    }

    pub fn shared_secret(&self, their: &BigUint) -> Result<BigUint, OtrError> {
        validate_public(their, modp1536())?;
        Ok(their.modpow(&self.secret, modp1536()))
    }
}
