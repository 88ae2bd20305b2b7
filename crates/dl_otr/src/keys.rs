//! Legacy DSA key material.
//!
//! The version 3 path signs with 1024/160 DSA, and a version 4 client
//! profile may embed the same public key plus a transitional signature to
//! bind the old identity to the new one. Signatures are 40 bytes on the
//! wire: r and s, 20 bytes big-endian each.

use dsa::{BigUint, Components, KeySize, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use signature::hazmat::{PrehashSigner, PrehashVerifier};

use dl_otr_proto::encode::{Reader, Writer};

use crate::error::OtrError;

pub const DSA_SIGNATURE_LENGTH: usize = 40;

pub struct DsaKeyPair {
    signing: SigningKey,
}

impl DsaKeyPair {
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let components = Components::generate(&mut rng, KeySize::DSA_1024_160);
        let signing = SigningKey::generate(&mut rng, components);
        Self { signing }
    }

    pub fn public(&self) -> DsaPublicKey {
        let verifying = self.signing.verifying_key();
        let components = verifying.components();
        DsaPublicKey {
            p: components.p().clone(),
            q: components.q().clone(),
            g: components.g().clone(),
            y: verifying.y().clone(),
        }
    }

    /// Sign a prehashed message; the digest must already be at most the
    /// group size (SHA-1 or a truncated SHA-256 here).
    pub fn sign_prehash_bytes(&self, digest: &[u8]) -> Result<[u8; DSA_SIGNATURE_LENGTH], OtrError> {
        let sig: Signature = self
            .signing
            .sign_prehash(digest)
            .map_err(|e| OtrError::Crypto(format!("DSA signing failed: {e}")))?;
        let mut out = [0u8; DSA_SIGNATURE_LENGTH];
        copy_fixed(&mut out[..20], &sig.r().to_bytes_be())?;
        copy_fixed(&mut out[20..], &sig.s().to_bytes_be())?;
        Ok(out)
    }
}

fn copy_fixed(dst: &mut [u8], src: &[u8]) -> Result<(), OtrError> {
    if src.len() > dst.len() {
        return Err(OtrError::Crypto("DSA signature component too large".into()));
    }
    let pad = dst.len() - src.len();
    dst[pad..].copy_from_slice(src);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsaPublicKey {
    pub p: BigUint,
    pub q: BigUint,
    pub g: BigUint,
    pub y: BigUint,
}

impl DsaPublicKey {
    pub fn verify_prehash_bytes(&self, digest: &[u8], sig: &[u8]) -> Result<(), OtrError> {
        if sig.len() != DSA_SIGNATURE_LENGTH {
            return Err(OtrError::Crypto("DSA signature must be 40 bytes".into()));
        }
        let components = Components::from_components(self.p.clone(), self.q.clone(), self.g.clone())
            .map_err(|e| OtrError::Crypto(format!("bad DSA parameters: {e}")))?;
        let verifying = VerifyingKey::from_components(components, self.y.clone())
            .map_err(|e| OtrError::Crypto(format!("bad DSA public key: {e}")))?;
        let signature = Signature::from_components(
            BigUint::from_bytes_be(&sig[..20]),
            BigUint::from_bytes_be(&sig[20..]),
        )
        .map_err(|_| OtrError::Crypto("degenerate DSA signature".into()))?;
        verifying
            .verify_prehash(digest, &signature)
            .map_err(|_| OtrError::Crypto("DSA signature verification failed".into()))
    }

    /// MPI-encoded p, q, g, y; the shape both the profile and the v3 AKE
    /// use (v3 additionally prefixes a SHORT key-type of zero).
    pub fn write(&self, w: &mut Writer) {
        w.write_mpi(&self.p.to_bytes_be());
        w.write_mpi(&self.q.to_bytes_be());
        w.write_mpi(&self.g.to_bytes_be());
        w.write_mpi(&self.y.to_bytes_be());
    }

    pub fn read(r: &mut Reader<'_>) -> Result<Self, OtrError> {
        Ok(Self {
            p: BigUint::from_bytes_be(&r.read_mpi()?),
            q: BigUint::from_bytes_be(&r.read_mpi()?),
            g: BigUint::from_bytes_be(&r.read_mpi()?),
            y: BigUint::from_bytes_be(&r.read_mpi()?),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write(&mut w);
        w.into_bytes()
    }
}
