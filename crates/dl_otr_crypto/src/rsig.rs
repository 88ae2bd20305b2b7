//! Three-member ring signatures over Ed448.
//!
//! A signature proves that the holder of ONE of the three ring keys signed
//! the message, without revealing which. The construction is a split
//! Schnorr challenge: the signer simulates the two other members with
//! random (challenge, response) pairs, commits honestly for itself, and
//! binds the three challenges to the transcript hash so that
//! `c1 + c2 + c3 = H(ring || commitments || msg)`.
//!
//! Verification recomputes each commitment as `T_i = r_i·G + c_i·A_i` and
//! checks the challenge sum. Any party that later learns (or discloses) a
//! ring secret can forge such a signature, which is the point.

use ed448_goldilocks::{EdwardsPoint, EdwardsScalar as Scalar};
use zeroize::Zeroize;

use crate::ed448::{
    decode_scalar, encode_point, encode_scalar, hash_to_scalar, random_scalar, zero_scalar,
    LongTermKeyPair, POINT_LENGTH, SCALAR_LENGTH,
};
use crate::error::CryptoError;
use crate::kdf::usage;

pub const RING_SIZE: usize = 3;
pub const RSIG_LENGTH: usize = 6 * SCALAR_LENGTH;

/// σ = (c1, r1, c2, r2, c3, r3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingSignature {
    pub c: [Scalar; RING_SIZE],
    pub r: [Scalar; RING_SIZE],
}

impl RingSignature {
    pub fn to_bytes(&self) -> [u8; RSIG_LENGTH] {
        let mut out = [0u8; RSIG_LENGTH];
        for i in 0..RING_SIZE {
            let off = i * 2 * SCALAR_LENGTH;
            out[off..off + SCALAR_LENGTH].copy_from_slice(&encode_scalar(&self.c[i]));
            out[off + SCALAR_LENGTH..off + 2 * SCALAR_LENGTH]
                .copy_from_slice(&encode_scalar(&self.r[i]));
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != RSIG_LENGTH {
            return Err(CryptoError::RingSignature);
        }
        let mut c = [zero_scalar(); RING_SIZE];
        let mut r = [zero_scalar(); RING_SIZE];
        for i in 0..RING_SIZE {
            let off = i * 2 * SCALAR_LENGTH;
            c[i] = decode_scalar(&bytes[off..off + SCALAR_LENGTH])
                .map_err(|_| CryptoError::RingSignature)?;
            r[i] = decode_scalar(&bytes[off + SCALAR_LENGTH..off + 2 * SCALAR_LENGTH])
                .map_err(|_| CryptoError::RingSignature)?;
        }
        Ok(Self { c, r })
    }
}

fn ring_challenge(
    ring: &[EdwardsPoint; RING_SIZE],
    commitments: &[EdwardsPoint; RING_SIZE],
    msg: &[u8],
) -> Scalar {
    let mut transcript = Vec::with_capacity(6 * POINT_LENGTH + msg.len());
    for key in ring {
        transcript.extend_from_slice(&encode_point(key));
    }
    for t in commitments {
        transcript.extend_from_slice(&encode_point(t));
    }
    transcript.extend_from_slice(msg);
    let c = hash_to_scalar(usage::RING_CHALLENGE, &transcript);
    transcript.zeroize();
    c
}

/// Sign `msg` under `ring`; `keypair.public()` must be a ring member.
pub fn ring_sign(
    keypair: &LongTermKeyPair,
    ring: &[EdwardsPoint; RING_SIZE],
    msg: &[u8],
) -> Result<RingSignature, CryptoError> {
    let own = encode_point(keypair.public());
    let signer = ring
        .iter()
        .position(|k| encode_point(k) == own)
        .ok_or_else(|| CryptoError::InvalidKey("signer key not in ring".into()))?;

    let mut c = [zero_scalar(); RING_SIZE];
    let mut r = [zero_scalar(); RING_SIZE];
    let mut commitments = [EdwardsPoint::GENERATOR; RING_SIZE];

    // Simulated members: random challenge and response, commitment solved
    // from the verification equation.
    for i in 0..RING_SIZE {
        if i == signer {
            continue;
        }
        c[i] = random_scalar();
        r[i] = random_scalar();
        commitments[i] = EdwardsPoint::GENERATOR * r[i] + ring[i] * c[i];
    }

    // Honest member: fresh commitment.
    let t = random_scalar();
    commitments[signer] = EdwardsPoint::GENERATOR * t;

    let total = ring_challenge(ring, &commitments, msg);
    let mut c_signer = total;
    for i in 0..RING_SIZE {
        if i != signer {
            c_signer = c_signer - c[i];
        }
    }
    c[signer] = c_signer;
    r[signer] = t - c_signer * *keypair.secret();

    Ok(RingSignature { c, r })
}

pub fn ring_verify(
    ring: &[EdwardsPoint; RING_SIZE],
    sig: &RingSignature,
    msg: &[u8],
) -> Result<(), CryptoError> {
    let mut commitments = [EdwardsPoint::GENERATOR; RING_SIZE];
    for i in 0..RING_SIZE {
        commitments[i] = EdwardsPoint::GENERATOR * sig.r[i] + ring[i] * sig.c[i];
    }
    let total = ring_challenge(ring, &commitments, msg);
    let sum = sig.c[0] + sig.c[1] + sig.c[2];
    if crate::kdf::constant_time_equals(&encode_scalar(&sum), &encode_scalar(&total)) {
        Ok(())
    } else {
        Err(CryptoError::RingSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with_signer_at(pos: usize) -> ([EdwardsPoint; RING_SIZE], LongTermKeyPair) {
        let signer = LongTermKeyPair::generate();
        let other1 = LongTermKeyPair::generate();
        let other2 = LongTermKeyPair::generate();
        let mut ring = [*other1.public(), *other2.public(), *other2.public()];
        ring[pos] = *signer.public();
        let mut fill = [*other1.public(), *other2.public()].into_iter();
        for i in 0..RING_SIZE {
            if i != pos {
                ring[i] = fill.next().unwrap();
            }
        }
        (ring, signer)
    }

    #[test]
    fn sign_verify_any_ring_position() {
        for pos in 0..RING_SIZE {
            let (ring, signer) = ring_with_signer_at(pos);
            let sig = ring_sign(&signer, &ring, b"transcript hash").unwrap();
            ring_verify(&ring, &sig, b"transcript hash").unwrap();
        }
    }

    #[test]
    fn rejects_wrong_message() {
        let (ring, signer) = ring_with_signer_at(0);
        let sig = ring_sign(&signer, &ring, b"transcript hash").unwrap();
        assert!(ring_verify(&ring, &sig, b"other transcript").is_err());
    }

    #[test]
    fn rejects_flipped_component_bytes() {
        let (ring, signer) = ring_with_signer_at(1);
        let sig = ring_sign(&signer, &ring, b"transcript hash").unwrap();
        let bytes = sig.to_bytes();
        // Flip the final byte of each of the six components in turn.
        for component in 0..6 {
            let mut tampered = bytes;
            tampered[component * SCALAR_LENGTH + SCALAR_LENGTH - 1] ^= 0x01;
            match RingSignature::from_bytes(&tampered) {
                Ok(sig) => assert!(ring_verify(&ring, &sig, b"transcript hash").is_err()),
                // Non-canonical scalar encodings are rejected at decode.
                Err(_) => {}
            }
        }
    }

    #[test]
    fn signer_must_be_ring_member() {
        let (ring, _) = ring_with_signer_at(0);
        let outsider = LongTermKeyPair::generate();
        assert!(ring_sign(&outsider, &ring, b"m").is_err());
    }
}
