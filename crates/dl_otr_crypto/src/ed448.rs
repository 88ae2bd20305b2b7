//! Ed448 point and scalar handling.
//!
//! Encodings are fixed by the wire protocol: points are 57 bytes
//! (compressed Edwards y), scalars are 57 bytes little-endian. Ephemeral
//! ECDH secrets are "pruned" before use: bottom two bits cleared, top bit
//! of byte 55 set, byte 56 zeroed. Pruning is idempotent.
//!
//! Long-term keys sign with a Schnorr signature over the same group,
//! using the SHAKE-256 challenge derivation from `kdf`. The secret scalar
//! is expanded from a 57-byte seed exactly as the Ed448 signing key
//! expansion does, so the public point doubles as a verification key for
//! both ordinary and ring signatures.

use ed448_goldilocks::{AffinePoint, CompressedEdwardsY, EdwardsPoint, EdwardsScalar as Scalar, EdwardsScalarBytes as ScalarBytes, WideEdwardsScalarBytes as WideScalarBytes};
use rand::{rngs::OsRng, RngCore};
use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake256,
};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::kdf::{self, usage};

pub const POINT_LENGTH: usize = 57;
pub const SCALAR_LENGTH: usize = 57;
pub const SEED_LENGTH: usize = 57;
pub const SIGNATURE_LENGTH: usize = 114;
pub const FINGERPRINT_LENGTH: usize = 56;

// ── Encoding ─────────────────────────────────────────────────────────────────

pub fn encode_point(point: &EdwardsPoint) -> [u8; POINT_LENGTH] {
    let mut out = [0u8; POINT_LENGTH];
    out.copy_from_slice(point.to_affine().compress().as_bytes());
    out
}

/// The zero scalar, built through the byte decoder to stay off any
/// version-specific constant.
pub(crate) fn zero_scalar() -> Scalar {
    Scalar::from_bytes_mod_order(&ScalarBytes::default())
}

/// Encoding of the identity element, used to reject degenerate inputs.
fn identity_bytes() -> [u8; POINT_LENGTH] {
    encode_point(&(EdwardsPoint::GENERATOR * zero_scalar()))
}

/// Decode a 57-byte compressed point. Rejects non-canonical encodings and
/// the identity (no valid protocol field carries it).
pub fn decode_point(bytes: &[u8]) -> Result<EdwardsPoint, CryptoError> {
    let arr: [u8; POINT_LENGTH] = bytes.try_into().map_err(|_| CryptoError::InvalidPoint)?;
    if arr == identity_bytes() {
        return Err(CryptoError::InvalidPoint);
    }
    Option::<AffinePoint>::from(CompressedEdwardsY(arr).decompress())
        .map(EdwardsPoint::from)
        .ok_or(CryptoError::InvalidPoint)
}

pub fn encode_scalar(scalar: &Scalar) -> [u8; SCALAR_LENGTH] {
    let mut out = [0u8; SCALAR_LENGTH];
    out.copy_from_slice(&scalar.to_bytes_rfc_8032());
    out
}

/// Decode a 57-byte little-endian scalar. Rejects non-canonical values.
pub fn decode_scalar(bytes: &[u8]) -> Result<Scalar, CryptoError> {
    if bytes.len() != SCALAR_LENGTH {
        return Err(CryptoError::InvalidScalar);
    }
    Option::<Scalar>::from(Scalar::from_canonical_bytes(ScalarBytes::from_slice(bytes)))
        .ok_or(CryptoError::InvalidScalar)
}

// ── Scalar generation ────────────────────────────────────────────────────────

/// Prune a 57-byte secret: clear the two lowest bits, zero the last byte,
/// set the top bit of byte 55.
pub fn clamp(bytes: &mut [u8; SCALAR_LENGTH]) {
    bytes[0] &= 0xFC;
    bytes[56] = 0;
    bytes[55] |= 0x80;
}

/// Uniform random scalar via wide reduction.
pub fn random_scalar() -> Scalar {
    let mut wide = WideScalarBytes::default();
    OsRng.fill_bytes(&mut wide);
    let scalar = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();
    scalar
}

/// Map arbitrary bytes onto a scalar through the usage-tagged KDF.
pub fn hash_to_scalar(usage: u8, data: &[u8]) -> Scalar {
    let mut wide = WideScalarBytes::default();
    kdf::kdf_into(usage, data, &mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

// ── Ephemeral ECDH key pair ──────────────────────────────────────────────────

/// One ratchet generation's ECDH key pair. `close()` wipes the secret;
/// any use after that is a hard error rather than silent key reuse.
pub struct EcdhKeyPair {
    secret: Scalar,
    public: EdwardsPoint,
    closed: bool,
}

impl EcdhKeyPair {
    pub fn generate() -> Self {
        let mut seed = [0u8; SCALAR_LENGTH];
        OsRng.fill_bytes(&mut seed);
        clamp(&mut seed);
        let secret = Scalar::from_bytes_mod_order(ScalarBytes::from_slice(&seed));
        seed.zeroize();
        let public = EdwardsPoint::GENERATOR * secret;
        Self { secret, public, closed: false }
    }

    pub fn public(&self) -> &EdwardsPoint {
        &self.public
    }

    pub fn public_bytes(&self) -> [u8; POINT_LENGTH] {
        encode_point(&self.public)
    }

    /// ECDH against a peer point: 57-byte encoding of `their * secret`.
    pub fn shared_secret(&self, their: &EdwardsPoint) -> Result<[u8; POINT_LENGTH], CryptoError> {
        if self.closed {
            return Err(CryptoError::KeyPairClosed);
        }
        let shared = encode_point(&(*their * self.secret));
        if shared == identity_bytes() {
            return Err(CryptoError::InvalidPoint);
        }
        Ok(shared)
    }

    pub fn close(&mut self) {
        self.secret.zeroize();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for EcdhKeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

// ── Long-term key pair ───────────────────────────────────────────────────────

/// Long-term (or forging) Ed448 key pair. Held by the host for the process
/// lifetime; the engine borrows it and never mutates it.
pub struct LongTermKeyPair {
    seed: [u8; SEED_LENGTH],
    secret: Scalar,
    public: EdwardsPoint,
}

impl LongTermKeyPair {
    pub fn generate() -> Self {
        let mut seed = [0u8; SEED_LENGTH];
        OsRng.fill_bytes(&mut seed);
        let pair = Self::from_seed(&seed);
        seed.zeroize();
        pair
    }

    /// Expand a 57-byte seed the way Ed448 signing keys do: SHAKE-256 of
    /// the seed, first 57 bytes pruned and reduced mod the group order.
    pub fn from_seed(seed: &[u8; SEED_LENGTH]) -> Self {
        let mut wide = WideScalarBytes::default();
        let mut reader = Shake256::default().chain(seed).finalize_xof();
        reader.read(&mut wide);
        let mut scalar_bytes = [0u8; SCALAR_LENGTH];
        scalar_bytes.copy_from_slice(&wide[..SCALAR_LENGTH]);
        clamp(&mut scalar_bytes);
        let secret = Scalar::from_bytes_mod_order(ScalarBytes::from_slice(&scalar_bytes));
        scalar_bytes.zeroize();
        wide.zeroize();
        let public = EdwardsPoint::GENERATOR * secret;
        Self { seed: *seed, secret, public }
    }

    pub fn seed(&self) -> &[u8; SEED_LENGTH] {
        &self.seed
    }

    pub fn public(&self) -> &EdwardsPoint {
        &self.public
    }

    pub fn public_bytes(&self) -> [u8; POINT_LENGTH] {
        encode_point(&self.public)
    }

    pub(crate) fn secret(&self) -> &Scalar {
        &self.secret
    }

    /// Schnorr signature: `R = rG`, `s = r + c·a` with
    /// `c = H(usage::SIGNATURE, R || A || msg)`. 114 bytes on the wire.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        let r = random_scalar();
        let big_r = EdwardsPoint::GENERATOR * r;
        let c = challenge(&big_r, &self.public, msg);
        let s = r + c * self.secret;
        let mut sig = [0u8; SIGNATURE_LENGTH];
        sig[..SCALAR_LENGTH].copy_from_slice(&encode_point(&big_r));
        sig[SCALAR_LENGTH..].copy_from_slice(&encode_scalar(&s));
        sig
    }

    pub fn verify(
        public: &EdwardsPoint,
        msg: &[u8],
        sig: &[u8],
    ) -> Result<(), CryptoError> {
        if sig.len() != SIGNATURE_LENGTH {
            return Err(CryptoError::SignatureVerification);
        }
        let big_r = decode_point(&sig[..SCALAR_LENGTH])
            .map_err(|_| CryptoError::SignatureVerification)?;
        let s = decode_scalar(&sig[SCALAR_LENGTH..])
            .map_err(|_| CryptoError::SignatureVerification)?;
        let c = challenge(&big_r, public, msg);
        if EdwardsPoint::GENERATOR * s == big_r + *public * c {
            Ok(())
        } else {
            Err(CryptoError::SignatureVerification)
        }
    }
}

impl Drop for LongTermKeyPair {
    fn drop(&mut self) {
        self.seed.zeroize();
        self.secret.zeroize();
    }
}

fn challenge(big_r: &EdwardsPoint, public: &EdwardsPoint, msg: &[u8]) -> Scalar {
    let mut transcript = Vec::with_capacity(2 * POINT_LENGTH + msg.len());
    transcript.extend_from_slice(&encode_point(big_r));
    transcript.extend_from_slice(&encode_point(public));
    transcript.extend_from_slice(msg);
    hash_to_scalar(usage::SIGNATURE, &transcript)
}

/// 56-byte public-key fingerprint for out-of-band comparison.
pub fn fingerprint(public: &EdwardsPoint) -> [u8; FINGERPRINT_LENGTH] {
    let mut out = [0u8; FINGERPRINT_LENGTH];
    kdf::kdf_into(usage::FINGERPRINT, &encode_point(public), &mut out);
    out
}

/// Hex fingerprint grouped for display, eight hex chars per group.
pub fn fingerprint_display(public: &EdwardsPoint) -> String {
    let hex = hex::encode(fingerprint(public));
    hex.as_bytes()
        .chunks(8)
        .map(|c| std::str::from_utf8(c).unwrap_or_default().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
