//! Client profile: the long-lived signed payload binding an instance tag,
//! the Ed448 identity and forging keys, the supported versions and an
//! expiration date, optionally chained to a legacy DSA identity.
//!
//! Wire layout (positional): instance tag (INT), flags (BYTE), identity
//! key H (POINT), forging key (POINT), versions (DATA, ASCII digits),
//! expiration (LONG, UNIX seconds), optional DSA key (MPI p,q,g,y),
//! signature over all preceding bytes (114 bytes), optional transitional
//! DSA signature over H's encoding (40 bytes).

use ed448_goldilocks::EdwardsPoint;

use dl_otr_crypto::ed448::{self, LongTermKeyPair, SIGNATURE_LENGTH};
use dl_otr_crypto::legacy::sha1;
use dl_otr_proto::encode::{Reader, Writer};
use dl_otr_proto::message::{MIN_INSTANCE_TAG, VERSION_3, VERSION_4};

use crate::error::OtrError;
use crate::keys::{DsaKeyPair, DsaPublicKey, DSA_SIGNATURE_LENGTH};

const FLAG_DSA_KEY: u8 = 0x01;
const FLAG_TRANSITIONAL_SIG: u8 = 0x02;

/// Default profile lifetime: two weeks.
pub const DEFAULT_LIFETIME_SECS: u64 = 14 * 24 * 3600;

#[derive(Clone)]
pub struct ClientProfile {
    pub instance_tag: u32,
    pub identity_key: EdwardsPoint,
    pub forging_key: EdwardsPoint,
    pub versions: Vec<u16>,
    pub expiration: u64,
    pub dsa_key: Option<DsaPublicKey>,
    pub signature: [u8; SIGNATURE_LENGTH],
    pub transitional_sig: Option<[u8; DSA_SIGNATURE_LENGTH]>,
}

impl ClientProfile {
    /// Build and sign a fresh profile. Providing `dsa` binds the legacy
    /// identity with a transitional signature over H's encoding.
    pub fn sign(
        instance_tag: u32,
        long_term: &LongTermKeyPair,
        forging: &LongTermKeyPair,
        versions: &[u16],
        expiration: u64,
        dsa: Option<&DsaKeyPair>,
    ) -> Result<Self, OtrError> {
        let mut profile = Self {
            instance_tag,
            identity_key: *long_term.public(),
            forging_key: *forging.public(),
            versions: versions.to_vec(),
            expiration,
            dsa_key: dsa.map(|d| d.public()),
            signature: [0u8; SIGNATURE_LENGTH],
            transitional_sig: None,
        };
        if let Some(dsa) = dsa {
            let digest = sha1(&ed448::encode_point(long_term.public()));
            profile.transitional_sig = Some(dsa.sign_prehash_bytes(&digest)?);
        }
        profile.signature = long_term.sign(&profile.signable_bytes());
        Ok(profile)
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.dsa_key.is_some() {
            flags |= FLAG_DSA_KEY;
        }
        if self.transitional_sig.is_some() {
            flags |= FLAG_TRANSITIONAL_SIG;
        }
        flags
    }

    /// Everything the Ed448 signature covers.
    fn signable_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(self.instance_tag);
        w.write_u8(self.flags());
        w.write_point(&ed448::encode_point(&self.identity_key));
        w.write_point(&ed448::encode_point(&self.forging_key));
        w.write_data(&versions_bytes(&self.versions));
        w.write_u64(self.expiration);
        if let Some(dsa) = &self.dsa_key {
            dsa.write(&mut w);
        }
        w.into_bytes()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_raw(&self.signable_bytes());
        w.write_raw(&self.signature);
        if let Some(sig) = &self.transitional_sig {
            w.write_raw(sig);
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OtrError> {
        let mut r = Reader::new(bytes);
        let instance_tag = r.read_u32()?;
        let flags = r.read_u8()?;
        let identity_key = ed448::decode_point(&r.read_point()?)?;
        let forging_key = ed448::decode_point(&r.read_point()?)?;
        let versions = parse_versions(&r.read_data()?)?;
        let expiration = r.read_u64()?;
        let dsa_key = if flags & FLAG_DSA_KEY != 0 {
            Some(DsaPublicKey::read(&mut r)?)
        } else {
            None
        };
        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature.copy_from_slice(r.read_raw(SIGNATURE_LENGTH)?);
        let transitional_sig = if flags & FLAG_TRANSITIONAL_SIG != 0 {
            let mut sig = [0u8; DSA_SIGNATURE_LENGTH];
            sig.copy_from_slice(r.read_raw(DSA_SIGNATURE_LENGTH)?);
            Some(sig)
        } else {
            None
        };
        r.expect_end()?;
        Ok(Self {
            instance_tag,
            identity_key,
            forging_key,
            versions,
            expiration,
            dsa_key,
            signature,
            transitional_sig,
        })
    }

    /// Full validation: self-signature under H, expiry, tag rules,
    /// version list, legacy-key pairing.
    pub fn validate(&self, now: u64) -> Result<(), OtrError> {
        if self.instance_tag < MIN_INSTANCE_TAG {
            return Err(OtrError::Protocol(format!(
                "profile instance tag {} is reserved",
                self.instance_tag
            )));
        }
        if self.versions.is_empty() {
            return Err(OtrError::Protocol("profile offers no versions".into()));
        }
        if self.expiration <= now {
            return Err(OtrError::Protocol("profile has expired".into()));
        }
        LongTermKeyPair::verify(&self.identity_key, &self.signable_bytes(), &self.signature)
            .map_err(|_| OtrError::Crypto("profile signature invalid".into()))?;
        match (&self.dsa_key, &self.transitional_sig) {
            (None, None) => {}
            (Some(dsa), Some(sig)) => {
                let digest = sha1(&ed448::encode_point(&self.identity_key));
                dsa.verify_prehash_bytes(&digest, sig)?;
            }
            // A claimed legacy identity without its binding signature (or
            // the reverse) is a forgery attempt, not an option.
            _ => {
                return Err(OtrError::Protocol(
                    "profile DSA key and transitional signature must come together".into(),
                ))
            }
        }
        Ok(())
    }

    pub fn supports(&self, version: u16) -> bool {
        self.versions.contains(&version)
    }
}

fn versions_bytes(versions: &[u16]) -> Vec<u8> {
    versions
        .iter()
        .filter_map(|v| match *v {
            VERSION_3 => Some(b'3'),
            VERSION_4 => Some(b'4'),
            _ => None,
        })
        .collect()
}

fn parse_versions(bytes: &[u8]) -> Result<Vec<u16>, OtrError> {
    let mut versions = Vec::with_capacity(bytes.len());
    for b in bytes {
        match b {
            b'3' => versions.push(VERSION_3),
            b'4' => versions.push(VERSION_4),
            other => {
                return Err(OtrError::Protocol(format!(
                    "unrecognised version digit {:?}",
                    char::from(*other)
                )))
            }
        }
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn fresh_profile(dsa: Option<&DsaKeyPair>) -> (ClientProfile, LongTermKeyPair) {
        let long_term = LongTermKeyPair::generate();
        let forging = LongTermKeyPair::generate();
        let profile = ClientProfile::sign(
            0x1000,
            &long_term,
            &forging,
            &[VERSION_4, VERSION_3],
            NOW + 3600,
            dsa,
        )
        .unwrap();
        (profile, long_term)
    }

    #[test]
    fn encode_decode_validate() {
        let (profile, _) = fresh_profile(None);
        let decoded = ClientProfile::decode(&profile.encode()).unwrap();
        decoded.validate(NOW).unwrap();
        assert_eq!(decoded.instance_tag, 0x1000);
        assert_eq!(decoded.versions, vec![VERSION_4, VERSION_3]);
    }

    #[test]
    fn with_transitional_dsa() {
        let dsa = DsaKeyPair::generate();
        let (profile, _) = fresh_profile(Some(&dsa));
        let decoded = ClientProfile::decode(&profile.encode()).unwrap();
        decoded.validate(NOW).unwrap();
        assert!(decoded.dsa_key.is_some());
        assert!(decoded.transitional_sig.is_some());
    }

    #[test]
    fn expired_profile_rejected() {
        let (profile, _) = fresh_profile(None);
        assert!(profile.validate(NOW + 7200).is_err());
    }

    #[test]
    fn tampered_profile_rejected() {
        let (profile, _) = fresh_profile(None);
        let mut bytes = profile.encode();
        // Flip a bit in the versions field, deep enough to miss the tag.
        let n = bytes.len();
        bytes[n - SIGNATURE_LENGTH - 10] ^= 0x01;
        match ClientProfile::decode(&bytes) {
            Ok(decoded) => assert!(decoded.validate(NOW).is_err()),
            Err(_) => {}
        }
    }

    #[test]
    fn dsa_key_without_transitional_sig_rejected() {
        let dsa = DsaKeyPair::generate();
        let (mut profile, long_term) = fresh_profile(Some(&dsa));
        profile.transitional_sig = None;
        profile.signature = long_term.sign(&profile.signable_bytes());
        assert!(profile.validate(NOW).is_err());
    }

    #[test]
    fn reserved_tag_rejected() {
        let long_term = LongTermKeyPair::generate();
        let forging = LongTermKeyPair::generate();
        let profile = ClientProfile::sign(42, &long_term, &forging, &[VERSION_4], NOW + 3600, None)
            .unwrap();
        assert!(profile.validate(NOW).is_err());
    }
}
