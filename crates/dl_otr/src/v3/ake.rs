//! Legacy four-message authenticated key exchange.
//!
//! D-H Commit, D-H Key, Reveal Signature, Signature. The commitment hides
//! `g^x` behind a random AES key that the committer only reveals after
//! seeing `g^y`, and both sides sign a MAC over the exchanged values with
//! their long-term DSA keys. The query receiver opens with the commit.

use num_bigint::BigUint;
use rand::{rngs::OsRng, RngCore};

use dl_otr_crypto::kdf::constant_time_equals;
use dl_otr_crypto::legacy::{aes128_ctr, hmac_sha256, hmac_sha256_160, sha256, sha256_prefixed};
use dl_otr_proto::encode::{Reader, Writer};
use dl_otr_proto::message::{
    DhCommitMessage, DhKeyMessage, RevealSignatureMessage, SignatureMessage,
};

use crate::error::OtrError;
use crate::keys::{DsaKeyPair, DsaPublicKey, DSA_SIGNATURE_LENGTH};
use crate::v3::data::V3Session;
use crate::v3::DhPair;

/// Secrets derived from the AKE shared secret `s`. The primed values
/// protect the closing Signature message.
struct AkeSecrets {
    ssid: [u8; 8],
    c: [u8; 16],
    c_prime: [u8; 16],
    m1: [u8; 32],
    m2: [u8; 32],
    m1_prime: [u8; 32],
    m2_prime: [u8; 32],
}

fn derive_secrets(s: &BigUint) -> AkeSecrets {
    let mut w = Writer::new();
    w.write_mpi(&s.to_bytes_be());
    let secbytes = w.into_bytes();

    let h0 = sha256_prefixed(0x00, &secbytes);
    let h1 = sha256_prefixed(0x01, &secbytes);
    let mut ssid = [0u8; 8];
    ssid.copy_from_slice(&h0[..8]);
    let mut c = [0u8; 16];
    c.copy_from_slice(&h1[..16]);
    let mut c_prime = [0u8; 16];
    c_prime.copy_from_slice(&h1[16..]);
    AkeSecrets {
        ssid,
        c,
        c_prime,
        m1: sha256_prefixed(0x02, &secbytes),
        m2: sha256_prefixed(0x03, &secbytes),
        m1_prime: sha256_prefixed(0x04, &secbytes),
        m2_prime: sha256_prefixed(0x05, &secbytes),
    }
}

/// In-flight AKE state.
pub enum Ake {
    /// We sent D-H Commit and wait for the peer's `g^y`.
    AwaitingDhKey { x: Box<DhPair>, r: [u8; 16] },
    /// We answered a commit with our `g^y` and wait for the reveal.
    AwaitingRevealSig {
        y: Box<DhPair>,
        encrypted_gx: Vec<u8>,
        hashed_gx: Vec<u8>,
    },
    /// We revealed; the closing Signature message is outstanding.
    AwaitingSig {
        x: Box<DhPair>,
        gy: BigUint,
        secrets: Box<AkeSecretsOpaque>,
    },
}

/// Keeps the derived secrets away from the enum's public face.
pub struct AkeSecretsOpaque(AkeSecrets);

fn mpi_bytes(v: &BigUint) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_mpi(&v.to_bytes_be());
    w.into_bytes()
}

/// Signed portion exchanged inside the encrypted sig blocks:
/// pub key || keyid || DSA signature over the MAC.
fn build_signed_block(
    dsa: &DsaKeyPair,
    m1: &[u8; 32],
    g_ours: &BigUint,
    g_theirs: &BigUint,
    keyid: u32,
) -> Result<Vec<u8>, OtrError> {
    let public = dsa.public();
    let mut mac_input = Writer::new();
    mac_input.write_raw(&mpi_bytes(g_ours));
    mac_input.write_raw(&mpi_bytes(g_theirs));
    mac_input.write_u16(0); // key type: DSA
    public.write(&mut mac_input);
    mac_input.write_u32(keyid);
    let m = hmac_sha256(m1, &mac_input.into_bytes());

    let mut w = Writer::new();
    w.write_u16(0);
    public.write(&mut w);
    w.write_u32(keyid);
    w.write_raw(&dsa.sign_prehash_bytes(&m)?);
    Ok(w.into_bytes())
}

/// Verify a decrypted signed block; returns (peer DSA key, peer keyid).
fn verify_signed_block(
    block: &[u8],
    m1: &[u8; 32],
    g_theirs: &BigUint,
    g_ours: &BigUint,
) -> Result<(DsaPublicKey, u32), OtrError> {
    let mut r = Reader::new(block);
    let key_type = r.read_u16()?;
    if key_type != 0 {
        return Err(OtrError::Protocol(format!("unknown v3 key type {key_type}")));
    }
    let public = DsaPublicKey::read(&mut r)?;
    let keyid = r.read_u32()?;
    if keyid == 0 {
        return Err(OtrError::Protocol("v3 keyid must be nonzero".into()));
    }
    let mut sig = [0u8; DSA_SIGNATURE_LENGTH];
    sig.copy_from_slice(r.read_raw(DSA_SIGNATURE_LENGTH)?);
    r.expect_end()?;

    let mut mac_input = Writer::new();
    mac_input.write_raw(&mpi_bytes(g_theirs));
    mac_input.write_raw(&mpi_bytes(g_ours));
    mac_input.write_u16(0);
    public.write(&mut mac_input);
    mac_input.write_u32(keyid);
    let m = hmac_sha256(m1, &mac_input.into_bytes());
    public.verify_prehash_bytes(&m, &sig)?;
    Ok((public, keyid))
}

// ── Message handlers ─────────────────────────────────────────────────────────

/// Open the exchange: commit to a fresh `g^x`.
pub fn start() -> (Ake, Vec<u8>, Vec<u8>) {
    let x = DhPair::generate();
    let mut r = [0u8; 16];
    OsRng.fill_bytes(&mut r);
    let gx_mpi = mpi_bytes(&x.public);
    let encrypted_gx = aes128_ctr(&r, &[0u8; 8], &gx_mpi);
    let hashed_gx = sha256(&gx_mpi).to_vec();
    (
        Ake::AwaitingDhKey { x: Box::new(x), r },
        encrypted_gx,
        hashed_gx,
    )
}

/// Peer committed; answer with our `g^y`.
pub fn on_dh_commit(msg: &DhCommitMessage) -> (Ake, BigUint) {
    let y = DhPair::generate();
    let gy = y.public.clone();
    (
        Ake::AwaitingRevealSig {
            y: Box::new(y),
            encrypted_gx: msg.encrypted_gx.clone(),
            hashed_gx: msg.hashed_gx.clone(),
        },
        gy,
    )
}

/// Fields of an outbound Reveal Signature message.
pub struct RevealSigBody {
    pub revealed_key: Vec<u8>,
    pub encrypted_sig: Vec<u8>,
    pub mac: [u8; 20],
}

/// Committer handles `g^y`: reveal the commitment key and authenticate.
pub fn on_dh_key(
    state: Ake,
    msg: &DhKeyMessage,
    dsa: &DsaKeyPair,
) -> Result<(Ake, RevealSigBody), OtrError> {
    let Ake::AwaitingDhKey { x, r } = state else {
        return Err(OtrError::Protocol("unexpected d-h key".into()));
    };
    let gy = BigUint::from_bytes_be(&msg.gy);
    let s = x.shared_secret(&gy)?;
    let secrets = derive_secrets(&s);

    let block = build_signed_block(dsa, &secrets.m1, &x.public, &gy, 1)?;
    let encrypted_sig = aes128_ctr(&secrets.c, &[0u8; 8], &block);
    let mut mac_input = Writer::new();
    mac_input.write_data(&encrypted_sig);
    let mac = hmac_sha256_160(&secrets.m2, &mac_input.into_bytes());

    let body = RevealSigBody { revealed_key: r.to_vec(), encrypted_sig, mac };
    Ok((
        Ake::AwaitingSig { x, gy, secrets: Box::new(AkeSecretsOpaque(secrets)) },
        body,
    ))
}

/// Fields of the closing Signature message.
pub struct SigBody {
    pub encrypted_sig: Vec<u8>,
    pub mac: [u8; 20],
}

/// The committee's reveal arrived: check the commitment, authenticate
/// both ways, and stand the session up.
pub fn on_reveal_sig(
    state: Ake,
    msg: &RevealSignatureMessage,
    dsa: &DsaKeyPair,
) -> Result<(V3Session, SigBody), OtrError> {
    let Ake::AwaitingRevealSig { y, encrypted_gx, hashed_gx } = state else {
        return Err(OtrError::Protocol("unexpected reveal signature".into()));
    };
    let r: [u8; 16] = msg
        .revealed_key
        .as_slice()
        .try_into()
        .map_err(|_| OtrError::Protocol("revealed key must be 16 bytes".into()))?;

    let gx_mpi = aes128_ctr(&r, &[0u8; 8], &encrypted_gx);
    if !constant_time_equals(&sha256(&gx_mpi), &hashed_gx) {
        return Err(OtrError::Crypto("d-h commit hash mismatch".into()));
    }
    let gx = BigUint::from_bytes_be(&Reader::new(&gx_mpi).read_mpi()?);

    let s = y.shared_secret(&gx)?;
    let secrets = derive_secrets(&s);

    let mut mac_input = Writer::new();
    mac_input.write_data(&msg.encrypted_sig);
    let expected = hmac_sha256_160(&secrets.m2, &mac_input.into_bytes());
    if !constant_time_equals(&expected, &msg.mac) {
        return Err(OtrError::Crypto("reveal signature MAC mismatch".into()));
    }
    let block = aes128_ctr(&secrets.c, &[0u8; 8], &msg.encrypted_sig);
    let (_their_dsa, their_keyid) = verify_signed_block(&block, &secrets.m1, &gx, &y.public)?;

    // Authenticate our side with the primed keys.
    let reply_block = build_signed_block(dsa, &secrets.m1_prime, &y.public, &gx, 1)?;
    let encrypted_sig = aes128_ctr(&secrets.c_prime, &[0u8; 8], &reply_block);
    let mut reply_mac_input = Writer::new();
    reply_mac_input.write_data(&encrypted_sig);
    let mac = hmac_sha256_160(&secrets.m2_prime, &reply_mac_input.into_bytes());

    let session = V3Session::new(secrets.ssid, (*y).clone(), 1, gx, their_keyid);
    Ok((session, SigBody { encrypted_sig, mac }))
}

/// The closing Signature message: verify and stand the session up.
pub fn on_sig(state: Ake, msg: &SignatureMessage) -> Result<V3Session, OtrError> {
    let Ake::AwaitingSig { x, gy, secrets } = state else {
        return Err(OtrError::Protocol("unexpected signature message".into()));
    };
    let secrets = secrets.0;
    let mut mac_input = Writer::new();
    mac_input.write_data(&msg.encrypted_sig);
    let expected = hmac_sha256_160(&secrets.m2_prime, &mac_input.into_bytes());
    if !constant_time_equals(&expected, &msg.mac) {
        return Err(OtrError::Crypto("signature MAC mismatch".into()));
    }
    let block = aes128_ctr(&secrets.c_prime, &[0u8; 8], &msg.encrypted_sig);
    let (_their_dsa, their_keyid) = verify_signed_block(&block, &secrets.m1_prime, &gy, &x.public)?;

    let session = V3Session::new(secrets.ssid, (*x).clone(), 1, gy, their_keyid);
    Ok(session)
}
