//! Deniable authenticated key exchange.
//!
//! Three messages: Identity (initiator), Auth-R (responder), Auth-I
//! (initiator). Authentication rides on ring signatures whose rings mix
//! both long-term keys with one side's session ephemeral, so either
//! participant could have forged the whole exchange afterwards; nothing
//! signed here pins a transcript to a person.
//!
//! The party that sent the query is the responder here: it waits for the
//! Identity message, answers with Auth-R, and owns ratchet 0 once the
//! exchange completes. Failures abort the attempt and leave no key
//! material behind.

use ed448_goldilocks::EdwardsPoint;
use num_bigint::BigUint;
use zeroize::Zeroize;

use dl_otr_crypto::dh3072::DhKeyPair;
use dl_otr_crypto::ed448::{self, EcdhKeyPair, LongTermKeyPair};
use dl_otr_crypto::kdf::{self, usage};
use dl_otr_crypto::rsig::{self, RingSignature};
use dl_otr_proto::encode::Writer;
use dl_otr_proto::message::{AuthIMessage, AuthRMessage, IdentityMessage};

use crate::error::OtrError;
use crate::profile::ClientProfile;
use crate::ratchet::Role;

/// Per-call context; the session passes it by reference at every entry.
pub struct DakeContext<'a> {
    pub long_term: &'a LongTermKeyPair,
    pub our_profile_payload: &'a [u8],
    pub our_tag: u32,
    pub local_account: &'a str,
    pub remote_account: &'a str,
    pub now: u64,
}

/// Output of a completed exchange: everything the double ratchet needs.
pub struct DakeKeys {
    pub role: Role,
    pub mixed_key: [u8; 64],
    pub ssid: [u8; 8],
    pub our_ecdh: EcdhKeyPair,
    pub our_dh: DhKeyPair,
    pub their_ecdh: EdwardsPoint,
    pub their_dh: BigUint,
    pub their_profile: ClientProfile,
}

// No Drop impl: the ratchet installer destructures this by move and is
// responsible for zeroising `mixed_key` once the root key is derived.
// The key pairs inside wipe themselves.

/// In-flight exchange state. Dropping any variant wipes its ephemerals
/// through their own destructors.
pub enum Dake {
    /// We sent the query; the peer opens with an Identity message.
    AwaitingIdentity { query_tag: String },
    /// We sent an Identity message and wait for Auth-R.
    AwaitingAuthR {
        query_tag: String,
        our_ecdh: EcdhKeyPair,
        our_dh: DhKeyPair,
    },
    /// We sent Auth-R and wait for Auth-I.
    AwaitingAuthI {
        transcript: [u8; 64],
        auth_i_ring: [EdwardsPoint; 3],
        keys: Box<DakeKeys>,
    },
}

impl Dake {
    pub fn label(&self) -> &'static str {
        match self {
            Dake::AwaitingIdentity { .. } => "awaiting identity",
            Dake::AwaitingAuthR { .. } => "awaiting auth-r",
            Dake::AwaitingAuthI { .. } => "awaiting auth-i",
        }
    }
}

// ── Initiator side ───────────────────────────────────────────────────────────

/// Identity message body, ready for the wire.
pub struct IdentityBody {
    pub ecdh: [u8; 57],
    pub dh: Vec<u8>,
}

/// Open the exchange: fresh ephemerals plus the Identity message body.
/// Called when a query or whitespace tag arrives.
pub fn start(query_tag: &str) -> (Dake, IdentityBody) {
    let our_ecdh = EcdhKeyPair::generate();
    let our_dh = DhKeyPair::generate();
    let body = IdentityBody {
        ecdh: our_ecdh.public_bytes(),
        dh: our_dh.public().to_bytes_be(),
    };
    let state = Dake::AwaitingAuthR {
        query_tag: query_tag.to_string(),
        our_ecdh,
        our_dh,
    };
    (state, body)
}

/// Handle Auth-R as the initiator. Verifies the responder's ring
/// signature over the shared transcript and finishes with our Auth-I.
pub fn on_auth_r(
    ctx: &DakeContext<'_>,
    state: Dake,
    msg: &AuthRMessage,
) -> Result<(DakeKeys, AuthISigma), OtrError> {
    let Dake::AwaitingAuthR { query_tag, our_ecdh, our_dh } = state else {
        return Err(OtrError::Protocol("unexpected auth-r".into()));
    };

    let their_profile = ClientProfile::decode(&msg.profile)?;
    their_profile.validate(ctx.now)?;
    if their_profile.instance_tag != msg.header.sender_tag {
        return Err(OtrError::Protocol("auth-r sender tag does not match profile".into()));
    }

    let their_ecdh = ed448::decode_point(&msg.ecdh)?;
    let their_dh = BigUint::from_bytes_be(&msg.dh);

    let our_profile = ClientProfile::decode(ctx.our_profile_payload)?;
    let transcript = transcript(
        ctx.our_profile_payload,
        &msg.profile,
        &our_ecdh.public_bytes(),
        &msg.ecdh,
        &our_dh.public().to_bytes_be(),
        &msg.dh,
        ctx.our_tag,
        msg.header.sender_tag,
        &query_tag,
        ctx.local_account,
        ctx.remote_account,
    );

    // σ_a: ring of initiator H, responder H, and our ephemeral Y.
    let ring_a = [
        our_profile.identity_key,
        their_profile.identity_key,
        *our_ecdh.public(),
    ];
    let sigma = RingSignature::from_bytes(&msg.sigma)?;
    rsig::ring_verify(&ring_a, &sigma, &transcript)
        .map_err(|_| OtrError::Crypto("auth-r ring signature rejected".into()))?;

    let mixed_key = mix_shared(&our_ecdh, &our_dh, &their_ecdh, &their_dh)?;
    let ssid = derive_ssid(&mixed_key);

    // σ_b: same transcript, the ring now carries the responder's X.
    let ring_b = [
        our_profile.identity_key,
        their_profile.identity_key,
        their_ecdh,
    ];
    let sigma_b = rsig::ring_sign(ctx.long_term, &ring_b, &transcript)?;

    let keys = DakeKeys {
        role: Role::FirstReceiver,
        mixed_key,
        ssid,
        our_ecdh,
        our_dh,
        their_ecdh,
        their_dh,
        their_profile,
    };
    Ok((keys, AuthISigma(sigma_b.to_bytes().to_vec())))
}

/// Auth-I signature body, ready for the wire.
pub struct AuthISigma(pub Vec<u8>);

// ── Responder side ───────────────────────────────────────────────────────────

/// Handle the Identity message as the responder (query sender): validate
/// the initiator's profile, produce Auth-R material and move to
/// AwaitingAuthI.
pub fn on_identity(
    ctx: &DakeContext<'_>,
    state: Dake,
    msg: &IdentityMessage,
) -> Result<(Dake, AuthRBody), OtrError> {
    let Dake::AwaitingIdentity { query_tag } = state else {
        return Err(OtrError::Protocol("unexpected identity message".into()));
    };

    let their_profile = ClientProfile::decode(&msg.profile)?;
    their_profile.validate(ctx.now)?;
    if their_profile.instance_tag != msg.header.sender_tag {
        return Err(OtrError::Protocol("identity sender tag does not match profile".into()));
    }

    let their_ecdh = ed448::decode_point(&msg.ecdh)?;
    let their_dh = BigUint::from_bytes_be(&msg.dh);

    let our_ecdh = EcdhKeyPair::generate();
    let our_dh = DhKeyPair::generate();
    let our_profile = ClientProfile::decode(ctx.our_profile_payload)?;

    let transcript = transcript(
        &msg.profile,
        ctx.our_profile_payload,
        &msg.ecdh,
        &our_ecdh.public_bytes(),
        &msg.dh,
        &our_dh.public().to_bytes_be(),
        msg.header.sender_tag,
        ctx.our_tag,
        &query_tag,
        ctx.remote_account,
        ctx.local_account,
    );

    let ring_a = [
        their_profile.identity_key,
        our_profile.identity_key,
        their_ecdh,
    ];
    let sigma_a = rsig::ring_sign(ctx.long_term, &ring_a, &transcript)?;

    let mixed_key = mix_shared(&our_ecdh, &our_dh, &their_ecdh, &their_dh)?;
    let ssid = derive_ssid(&mixed_key);

    let auth_i_ring = [
        their_profile.identity_key,
        our_profile.identity_key,
        *our_ecdh.public(),
    ];

    let body = AuthRBody {
        ecdh: our_ecdh.public_bytes(),
        dh: our_dh.public().to_bytes_be(),
        sigma: sigma_a.to_bytes().to_vec(),
    };

    let keys = DakeKeys {
        role: Role::FirstSender,
        mixed_key,
        ssid,
        our_ecdh,
        our_dh,
        their_ecdh,
        their_dh,
        their_profile,
    };

    Ok((
        Dake::AwaitingAuthI {
            transcript,
            auth_i_ring,
            keys: Box::new(keys),
        },
        body,
    ))
}

/// Auth-R message body, ready for the wire.
pub struct AuthRBody {
    pub ecdh: [u8; 57],
    pub dh: Vec<u8>,
    pub sigma: Vec<u8>,
}

/// Handle Auth-I as the responder; success yields the ratchet material.
pub fn on_auth_i(state: Dake, msg: &AuthIMessage) -> Result<DakeKeys, OtrError> {
    let Dake::AwaitingAuthI { transcript, auth_i_ring, keys } = state else {
        return Err(OtrError::Protocol("unexpected auth-i".into()));
    };
    let sigma = RingSignature::from_bytes(&msg.sigma)?;
    rsig::ring_verify(&auth_i_ring, &sigma, &transcript)
        .map_err(|_| OtrError::Crypto("auth-i ring signature rejected".into()))?;
    Ok(*keys)
}

// ── Shared derivations ───────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn transcript(
    initiator_profile: &[u8],
    responder_profile: &[u8],
    y: &[u8; 57],
    x: &[u8; 57],
    b: &[u8],
    a: &[u8],
    initiator_tag: u32,
    responder_tag: u32,
    query_tag: &str,
    initiator_account: &str,
    responder_account: &str,
) -> [u8; 64] {
    let mut w = Writer::new();
    w.write_data(initiator_profile);
    w.write_data(responder_profile);
    w.write_point(y);
    w.write_point(x);
    w.write_mpi(b);
    w.write_mpi(a);
    w.write_u32(initiator_tag);
    w.write_u32(responder_tag);
    w.write_data(query_tag.as_bytes());
    w.write_data(initiator_account.as_bytes());
    w.write_data(responder_account.as_bytes());
    let bytes = w.into_bytes();
    kdf::kdf_64(usage::AUTH_TRANSCRIPT, &bytes)
}

fn mix_shared(
    our_ecdh: &EcdhKeyPair,
    our_dh: &DhKeyPair,
    their_ecdh: &EdwardsPoint,
    their_dh: &BigUint,
) -> Result<[u8; 64], OtrError> {
    let ecdh_secret = our_ecdh.shared_secret(their_ecdh)?;
    let dh_secret = our_dh.shared_secret(their_dh)?;
    let mut input = Vec::with_capacity(ecdh_secret.len() + dh_secret.len());
    input.extend_from_slice(&ecdh_secret);
    input.extend_from_slice(&dh_secret);
    let mixed = kdf::kdf_64(usage::SHARED_SECRET, &input);
    input.zeroize();
    Ok(mixed)
}

fn derive_ssid(mixed_key: &[u8; 64]) -> [u8; 8] {
    let mut ssid = [0u8; 8];
    kdf::kdf_into(usage::SSID, mixed_key, &mut ssid);
    ssid
}
