//! Per-peer session state machine.
//!
//! States: PLAINTEXT → (DAKE | AKE in progress) → ENCRYPTED_V4/V3 →
//! FINISHED, with every transition funnelled through `transition()`,
//! which destroys the outgoing state's key material. The session owns no
//! transport: inbound strings arrive via `transform_receiving`, outbound
//! text leaves via `transform_sending`, and everything the engine
//! produces on its own (handshake replies, heartbeats, error notices)
//! goes out through the host's `inject_message`.
//!
//! Recoverable protocol and crypto failures drop the offending message
//! and surface an event; they never tear the session down. Only an
//! explicit end or the expiry timer changes state on error-free paths.

use ed448_goldilocks::EdwardsPoint;
use num_bigint::BigUint;
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, warn};
use zeroize::Zeroize;

use dl_otr_crypto::ed448::{fingerprint, LongTermKeyPair, FINGERPRINT_LENGTH};
use dl_otr_crypto::kdf::{self, constant_time_equals, usage};
use dl_otr_crypto::stream::xsalsa20;
use dl_otr_proto::armor::{self, Classified};
use dl_otr_proto::encode::Writer;
use dl_otr_proto::fragment::{self, Reassembler};
use dl_otr_proto::message::{
    msg_type, AuthIMessage, AuthRMessage, DataMessageV3, DataMessageV4, DhCommitMessage,
    DhKeyMessage, Header, IdentityMessage, Message, MIN_INSTANCE_TAG, FLAG_IGNORE_UNREADABLE,
    VERSION_3, VERSION_4,
};
use dl_otr_proto::tlv::{self, tlv_type, Tlv};

use crate::dake::{self, Dake, DakeContext, DakeKeys};
use crate::error::OtrError;
use crate::host::{self, EventKind, Host, SessionId};
use crate::profile::{ClientProfile, DEFAULT_LIFETIME_SECS};
use crate::ratchet::DoubleRatchet;
use crate::smp::{self, Smp, SmpEvent, SmpMessage};
use crate::v3::{ake as v3ake, data::V3Session};

/// Reassembly slots time out after this many seconds of silence.
const FRAGMENT_TIMEOUT_SECS: u64 = 120;

// ── States ───────────────────────────────────────────────────────────────────

pub struct EncryptedV4 {
    pub ratchet: DoubleRatchet,
    pub ssid: [u8; 8],
    pub their_identity: EdwardsPoint,
    pub their_tag: u32,
}

pub struct EncryptedV3 {
    pub keys: V3Session,
    pub their_tag: u32,
}

pub enum SessionState {
    Plaintext,
    DakeInProgress(Dake),
    AkeInProgress(v3ake::Ake),
    EncryptedV4(Box<EncryptedV4>),
    EncryptedV3(Box<EncryptedV3>),
    Finished,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Plaintext => "plaintext",
            SessionState::DakeInProgress(_) => "dake in progress",
            SessionState::AkeInProgress(_) => "ake in progress",
            SessionState::EncryptedV4(_) => "encrypted v4",
            SessionState::EncryptedV3(_) => "encrypted v3",
            SessionState::Finished => "finished",
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct Session {
    id: SessionId,
    our_tag: u32,
    their_tag: u32,
    state: SessionState,
    smp: Smp,
    reassembler: Reassembler,
    profile_payload: Option<Vec<u8>>,
    whitespace_tag_sent: bool,
    last_outbound: u64,
    last_inbound: u64,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            our_tag: random_instance_tag(),
            their_tag: 0,
            state: SessionState::Plaintext,
            smp: Smp::new(),
            reassembler: Reassembler::new(FRAGMENT_TIMEOUT_SECS),
            profile_payload: None,
            whitespace_tag_sent: false,
            last_outbound: 0,
            last_inbound: 0,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn our_instance_tag(&self) -> u32 {
        self.our_tag
    }

    pub fn state_label(&self) -> &'static str {
        self.state.label()
    }

    /// The only way to cross states: the outgoing state's secrets die
    /// with it (every state's key material wipes itself on drop).
    fn transition(&mut self, next: SessionState) {
        debug!(from = self.state.label(), to = next.label(), "session transition");
        self.state = next;
    }

    // ── Host-facing operations ───────────────────────────────────────────

    /// Emit a query message advertising every policy-allowed version.
    pub fn start_session(&mut self, host: &dyn Host, now: u64) -> Result<(), OtrError> {
        let policy = host::policy(host, &self.id)?;
        let versions = policy.allowed_versions();
        if versions.is_empty() {
            return Err(OtrError::InvalidState("policy allows no protocol version"));
        }
        let query = armor::query_message(&versions);
        host::inject(host, &self.id, &query)?;
        self.last_outbound = now;
        self.transition(SessionState::DakeInProgress(Dake::AwaitingIdentity {
            query_tag: query,
        }));
        Ok(())
    }

    /// Send the disconnect record and wipe local key material.
    pub fn end_session(&mut self, host: &dyn Host, now: u64) -> Result<(), OtrError> {
        match &mut self.state {
            SessionState::EncryptedV4(_) => {
                let disconnect = Tlv::new(tlv_type::DISCONNECT, Vec::new());
                let raws = self.encrypt_v4_payload(host, b"", &[disconnect], FLAG_IGNORE_UNREADABLE, now)?;
                for raw in &raws {
                    host::inject(host, &self.id, raw)?;
                }
                self.smp = Smp::new();
                self.transition(SessionState::Plaintext);
                Ok(())
            }
            SessionState::EncryptedV3(_) => {
                let disconnect = Tlv::new(tlv_type::DISCONNECT, Vec::new());
                let raws = self.encrypt_v3_payload(host, b"", &[disconnect], FLAG_IGNORE_UNREADABLE, now)?;
                for raw in &raws {
                    host::inject(host, &self.id, raw)?;
                }
                self.smp = Smp::new();
                self.transition(SessionState::Finished);
                Ok(())
            }
            SessionState::DakeInProgress(_) | SessionState::AkeInProgress(_) => {
                self.transition(SessionState::Plaintext);
                Ok(())
            }
            SessionState::Plaintext | SessionState::Finished => Ok(()),
        }
    }

    /// Timers: heartbeat after outbound silence, teardown after total
    /// inactivity. Driven entirely by host clock ticks.
    pub fn tick(&mut self, host: &dyn Host, now: u64) -> Result<(), OtrError> {
        self.reassembler.expire(now);
        let encrypted = matches!(
            self.state,
            SessionState::EncryptedV4(_) | SessionState::EncryptedV3(_)
        );
        if !encrypted {
            return Ok(());
        }
        let policy = host::policy(host, &self.id)?;
        let last_activity = self.last_outbound.max(self.last_inbound);
        if policy.session_expiry > 0 && now.saturating_sub(last_activity) >= policy.session_expiry {
            let next = match self.state {
                SessionState::EncryptedV3(_) => SessionState::Finished,
                _ => SessionState::Plaintext,
            };
            self.smp = Smp::new();
            self.transition(next);
            host::event(host, &self.id, self.their_tag, EventKind::SessionFinished, "expired");
            return Ok(());
        }
        if policy.heartbeat_interval > 0
            && now.saturating_sub(self.last_outbound) >= policy.heartbeat_interval
        {
            let raws = match self.state {
                SessionState::EncryptedV4(_) => {
                    self.encrypt_v4_payload(host, b"", &[], FLAG_IGNORE_UNREADABLE, now)?
                }
                SessionState::EncryptedV3(_) => {
                    self.encrypt_v3_payload(host, b"", &[], FLAG_IGNORE_UNREADABLE, now)?
                }
                _ => unreachable!("guarded above"),
            };
            for raw in &raws {
                host::inject(host, &self.id, raw)?;
            }
            host::event(host, &self.id, self.their_tag, EventKind::HeartbeatSent, "");
        }
        Ok(())
    }

    /// Outbound path: plaintext passthrough (possibly tagged) below the
    /// encrypted states, data messages inside them, a drop in FINISHED.
    pub fn transform_sending(
        &mut self,
        host: &dyn Host,
        text: &str,
        now: u64,
    ) -> Result<Vec<String>, OtrError> {
        match &mut self.state {
            SessionState::Plaintext
            | SessionState::DakeInProgress(_)
            | SessionState::AkeInProgress(_) => {
                let policy = host::policy(host, &self.id)?;
                if policy.require_encryption {
                    if matches!(self.state, SessionState::Plaintext) {
                        self.start_session(host, now)?;
                    }
                    host::event(
                        host,
                        &self.id,
                        self.their_tag,
                        EventKind::MessageDropped,
                        "encryption required; key exchange started",
                    );
                    return Ok(Vec::new());
                }
                let mut out = text.to_string();
                if policy.opportunistic && !self.whitespace_tag_sent {
                    let tag = armor::whitespace_tag(&policy.allowed_versions());
                    out.push_str(&tag);
                    self.whitespace_tag_sent = true;
                    if matches!(self.state, SessionState::Plaintext) {
                        self.transition(SessionState::DakeInProgress(Dake::AwaitingIdentity {
                            query_tag: tag,
                        }));
                    }
                }
                self.last_outbound = now;
                Ok(vec![out])
            }
            SessionState::EncryptedV4(_) => {
                self.encrypt_v4_payload(host, text.as_bytes(), &[], 0, now)
            }
            SessionState::EncryptedV3(_) => {
                self.encrypt_v3_payload(host, text.as_bytes(), &[], 0, now)
            }
            SessionState::Finished => {
                host::event(
                    host,
                    &self.id,
                    self.their_tag,
                    EventKind::SessionFinished,
                    "message not sent; end the finished session first",
                );
                Ok(Vec::new())
            }
        }
    }

    /// Inbound path. Returns any cleartext to hand to the user.
    pub fn transform_receiving(
        &mut self,
        host: &dyn Host,
        raw: &str,
        now: u64,
    ) -> Result<Vec<String>, OtrError> {
        match self.receive_inner(host, raw, now, 0) {
            Ok(out) => Ok(out),
            // Recoverable failures drop the message; the session goes on.
            Err(OtrError::HostFailure(e)) => Err(OtrError::HostFailure(e)),
            Err(OtrError::InvalidState(e)) => Err(OtrError::InvalidState(e)),
            Err(err) => {
                warn!(error = %err, "dropping undecodable inbound message");
                host::event(
                    host,
                    &self.id,
                    self.their_tag,
                    EventKind::MessageDropped,
                    &err.to_string(),
                );
                Ok(Vec::new())
            }
        }
    }

    fn receive_inner(
        &mut self,
        host: &dyn Host,
        raw: &str,
        now: u64,
        depth: u8,
    ) -> Result<Vec<String>, OtrError> {
        match armor::classify(raw)? {
            Classified::FragmentText(text) => {
                if depth > 0 {
                    return Err(OtrError::Protocol("fragment inside a fragment".into()));
                }
                let frag = fragment::parse_fragment(&text)?;
                if frag.receiver_tag != 0 && frag.receiver_tag != self.our_tag {
                    debug!(tag = frag.receiver_tag, "fragment for another instance");
                    return Ok(Vec::new());
                }
                match self.reassembler.receive(frag, now)? {
                    Some(joined) => self.receive_inner(host, &joined, now, depth + 1),
                    None => Ok(Vec::new()),
                }
            }
            Classified::Encoded(bytes) => self.handle_encoded(host, &bytes, now),
            Classified::Query { versions } => {
                self.last_inbound = now;
                self.begin_key_exchange(host, &versions, raw, now)?;
                Ok(Vec::new())
            }
            Classified::Error(text) => {
                host::event(host, &self.id, self.their_tag, EventKind::ErrorReceived, &text);
                let policy = host::policy(host, &self.id)?;
                if policy.error_start_ake && matches!(self.state, SessionState::Plaintext) {
                    self.start_session(host, now)?;
                }
                Ok(Vec::new())
            }
            Classified::Plaintext { text, tag_versions } => {
                self.last_inbound = now;
                if !tag_versions.is_empty() && matches!(self.state, SessionState::Plaintext) {
                    let tag = armor::whitespace_tag(&tag_versions);
                    self.begin_key_exchange(host, &tag_versions, &tag, now)?;
                }
                if text.is_empty() {
                    Ok(Vec::new())
                } else {
                    Ok(vec![text])
                }
            }
        }
    }

    /// The peer asked for OTR (query or whitespace tag): open the best
    /// commonly-allowed exchange, as the Identity / D-H Commit sender.
    fn begin_key_exchange(
        &mut self,
        host: &dyn Host,
        offered: &[u16],
        query_tag: &str,
        now: u64,
    ) -> Result<(), OtrError> {
        let policy = host::policy(host, &self.id)?;
        if policy.allow_v4 && offered.contains(&VERSION_4) {
            let payload = self.profile_payload(host, now)?;
            let (state, body) = dake::start(query_tag);
            let msg = Message::Identity(IdentityMessage {
                header: self.header(VERSION_4, msg_type::IDENTITY),
                profile: payload,
                ecdh: body.ecdh,
                dh: body.dh,
            });
            self.send_encoded(host, &msg, VERSION_4, now)?;
            self.transition(SessionState::DakeInProgress(state));
            Ok(())
        } else if policy.allow_v3 && offered.contains(&VERSION_3) {
            let (state, encrypted_gx, hashed_gx) = v3ake::start();
            let msg = Message::DhCommit(DhCommitMessage {
                header: self.header(VERSION_3, msg_type::DH_COMMIT),
                encrypted_gx,
                hashed_gx,
            });
            self.send_encoded(host, &msg, VERSION_3, now)?;
            self.transition(SessionState::AkeInProgress(state));
            Ok(())
        } else {
            debug!(?offered, "no commonly allowed version; ignoring request");
            Ok(())
        }
    }

    // ── Encoded-message dispatch ─────────────────────────────────────────

    fn handle_encoded(
        &mut self,
        host: &dyn Host,
        bytes: &[u8],
        now: u64,
    ) -> Result<Vec<String>, OtrError> {
        let msg = Message::decode(bytes)?;
        let header = *msg.header();
        if header.receiver_tag != 0 && header.receiver_tag != self.our_tag {
            debug!(tag = header.receiver_tag, "message for another instance");
            return Ok(Vec::new());
        }
        self.last_inbound = now;

        match msg {
            Message::Identity(m) => {
                self.on_identity(host, m, now)?;
                Ok(Vec::new())
            }
            Message::AuthR(m) => {
                self.on_auth_r(host, m, now)?;
                Ok(Vec::new())
            }
            Message::AuthI(m) => {
                self.on_auth_i(host, m)?;
                Ok(Vec::new())
            }
            Message::DataV4(m) => self.on_data_v4(host, m, now),
            Message::DhCommit(m) => {
                self.on_dh_commit(host, m, now)?;
                Ok(Vec::new())
            }
            Message::DhKey(m) => {
                self.on_dh_key(host, m, now)?;
                Ok(Vec::new())
            }
            Message::RevealSignature(m) => {
                self.on_reveal_sig(host, m, now)?;
                Ok(Vec::new())
            }
            Message::Signature(m) => {
                self.on_sig(host, m)?;
                Ok(Vec::new())
            }
            Message::DataV3(m) => self.on_data_v3(host, m, now),
        }
    }

    // ── Version 4 key exchange ───────────────────────────────────────────

    fn on_identity(
        &mut self,
        host: &dyn Host,
        msg: IdentityMessage,
        now: u64,
    ) -> Result<(), OtrError> {
        let state = std::mem::replace(&mut self.state, SessionState::Plaintext);
        let SessionState::DakeInProgress(dake_state @ Dake::AwaitingIdentity { .. }) = state else {
            self.state = state;
            return Err(OtrError::Protocol("identity message without a pending query".into()));
        };
        let payload = self.profile_payload(host, now)?;
        let long_term = self.long_term(host)?;
        let ctx = DakeContext {
            long_term: &long_term,
            our_profile_payload: &payload,
            our_tag: self.our_tag,
            local_account: &self.id.local_account,
            remote_account: &self.id.remote_account,
            now,
        };
        match dake::on_identity(&ctx, dake_state, &msg) {
            Ok((next, body)) => {
                self.their_tag = msg.header.sender_tag;
                let reply = Message::AuthR(AuthRMessage {
                    header: self.header(VERSION_4, msg_type::AUTH_R),
                    profile: payload,
                    ecdh: body.ecdh,
                    dh: body.dh,
                    sigma: body.sigma,
                });
                self.send_encoded(host, &reply, VERSION_4, now)?;
                self.transition(SessionState::DakeInProgress(next));
                Ok(())
            }
            Err(err) => {
                self.transition(SessionState::Plaintext);
                Err(err)
            }
        }
    }

    fn on_auth_r(&mut self, host: &dyn Host, msg: AuthRMessage, now: u64) -> Result<(), OtrError> {
        let state = std::mem::replace(&mut self.state, SessionState::Plaintext);
        let SessionState::DakeInProgress(dake_state @ Dake::AwaitingAuthR { .. }) = state else {
            self.state = state;
            return Err(OtrError::Protocol("unexpected auth-r".into()));
        };
        let payload = self.profile_payload(host, now)?;
        let long_term = self.long_term(host)?;
        let ctx = DakeContext {
            long_term: &long_term,
            our_profile_payload: &payload,
            our_tag: self.our_tag,
            local_account: &self.id.local_account,
            remote_account: &self.id.remote_account,
            now,
        };
        match dake::on_auth_r(&ctx, dake_state, &msg) {
            Ok((keys, sigma)) => {
                self.their_tag = msg.header.sender_tag;
                let reply = Message::AuthI(AuthIMessage {
                    header: self.header(VERSION_4, msg_type::AUTH_I),
                    sigma: sigma.0,
                });
                self.send_encoded(host, &reply, VERSION_4, now)?;
                self.install_v4(host, keys);
                Ok(())
            }
            Err(err) => {
                self.transition(SessionState::Plaintext);
                Err(err)
            }
        }
    }

    fn on_auth_i(&mut self, host: &dyn Host, msg: AuthIMessage) -> Result<(), OtrError> {
        let state = std::mem::replace(&mut self.state, SessionState::Plaintext);
        let SessionState::DakeInProgress(dake_state @ Dake::AwaitingAuthI { .. }) = state else {
            self.state = state;
            return Err(OtrError::Protocol("unexpected auth-i".into()));
        };
        match dake::on_auth_i(dake_state, &msg) {
            Ok(keys) => {
                self.install_v4(host, keys);
                Ok(())
            }
            Err(err) => {
                self.transition(SessionState::Plaintext);
                Err(err)
            }
        }
    }

    fn install_v4(&mut self, host: &dyn Host, keys: DakeKeys) {
        let DakeKeys {
            role,
            mut mixed_key,
            ssid,
            our_ecdh,
            our_dh,
            their_ecdh,
            their_dh,
            their_profile,
        } = keys;
        let their_tag = their_profile.instance_tag;
        self.their_tag = their_tag;
        // The DAKE ephemerals become ratchet 0's key material.
        let ratchet = DoubleRatchet::new(role, &mixed_key, our_ecdh, our_dh, their_ecdh, their_dh);
        mixed_key.zeroize();
        let state = EncryptedV4 {
            ratchet,
            ssid,
            their_identity: their_profile.identity_key,
            their_tag,
        };
        self.transition(SessionState::EncryptedV4(Box::new(state)));
        host::event(host, &self.id, their_tag, EventKind::EncryptedStart, "4");
    }

    // ── Version 3 key exchange ───────────────────────────────────────────

    fn on_dh_commit(
        &mut self,
        host: &dyn Host,
        msg: DhCommitMessage,
        now: u64,
    ) -> Result<(), OtrError> {
        let policy = host::policy(host, &self.id)?;
        if !policy.allow_v3 {
            return Err(OtrError::Protocol("version 3 not allowed by policy".into()));
        }
        // Legal answer to our query, or an unprompted AKE start.
        if !matches!(
            self.state,
            SessionState::Plaintext | SessionState::DakeInProgress(Dake::AwaitingIdentity { .. })
        ) {
            return Err(OtrError::Protocol("unexpected d-h commit".into()));
        }
        self.their_tag = msg.header.sender_tag;
        let (state, gy) = v3ake::on_dh_commit(&msg);
        let reply = Message::DhKey(DhKeyMessage {
            header: self.header(VERSION_3, msg_type::DH_KEY),
            gy: gy.to_bytes_be(),
        });
        self.send_encoded(host, &reply, VERSION_3, now)?;
        self.transition(SessionState::AkeInProgress(state));
        Ok(())
    }

    fn on_dh_key(&mut self, host: &dyn Host, msg: DhKeyMessage, now: u64) -> Result<(), OtrError> {
        let state = std::mem::replace(&mut self.state, SessionState::Plaintext);
        let SessionState::AkeInProgress(ake_state @ v3ake::Ake::AwaitingDhKey { .. }) = state else {
            self.state = state;
            return Err(OtrError::Protocol("unexpected d-h key".into()));
        };
        let dsa = self
            .dsa(host)
            .ok_or_else(|| OtrError::Protocol("version 3 requires a DSA key pair".into()))?;
        match v3ake::on_dh_key(ake_state, &msg, &dsa) {
            Ok((next, body)) => {
                self.their_tag = msg.header.sender_tag;
                let reply = Message::RevealSignature(dl_otr_proto::message::RevealSignatureMessage {
                    header: self.header(VERSION_3, msg_type::REVEAL_SIGNATURE),
                    revealed_key: body.revealed_key,
                    encrypted_sig: body.encrypted_sig,
                    mac: body.mac,
                });
                self.send_encoded(host, &reply, VERSION_3, now)?;
                self.transition(SessionState::AkeInProgress(next));
                Ok(())
            }
            Err(err) => {
                self.transition(SessionState::Plaintext);
                Err(err)
            }
        }
    }

    fn on_reveal_sig(
        &mut self,
        host: &dyn Host,
        msg: dl_otr_proto::message::RevealSignatureMessage,
        now: u64,
    ) -> Result<(), OtrError> {
        let state = std::mem::replace(&mut self.state, SessionState::Plaintext);
        let SessionState::AkeInProgress(ake_state @ v3ake::Ake::AwaitingRevealSig { .. }) = state
        else {
            self.state = state;
            return Err(OtrError::Protocol("unexpected reveal signature".into()));
        };
        let dsa = self
            .dsa(host)
            .ok_or_else(|| OtrError::Protocol("version 3 requires a DSA key pair".into()))?;
        match v3ake::on_reveal_sig(ake_state, &msg, &dsa) {
            Ok((session, body)) => {
                self.their_tag = msg.header.sender_tag;
                let reply = Message::Signature(dl_otr_proto::message::SignatureMessage {
                    header: self.header(VERSION_3, msg_type::SIGNATURE),
                    encrypted_sig: body.encrypted_sig,
                    mac: body.mac,
                });
                self.send_encoded(host, &reply, VERSION_3, now)?;
                self.install_v3(host, session);
                Ok(())
            }
            Err(err) => {
                self.transition(SessionState::Plaintext);
                Err(err)
            }
        }
    }

    fn on_sig(
        &mut self,
        host: &dyn Host,
        msg: dl_otr_proto::message::SignatureMessage,
    ) -> Result<(), OtrError> {
        let state = std::mem::replace(&mut self.state, SessionState::Plaintext);
        let SessionState::AkeInProgress(ake_state @ v3ake::Ake::AwaitingSig { .. }) = state else {
            self.state = state;
            return Err(OtrError::Protocol("unexpected signature message".into()));
        };
        match v3ake::on_sig(ake_state, &msg) {
            Ok(session) => {
                self.their_tag = msg.header.sender_tag;
                self.install_v3(host, session);
                Ok(())
            }
            Err(err) => {
                self.transition(SessionState::Plaintext);
                Err(err)
            }
        }
    }

    fn install_v3(&mut self, host: &dyn Host, keys: V3Session) {
        let state = EncryptedV3 { keys, their_tag: self.their_tag };
        self.transition(SessionState::EncryptedV3(Box::new(state)));
        host::event(host, &self.id, self.their_tag, EventKind::EncryptedStart, "3");
    }

    // ── Data messages ────────────────────────────────────────────────────

    fn on_data_v4(
        &mut self,
        host: &dyn Host,
        msg: DataMessageV4,
        now: u64,
    ) -> Result<Vec<String>, OtrError> {
        let SessionState::EncryptedV4(st) = &mut self.state else {
            self.notify_unreadable(
                host,
                msg.flags,
                &OtrError::InvalidState("no encrypted session for this data message"),
            );
            self.reply_unreadable(host, msg.flags)?;
            return Ok(Vec::new());
        };

        if msg.revealed_macs.len() % 64 != 0 {
            return Err(OtrError::Protocol("revealed MAC keys must be 64-byte aligned".into()));
        }
        // Deniability rule: the first message of a new ratchet must
        // disclose the MAC keys of the chain whose receipt triggered it.
        if msg.ratchet_id == st.ratchet.next_ratchet_id() && msg.revealed_macs.is_empty() {
            return Err(OtrError::Protocol(
                "new ratchet without revealed MAC keys".into(),
            ));
        }

        let their_ecdh = dl_otr_crypto::ed448::decode_point(&msg.ecdh)?;
        let their_dh = msg.dh.as_ref().map(|b| BigUint::from_bytes_be(b));

        let keys = match st.ratchet.recv_step(
            msg.ratchet_id,
            msg.message_id,
            msg.pn,
            &their_ecdh,
            their_dh.as_ref(),
        ) {
            Ok(keys) => keys,
            Err(err) => {
                self.notify_unreadable(host, msg.flags, &err);
                self.reply_unreadable(host, msg.flags)?;
                return Ok(Vec::new());
            }
        };

        let expected = kdf::kdf_64(usage::AUTHENTICATOR, &mac_input_v4(&keys.mac_key, &msg));
        if !constant_time_equals(&expected, &msg.authenticator) {
            let err = OtrError::Crypto("data message authenticator mismatch".into());
            self.notify_unreadable(host, msg.flags, &err);
            self.reply_unreadable(host, msg.flags)?;
            return Ok(Vec::new());
        }

        let payload = xsalsa20(&keys.message_key, &keys.nonce, &msg.ciphertext);
        // The MAC key has done its job; queue it for disclosure.
        st.ratchet.reveal_mac_key(&keys.mac_key);

        let (text, tlvs) = tlv::decode_payload(&payload)?;
        let mut disconnect = false;
        for t in &tlvs {
            self.handle_tlv(host, t, &mut disconnect, now)?;
        }
        if disconnect {
            self.smp = Smp::new();
            self.transition(SessionState::Finished);
            host::event(host, &self.id, self.their_tag, EventKind::EncryptedEnd, "");
            return Ok(Vec::new());
        }

        if text.is_empty() {
            return Ok(Vec::new());
        }
        String::from_utf8(text)
            .map(|t| vec![t])
            .map_err(|_| OtrError::Protocol("payload is not valid UTF-8".into()))
    }

    fn on_data_v3(
        &mut self,
        host: &dyn Host,
        msg: DataMessageV3,
        _now: u64,
    ) -> Result<Vec<String>, OtrError> {
        let SessionState::EncryptedV3(st) = &mut self.state else {
            self.notify_unreadable(
                host,
                msg.flags,
                &OtrError::InvalidState("no encrypted session for this data message"),
            );
            self.reply_unreadable(host, msg.flags)?;
            return Ok(Vec::new());
        };
        let payload = match st.keys.decrypt(&msg) {
            Ok(p) => p,
            Err(err) => {
                self.notify_unreadable(host, msg.flags, &err);
                self.reply_unreadable(host, msg.flags)?;
                return Ok(Vec::new());
            }
        };
        let (text, tlvs) = tlv::decode_payload(&payload)?;
        let mut disconnect = false;
        for t in &tlvs {
            // SMP runs only over version 4; the rest is shared.
            match t.tlv_type {
                tlv_type::DISCONNECT => disconnect = true,
                tlv_type::PADDING => {}
                other => debug!(tlv = other, "ignoring TLV on v3 session"),
            }
        }
        if disconnect {
            self.transition(SessionState::Finished);
            host::event(host, &self.id, self.their_tag, EventKind::EncryptedEnd, "");
            return Ok(Vec::new());
        }
        if text.is_empty() {
            return Ok(Vec::new());
        }
        String::from_utf8(text)
            .map(|t| vec![t])
            .map_err(|_| OtrError::Protocol("payload is not valid UTF-8".into()))
    }

    fn notify_unreadable(&self, host: &dyn Host, flags: u8, err: &OtrError) {
        if flags & FLAG_IGNORE_UNREADABLE == 0 {
            host::event(
                host,
                &self.id,
                self.their_tag,
                EventKind::UnreadableMessage,
                &err.to_string(),
            );
        }
    }

    /// Tell the peer we could not read their message, unless they asked
    /// us not to.
    fn reply_unreadable(&self, host: &dyn Host, flags: u8) -> Result<(), OtrError> {
        if flags & FLAG_IGNORE_UNREADABLE != 0 {
            return Ok(());
        }
        host::inject(
            host,
            &self.id,
            &armor::error_message("You sent an unreadable encrypted message."),
        )
    }

    // ── TLV handling (v4) ────────────────────────────────────────────────

    fn handle_tlv(
        &mut self,
        host: &dyn Host,
        t: &Tlv,
        disconnect: &mut bool,
        now: u64,
    ) -> Result<(), OtrError> {
        match t.tlv_type {
            tlv_type::PADDING => Ok(()),
            tlv_type::DISCONNECT => {
                *disconnect = true;
                Ok(())
            }
            tlv_type::EXTRA_KEY => {
                if let SessionState::EncryptedV4(st) = &self.state {
                    let key = st.ratchet.extra_symmetric_key();
                    host::event(
                        host,
                        &self.id,
                        self.their_tag,
                        EventKind::ExtraKey,
                        &hex::encode(key),
                    );
                }
                Ok(())
            }
            tlv_type::SMP_ABORT => {
                self.smp.abort();
                host::event(host, &self.id, self.their_tag, EventKind::SmpAborted, "");
                Ok(())
            }
            tlv_type::SMP1 | tlv_type::SMP2 | tlv_type::SMP3 | tlv_type::SMP4 => {
                self.handle_smp_tlv(host, t, now)
            }
            other => {
                debug!(tlv = other, "ignoring unknown TLV");
                Ok(())
            }
        }
    }

    fn handle_smp_tlv(&mut self, host: &dyn Host, t: &Tlv, now: u64) -> Result<(), OtrError> {
        let outcome = match t.tlv_type {
            tlv_type::SMP1 => {
                let msg = SmpMessage::decode_smp1(&t.value)?;
                self.smp.on_smp1(msg)
            }
            tlv_type::SMP2 => {
                let msg = SmpMessage::decode_smp2(&t.value)?;
                self.smp.on_smp2(msg)
            }
            tlv_type::SMP3 => {
                let msg = SmpMessage::decode_smp3(&t.value)?;
                self.smp.on_smp3(msg)
            }
            tlv_type::SMP4 => {
                let msg = SmpMessage::decode_smp4(&t.value)?;
                self.smp.on_smp4(msg)
            }
            _ => unreachable!("caller filters"),
        };
        match outcome {
            Ok(out) => {
                if let Some(event) = &out.event {
                    self.emit_smp_event(host, event);
                }
                if let Some(reply) = out.reply {
                    let tlv = smp_tlv(&reply);
                    let raws =
                        self.encrypt_v4_payload(host, b"", &[tlv], FLAG_IGNORE_UNREADABLE, now)?;
                    for raw in &raws {
                        host::inject(host, &self.id, raw)?;
                    }
                }
                Ok(())
            }
            Err(OtrError::Smp(reason)) => {
                // A failed proof resets the run and tells both the host
                // and the peer, but never the encrypted session itself.
                self.smp.abort();
                host::event(host, &self.id, self.their_tag, EventKind::SmpFailed, &reason);
                let abort = Tlv::new(tlv_type::SMP_ABORT, Vec::new());
                let raws = self.encrypt_v4_payload(host, b"", &[abort], FLAG_IGNORE_UNREADABLE, now)?;
                for raw in &raws {
                    host::inject(host, &self.id, raw)?;
                }
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    fn emit_smp_event(&self, host: &dyn Host, event: &SmpEvent) {
        let (kind, detail) = match event {
            SmpEvent::Started { question } => (EventKind::SmpStarted, question.clone()),
            SmpEvent::Progress { percent } => (EventKind::SmpInProgress, percent.to_string()),
            SmpEvent::Succeeded => (EventKind::SmpSucceeded, String::new()),
            SmpEvent::Failed => (EventKind::SmpFailed, String::new()),
            SmpEvent::Aborted => (EventKind::SmpAborted, String::new()),
        };
        host::event(host, &self.id, self.their_tag, kind, &detail);
    }

    // ── SMP operations ───────────────────────────────────────────────────

    pub fn initiate_smp(
        &mut self,
        host: &dyn Host,
        question: &str,
        secret: &str,
        now: u64,
    ) -> Result<(), OtrError> {
        let secret_scalar = {
            let SessionState::EncryptedV4(st) = &self.state else {
                return Err(OtrError::InvalidState("SMP requires an encrypted v4 session"));
            };
            let (ours, theirs) = self.fingerprints(host, st)?;
            smp::compute_secret(&ours, &theirs, &st.ssid, secret.as_bytes())
        };
        let msg = self.smp.initiate(&secret_scalar, question)?;
        let tlv = smp_tlv(&msg);
        let raws = self.encrypt_v4_payload(host, b"", &[tlv], FLAG_IGNORE_UNREADABLE, now)?;
        for raw in &raws {
            host::inject(host, &self.id, raw)?;
        }
        Ok(())
    }

    pub fn respond_smp(&mut self, host: &dyn Host, secret: &str, now: u64) -> Result<(), OtrError> {
        let secret_scalar = {
            let SessionState::EncryptedV4(st) = &self.state else {
                return Err(OtrError::InvalidState("SMP requires an encrypted v4 session"));
            };
            let (ours, theirs) = self.fingerprints(host, st)?;
            // The peer initiated this run; their fingerprint leads.
            smp::compute_secret(&theirs, &ours, &st.ssid, secret.as_bytes())
        };
        let msg = self.smp.respond(&secret_scalar)?;
        let tlv = smp_tlv(&msg);
        let raws = self.encrypt_v4_payload(host, b"", &[tlv], FLAG_IGNORE_UNREADABLE, now)?;
        for raw in &raws {
            host::inject(host, &self.id, raw)?;
        }
        Ok(())
    }

    pub fn abort_smp(&mut self, host: &dyn Host, now: u64) -> Result<(), OtrError> {
        if !matches!(self.state, SessionState::EncryptedV4(_)) {
            return Err(OtrError::InvalidState("SMP requires an encrypted v4 session"));
        }
        self.smp.abort();
        let abort = Tlv::new(tlv_type::SMP_ABORT, Vec::new());
        let raws = self.encrypt_v4_payload(host, b"", &[abort], FLAG_IGNORE_UNREADABLE, now)?;
        for raw in &raws {
            host::inject(host, &self.id, raw)?;
        }
        host::event(host, &self.id, self.their_tag, EventKind::SmpAborted, "");
        Ok(())
    }

    fn fingerprints(
        &self,
        host: &dyn Host,
        st: &EncryptedV4,
    ) -> Result<([u8; FINGERPRINT_LENGTH], [u8; FINGERPRINT_LENGTH]), OtrError> {
        let long_term = self.long_term(host)?;
        Ok((fingerprint(long_term.public()), fingerprint(&st.their_identity)))
    }

    // ── Outbound assembly ────────────────────────────────────────────────

    fn encrypt_v4_payload(
        &mut self,
        host: &dyn Host,
        text: &[u8],
        tlvs: &[Tlv],
        flags: u8,
        now: u64,
    ) -> Result<Vec<String>, OtrError> {
        let header = self.header(VERSION_4, msg_type::DATA);
        let SessionState::EncryptedV4(st) = &mut self.state else {
            return Err(OtrError::InvalidState("not in an encrypted v4 session"));
        };
        let step = st.ratchet.send_step()?;
        let payload = tlv::encode_payload(text, tlvs);
        let ciphertext = xsalsa20(&step.message_key, &step.nonce, &payload);
        let mut msg = DataMessageV4 {
            header,
            flags,
            pn: step.pn,
            ratchet_id: step.ratchet_id,
            message_id: step.message_id,
            ecdh: step.ecdh,
            dh: step.dh,
            ciphertext,
            authenticator: [0u8; 64],
            revealed_macs: step.revealed_macs,
        };
        msg.authenticator = kdf::kdf_64(usage::AUTHENTICATOR, &mac_input_v4(&step.mac_key, &msg));
        self.last_outbound = now;
        self.outbound_strings(host, &Message::DataV4(msg), VERSION_4)
    }

    fn encrypt_v3_payload(
        &mut self,
        host: &dyn Host,
        text: &[u8],
        tlvs: &[Tlv],
        flags: u8,
        now: u64,
    ) -> Result<Vec<String>, OtrError> {
        let header = self.header(VERSION_3, msg_type::DATA);
        let SessionState::EncryptedV3(st) = &mut self.state else {
            return Err(OtrError::InvalidState("not in an encrypted v3 session"));
        };
        let payload = tlv::encode_payload(text, tlvs);
        let msg = st.keys.encrypt(header, flags, &payload)?;
        self.last_outbound = now;
        self.outbound_strings(host, &Message::DataV3(msg), VERSION_3)
    }

    /// Armor and, when the transport demands it, fragment.
    fn outbound_strings(
        &mut self,
        host: &dyn Host,
        msg: &Message,
        version: u16,
    ) -> Result<Vec<String>, OtrError> {
        let armored = armor::armor(&msg.encode());
        match host.max_fragment_size(&self.id) {
            Some(max) if armored.len() > max => {
                let pieces = if version == VERSION_4 {
                    let identifier = OsRng.next_u32();
                    fragment::fragment_v4(&armored, max, identifier, self.our_tag, self.their_tag)?
                } else {
                    fragment::fragment_v3(&armored, max, self.our_tag, self.their_tag)?
                };
                Ok(pieces)
            }
            _ => Ok(vec![armored]),
        }
    }

    fn send_encoded(
        &mut self,
        host: &dyn Host,
        msg: &Message,
        version: u16,
        now: u64,
    ) -> Result<(), OtrError> {
        let raws = self.outbound_strings(host, msg, version)?;
        for raw in &raws {
            host::inject(host, &self.id, raw)?;
        }
        self.last_outbound = now;
        Ok(())
    }

    fn header(&self, version: u16, message_type: u8) -> Header {
        Header::new(version, message_type, self.our_tag, self.their_tag)
    }

    // ── Host material ────────────────────────────────────────────────────

    fn long_term(&self, host: &dyn Host) -> Result<std::sync::Arc<LongTermKeyPair>, OtrError> {
        host.long_term_keypair()
            .map_err(|e| OtrError::HostFailure(format!("get_long_term_keypair: {e}")))
    }

    fn dsa(&self, host: &dyn Host) -> Option<std::sync::Arc<crate::keys::DsaKeyPair>> {
        host.local_dsa_keypair()
    }

    /// Restore the persisted profile payload, or mint and persist a fresh
    /// one when it is absent, expired or fails validation.
    fn profile_payload(&mut self, host: &dyn Host, now: u64) -> Result<Vec<u8>, OtrError> {
        if let Some(payload) = &self.profile_payload {
            if let Ok(profile) = ClientProfile::decode(payload) {
                if profile.validate(now).is_ok() {
                    return Ok(payload.clone());
                }
            }
            self.profile_payload = None;
        }
        match host.restore_client_profile_payload() {
            Ok(Some(payload)) => {
                if let Ok(profile) = ClientProfile::decode(&payload) {
                    if profile.validate(now).is_ok() {
                        // The persisted profile carries our durable tag.
                        self.our_tag = profile.instance_tag;
                        self.profile_payload = Some(payload.clone());
                        return Ok(payload);
                    }
                }
                debug!("stored client profile rejected; regenerating");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "restore_client_profile_payload failed"),
        }
        let policy = host::policy(host, &self.id)?;
        let long_term = self.long_term(host)?;
        let forging = host
            .forging_keypair()
            .map_err(|e| OtrError::HostFailure(format!("get_forging_keypair: {e}")))?;
        let dsa = self.dsa(host);
        let profile = ClientProfile::sign(
            self.our_tag,
            &long_term,
            &forging,
            &policy.allowed_versions(),
            now + DEFAULT_LIFETIME_SECS,
            dsa.as_deref(),
        )?;
        let payload = profile.encode();
        host.update_client_profile_payload(&payload);
        self.profile_payload = Some(payload.clone());
        Ok(payload)
    }
}

// ── Free helpers ─────────────────────────────────────────────────────────────

fn random_instance_tag() -> u32 {
    loop {
        let tag = OsRng.next_u32();
        if tag >= MIN_INSTANCE_TAG {
            return tag;
        }
    }
}

/// Bytes the v4 authenticator covers: header through ciphertext, keyed by
/// the MAC key in front.
fn mac_input_v4(mac_key: &[u8; 64], msg: &DataMessageV4) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_raw(mac_key);
    w.write_u16(msg.header.version);
    w.write_u8(msg.header.message_type);
    w.write_u32(msg.header.sender_tag);
    w.write_u32(msg.header.receiver_tag);
    w.write_u8(msg.flags);
    w.write_u32(msg.pn);
    w.write_u32(msg.ratchet_id);
    w.write_u32(msg.message_id);
    w.write_point(&msg.ecdh);
    if let Some(dh) = &msg.dh {
        w.write_mpi(dh);
    }
    w.write_data(&msg.ciphertext);
    w.into_bytes()
}

fn smp_tlv(msg: &SmpMessage) -> Tlv {
    let t = match msg {
        SmpMessage::One(_) => tlv_type::SMP1,
        SmpMessage::Two(_) => tlv_type::SMP2,
        SmpMessage::Three(_) => tlv_type::SMP3,
        SmpMessage::Four(_) => tlv_type::SMP4,
    };
    Tlv::new(t, msg.encode())
}
