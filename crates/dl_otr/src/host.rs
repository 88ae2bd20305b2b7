//! The host boundary.
//!
//! The engine owns no transport, no persistence and no UI. Everything it
//! needs from the outside world arrives through the [`Host`] trait, and
//! everything it has to say goes back out through `inject_message` and
//! `handle_event`. Callback failures are contained here: only
//! `inject_message` and `session_policy` are load-bearing enough to abort
//! the current operation; the rest degrade to a warning.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use dl_otr_crypto::ed448::LongTermKeyPair;

use crate::error::OtrError;
use crate::keys::DsaKeyPair;

/// Stable identity of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub local_account: String,
    pub remote_account: String,
    pub protocol: String,
}

impl SessionId {
    pub fn new(local: impl Into<String>, remote: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            local_account: local.into(),
            remote_account: remote.into(),
            protocol: protocol.into(),
        }
    }
}

/// Host-visible failure of a callback.
#[derive(Debug, Clone)]
pub struct HostError(pub String);

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HostError {}

// ── Policy ───────────────────────────────────────────────────────────────────

/// Per-session policy, supplied by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub allow_v3: bool,
    pub allow_v4: bool,
    /// Refuse to send plaintext while unencrypted.
    pub require_encryption: bool,
    /// Append a whitespace tag to outgoing plaintext until the peer bites.
    pub opportunistic: bool,
    /// Start a key exchange when the peer reports an OTR error.
    pub error_start_ake: bool,
    /// Seconds of outbound silence before an empty keepalive message.
    pub heartbeat_interval: u64,
    /// Seconds of total inactivity before the session is torn down.
    pub session_expiry: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allow_v3: true,
            allow_v4: true,
            require_encryption: false,
            opportunistic: false,
            error_start_ake: false,
            heartbeat_interval: 60,
            session_expiry: 3600,
        }
    }
}

impl Policy {
    /// Versions this policy will offer or accept, preferred first.
    pub fn allowed_versions(&self) -> Vec<u16> {
        let mut v = Vec::new();
        if self.allow_v4 {
            v.push(dl_otr_proto::message::VERSION_4);
        }
        if self.allow_v3 {
            v.push(dl_otr_proto::message::VERSION_3);
        }
        v
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An encrypted session is up (detail: negotiated version).
    EncryptedStart,
    /// The peer ended the encrypted session.
    EncryptedEnd,
    /// Outbound text was dropped because the session is finished.
    SessionFinished,
    /// An inbound message could not be read (detail: reason).
    UnreadableMessage,
    /// The peer sent an OTR error message (detail: its text).
    ErrorReceived,
    /// Peer started SMP (detail: the question, possibly empty).
    SmpStarted,
    /// SMP advanced a round (detail: percent complete).
    SmpInProgress,
    SmpSucceeded,
    SmpFailed,
    SmpAborted,
    /// A keepalive message went out.
    HeartbeatSent,
    /// An inbound message was dropped (detail: reason).
    MessageDropped,
    /// The peer requested the extra symmetric key (detail: hex key).
    ExtraKey,
}

// ── Host trait ───────────────────────────────────────────────────────────────

pub trait Host {
    /// Hand a raw message to the transport. Fatal on failure.
    fn inject_message(&self, id: &SessionId, raw: &str) -> Result<(), HostError>;

    /// Long-term Ed448 identity key pair.
    fn long_term_keypair(&self) -> Result<Arc<LongTermKeyPair>, HostError>;

    /// Ed448 forging key pair (its secret is published or discarded by the
    /// host; the engine only needs the pair for profile construction).
    fn forging_keypair(&self) -> Result<Arc<LongTermKeyPair>, HostError>;

    /// Legacy DSA key pair, used by the version 3 path and for the
    /// transitional profile signature. `None` disables both.
    fn local_dsa_keypair(&self) -> Option<Arc<DsaKeyPair>>;

    /// Previously persisted client-profile payload, if any.
    fn restore_client_profile_payload(&self) -> Result<Option<Vec<u8>>, HostError>;

    /// Persist a (re)generated client-profile payload. Best effort.
    fn update_client_profile_payload(&self, payload: &[u8]);

    /// Session policy. Fatal on failure.
    fn session_policy(&self, id: &SessionId) -> Result<Policy, HostError>;

    /// Maximum transport message size; `None` disables fragmentation.
    fn max_fragment_size(&self, id: &SessionId) -> Option<usize>;

    /// Asynchronous notification channel to the UI.
    fn handle_event(&self, id: &SessionId, peer_tag: u32, event: EventKind, detail: &str);
}

// ── Guarded call helpers ─────────────────────────────────────────────────────

pub(crate) fn inject(host: &dyn Host, id: &SessionId, raw: &str) -> Result<(), OtrError> {
    host.inject_message(id, raw)
        .map_err(|e| OtrError::HostFailure(format!("inject_message: {e}")))
}

pub(crate) fn policy(host: &dyn Host, id: &SessionId) -> Result<Policy, OtrError> {
    host.session_policy(id)
        .map_err(|e| OtrError::HostFailure(format!("get_session_policy: {e}")))
}

pub(crate) fn event(host: &dyn Host, id: &SessionId, peer_tag: u32, kind: EventKind, detail: &str) {
    host.handle_event(id, peer_tag, kind, detail);
}
