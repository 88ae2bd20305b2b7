//! Engine error taxonomy.
//!
//! Nothing in here tears a session down by itself: protocol and crypto
//! failures drop the offending message or abort a handshake attempt, and
//! only an explicit end or a timeout changes session state.

use thiserror::Error;

use dl_otr_crypto::CryptoError;
use dl_otr_proto::ProtoError;

#[derive(Debug, Error)]
pub enum OtrError {
    /// Malformed wire bytes, inconsistent fields, disallowed instance
    /// tags, fragment violations, skip-cap overruns.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Signature, MAC or point validation failure.
    #[error("Cryptographic failure: {0}")]
    Crypto(String),

    /// The message key for these coordinates is no longer (or not yet)
    /// derivable: replay, or a gap the ratchet cannot bridge.
    #[error("Message key unavailable for out-of-order message")]
    OutOfOrderUnavailable,

    /// Operation not legal in the current session state.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// A fatal host callback failed.
    #[error("Host callback failed: {0}")]
    HostFailure(String),

    /// SMP round verification failed or a cheat was detected.
    #[error("SMP failure: {0}")]
    Smp(String),
}

impl From<ProtoError> for OtrError {
    fn from(e: ProtoError) -> Self {
        OtrError::Protocol(e.to_string())
    }
}

impl From<CryptoError> for OtrError {
    fn from(e: CryptoError) -> Self {
        OtrError::Crypto(e.to_string())
    }
}
