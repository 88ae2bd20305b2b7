use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid point encoding")]
    InvalidPoint,

    #[error("Invalid scalar encoding")]
    InvalidScalar,

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Ring signature verification failed")]
    RingSignature,

    #[error("Diffie-Hellman public value out of range")]
    DhPublicOutOfRange,

    #[error("Key pair already closed")]
    KeyPairClosed,

    #[error("MAC mismatch")]
    MacMismatch,
}
