use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unexpected end of input")]
    ShortRead,

    #[error("Trailing bytes after message")]
    TrailingBytes,

    #[error("MPI has leading zero bytes")]
    MpiLeadingZero,

    #[error("Unknown protocol version {0}")]
    UnknownVersion(u16),

    #[error("Unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("Message type 0x{0:02x} not valid under protocol version {1}")]
    TypeVersionMismatch(u8, u16),

    #[error("Instance tag {0} is reserved")]
    ReservedInstanceTag(u32),

    #[error("Invalid point encoding")]
    InvalidPoint,

    #[error("Not an OTR-encoded message")]
    NotEncoded,

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Fragment violation: {0}")]
    Fragment(String),

    #[error("TLV record truncated")]
    TlvTruncated,
}
