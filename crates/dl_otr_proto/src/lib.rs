//! dl_otr_proto — wire formats for the Darklock OTR engine.
//!
//! Everything that crosses the transport is defined here: the positional
//! binary codec, the typed message records, the `?OTR:` base64 armor and
//! top-level classification, fragmentation, and the TLV records carried
//! inside encrypted payloads. No cryptographic decisions are made in this
//! crate; it parses and serialises, and rejects anything malformed.

pub mod armor;
pub mod encode;
pub mod error;
pub mod fragment;
pub mod message;
pub mod tlv;

pub use error::ProtoError;
