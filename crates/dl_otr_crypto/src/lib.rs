//! dl_otr_crypto — cryptographic primitives for the Darklock OTR engine
//!
//! # Design principles
//! - NO custom crypto primitives; curve arithmetic, XOF and ciphers come
//!   from audited RustCrypto crates. This crate only composes them into
//!   the constructions the protocol needs.
//! - Zeroize all secret material on drop.
//! - Secret comparisons go through `subtle`.
//!
//! # Module layout
//! - `ed448`   — Ed448 point/scalar codecs, pruned ECDH key pairs,
//!               long-term Schnorr key pairs
//! - `dh3072`  — 3072-bit (and legacy 1536-bit) modular Diffie-Hellman
//! - `kdf`     — SHAKE-256 usage-tagged key derivation + hash-to-scalar
//! - `stream`  — XSalsa20 data-message cipher
//! - `rsig`    — three-member ring signatures over Ed448
//! - `legacy`  — AES-CTR / HMAC / SHA helpers for the version 3 path
//! - `error`   — unified error type

pub mod dh3072;
pub mod ed448;
pub mod error;
pub mod kdf;
pub mod legacy;
pub mod rsig;
pub mod stream;

pub use error::CryptoError;
