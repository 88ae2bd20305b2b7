//! dl_otr — Off-the-Record messaging protocol engine.
//!
//! Implements protocol version 4 (deniable authenticated key exchange,
//! double ratchet, socialist-millionaire verification) with a version 3
//! compatibility path, on top of the `dl_otr_crypto` primitives and the
//! `dl_otr_proto` wire formats.
//!
//! The engine is transport-agnostic and synchronous: the host feeds it
//! raw inbound strings, sends whatever it returns or injects, drives its
//! timers through `tick`, and supplies keys and policy through the
//! [`host::Host`] trait.
//!
//! # Module layout
//! - `host`     — host trait, policy, events, session ids
//! - `manager`  — session map and host-facing operations
//! - `session`  — per-peer protocol state machine
//! - `dake`     — interactive deniable key exchange (v4)
//! - `ratchet`  — double ratchet key evolution (v4)
//! - `smp`      — socialist millionaire comparison (v4)
//! - `profile`  — signed client profiles
//! - `keys`     — legacy DSA key material
//! - `v3`       — version 3 AKE and data path
//! - `error`    — engine error taxonomy

pub mod dake;
pub mod error;
pub mod host;
pub mod keys;
pub mod manager;
pub mod profile;
pub mod ratchet;
pub mod session;
pub mod smp;
pub mod v3;

pub use error::OtrError;
pub use host::{EventKind, Host, HostError, Policy, SessionId};
pub use manager::SessionManager;
pub use session::Session;
