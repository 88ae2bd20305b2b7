//! Double ratchet.
//!
//! State separation:
//!   root key   — 64 bytes, advanced on every asymmetric rotation
//!   Cks / Ckr  — sending / receiving chain keys, advanced per message
//!   Mk         — message key, derived from the chain key, used once
//!
//! Ratchet ids form one shared sequence. The DAKE responder derives
//! sending chain 0 straight from the first root key (the DAKE ephemerals
//! are ratchet 0's DH contribution); every later ratchet is created by a
//! sender rotation on one side and mirrored by a receiver rotation on the
//! other. Every third ratchet mixes a fresh 3072-bit DH output next to
//! the per-ratchet ECDH output.
//!
//! Forward secrecy: chain keys are overwritten as they advance, and a
//! rotation wipes the chain it abandons. Deniability: MAC keys of
//! verified inbound messages accumulate in a reveal buffer that rides out
//! with the next message we send.

use std::collections::HashMap;

use ed448_goldilocks::EdwardsPoint;
use num_bigint::BigUint;
use zeroize::Zeroize;

use dl_otr_crypto::dh3072::DhKeyPair;
use dl_otr_crypto::ed448::EcdhKeyPair;
use dl_otr_crypto::kdf::{self, usage};

use crate::error::OtrError;

/// Most skipped message keys tolerated per chain.
pub const MAX_SKIP: u32 = 1000;

pub const ROOT_KEY_LENGTH: usize = 64;
pub const CHAIN_KEY_LENGTH: usize = 64;
pub const MESSAGE_KEY_LENGTH: usize = 32;
pub const MAC_KEY_LENGTH: usize = 64;
pub const NONCE_LENGTH: usize = 24;

/// Which side of the finished DAKE this ratchet belongs to. The first
/// sender owns ratchet 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    FirstSender,
    FirstReceiver,
}

/// Everything the session needs to assemble one outbound data message.
pub struct SendStep {
    pub ratchet_id: u32,
    pub message_id: u32,
    pub pn: u32,
    pub ecdh: [u8; 57],
    /// Our current DH public, present on every-third ratchets.
    pub dh: Option<Vec<u8>>,
    pub message_key: [u8; MESSAGE_KEY_LENGTH],
    pub mac_key: [u8; MAC_KEY_LENGTH],
    pub nonce: [u8; NONCE_LENGTH],
    pub revealed_macs: Vec<u8>,
}

pub struct RecvKeys {
    pub message_key: [u8; MESSAGE_KEY_LENGTH],
    pub mac_key: [u8; MAC_KEY_LENGTH],
    pub nonce: [u8; NONCE_LENGTH],
}

pub struct DoubleRatchet {
    root_key: [u8; ROOT_KEY_LENGTH],
    /// Mixed key of the newest rotation; source of the extra symmetric key.
    mixed_key: [u8; 64],

    next_ratchet_id: u32,
    needs_rotation: bool,

    // Sending side.
    send_ratchet_id: u32,
    j: u32,
    cks: Option<[u8; CHAIN_KEY_LENGTH]>,
    prev_chain_len: u32,
    our_ecdh: EcdhKeyPair,
    our_dh: DhKeyPair,

    // Receiving side.
    recv_ratchet_id: u32,
    k: u32,
    ckr: Option<[u8; CHAIN_KEY_LENGTH]>,
    their_ecdh: EdwardsPoint,
    their_dh: BigUint,

    /// Message keys held for out-of-order delivery, keyed by (i, k).
    skipped: HashMap<(u32, u32), [u8; MESSAGE_KEY_LENGTH]>,
    /// Verified inbound MAC keys awaiting disclosure.
    reveal: Vec<u8>,
}

impl DoubleRatchet {
    /// Install the ratchet from the DAKE's mixed key `k_dake` and the key
    /// material both sides already exchanged during the handshake.
    pub fn new(
        role: Role,
        k_dake: &[u8; 64],
        our_ecdh: EcdhKeyPair,
        our_dh: DhKeyPair,
        their_ecdh: EdwardsPoint,
        their_dh: BigUint,
    ) -> Self {
        let root_key = kdf::kdf_64(usage::FIRST_ROOT_KEY, k_dake);
        let chain0 = kdf::kdf_64(usage::INITIAL_CHAIN_KEY, &root_key);
        let (cks, ckr) = match role {
            Role::FirstSender => (Some(chain0), None),
            Role::FirstReceiver => (None, Some(chain0)),
        };
        Self {
            root_key,
            mixed_key: *k_dake,
            next_ratchet_id: 1,
            needs_rotation: role == Role::FirstReceiver,
            send_ratchet_id: 0,
            j: 0,
            cks,
            prev_chain_len: 0,
            our_ecdh,
            our_dh,
            recv_ratchet_id: 0,
            k: 0,
            ckr,
            their_ecdh,
            their_dh,
            skipped: HashMap::new(),
            reveal: Vec::new(),
        }
    }

    pub fn next_ratchet_id(&self) -> u32 {
        self.next_ratchet_id
    }

    pub fn send_chain(&self) -> (u32, u32) {
        (self.send_ratchet_id, self.j)
    }

    pub fn recv_chain(&self) -> (u32, u32) {
        (self.recv_ratchet_id, self.k)
    }

    /// True when we have unsent MAC-key disclosures queued.
    pub fn has_pending_reveals(&self) -> bool {
        !self.reveal.is_empty()
    }

    /// 64-byte out-of-band key derived from the current mixed key.
    pub fn extra_symmetric_key(&self) -> [u8; 64] {
        kdf::kdf_64(usage::EXTRA_KEY, &self.mixed_key)
    }

    // ── Sending ──────────────────────────────────────────────────────────

    pub fn send_step(&mut self) -> Result<SendStep, OtrError> {
        if self.needs_rotation {
            self.rotate_sender_keys()?;
        }
        let ck = self
            .cks
            .as_mut()
            .ok_or(OtrError::InvalidState("no sending chain installed"))?;
        let message_key = kdf::kdf_32(usage::MESSAGE_KEY, &ck[..]);
        let mac_key = kdf::kdf_64(usage::MAC_KEY, &message_key);
        let next = kdf::kdf_64(usage::NEXT_CHAIN_KEY, &ck[..]);
        ck.zeroize();
        *ck = next;

        let step = SendStep {
            ratchet_id: self.send_ratchet_id,
            message_id: self.j,
            pn: self.prev_chain_len,
            ecdh: self.our_ecdh.public_bytes(),
            dh: (self.send_ratchet_id % 3 == 0)
                .then(|| self.our_dh.public().to_bytes_be()),
            message_key,
            mac_key,
            nonce: nonce_for(self.send_ratchet_id, self.j),
            revealed_macs: std::mem::take(&mut self.reveal),
        };
        self.j += 1;
        Ok(step)
    }

    /// Begin a new sending ratchet: fresh ECDH pair, fresh DH pair on
    /// every third ratchet, root and chain keys re-derived.
    fn rotate_sender_keys(&mut self) -> Result<(), OtrError> {
        let id = self.next_ratchet_id;
        self.prev_chain_len = self.j;

        self.our_ecdh.close();
        self.our_ecdh = EcdhKeyPair::generate();
        if id % 3 == 0 {
            self.our_dh.close();
            self.our_dh = DhKeyPair::generate();
        }

        let ecdh_secret = self.our_ecdh.shared_secret(&self.their_ecdh)?;
        let dh_secret = if id % 3 == 0 {
            Some(self.our_dh.shared_secret(&self.their_dh)?)
        } else {
            None
        };
        let chain = self.mix(&ecdh_secret, dh_secret.as_deref());

        self.cks = Some(chain);
        self.send_ratchet_id = id;
        self.j = 0;
        self.next_ratchet_id = id + 1;
        self.needs_rotation = false;
        Ok(())
    }

    // ── Receiving ────────────────────────────────────────────────────────

    /// Derive the keys for inbound message `(i, k)`. `pn` is the length of
    /// the peer's previous sending chain; `their_ecdh`/`their_dh` are the
    /// public keys the message carries.
    pub fn recv_step(
        &mut self,
        i: u32,
        k: u32,
        pn: u32,
        their_ecdh: &EdwardsPoint,
        their_dh: Option<&BigUint>,
    ) -> Result<RecvKeys, OtrError> {
        // Out-of-order buffer first; hit means consume-and-delete.
        if let Some(mut mk) = self.skipped.remove(&(i, k)) {
            let keys = recv_keys_from(&mk, i, k);
            mk.zeroize();
            return Ok(keys);
        }

        if self.ckr.is_some() && i == self.recv_ratchet_id {
            if k < self.k {
                return Err(OtrError::OutOfOrderUnavailable);
            }
            self.skip_to(k)?;
            return self.derive_current(i, k);
        }

        if i == self.next_ratchet_id {
            self.rotate_receiver_keys(i, pn, their_ecdh, their_dh)?;
            self.skip_to(k)?;
            return self.derive_current(i, k);
        }

        // Behind the current chain, or beyond the one ratchet the root-key
        // sequence lets us bridge.
        Err(OtrError::OutOfOrderUnavailable)
    }

    fn rotate_receiver_keys(
        &mut self,
        i: u32,
        pn: u32,
        their_ecdh: &EdwardsPoint,
        their_dh: Option<&BigUint>,
    ) -> Result<(), OtrError> {
        if (i % 3 == 0) != their_dh.is_some() {
            return Err(OtrError::Protocol(
                "DH public key presence does not match ratchet id".into(),
            ));
        }

        // Close out the abandoned chain: stash what the peer says it sent.
        if self.ckr.is_some() {
            if pn > self.k + MAX_SKIP {
                return Err(OtrError::Protocol("skipped-key cap exceeded".into()));
            }
            self.skip_to(pn)?;
            if let Some(ck) = self.ckr.as_mut() {
                ck.zeroize();
            }
            self.ckr = None;
        }

        let ecdh_secret = self.our_ecdh.shared_secret(their_ecdh)?;
        let dh_secret = match their_dh {
            Some(dh) => Some(self.our_dh.shared_secret(dh)?),
            None => None,
        };
        let chain = self.mix(&ecdh_secret, dh_secret.as_deref());

        self.ckr = Some(chain);
        self.recv_ratchet_id = i;
        self.k = 0;
        self.next_ratchet_id = i + 1;
        self.their_ecdh = *their_ecdh;
        if let Some(dh) = their_dh {
            self.their_dh = dh.clone();
        }
        // Our next send must answer with a rotation of its own.
        self.needs_rotation = true;
        Ok(())
    }

    /// Advance the receiving chain to message `target`, stashing the keys
    /// of everything we jump over.
    fn skip_to(&mut self, target: u32) -> Result<(), OtrError> {
        if target > self.k + MAX_SKIP {
            return Err(OtrError::Protocol("skipped-key cap exceeded".into()));
        }
        while self.k < target {
            let ck = self
                .ckr
                .as_mut()
                .ok_or(OtrError::InvalidState("no receiving chain installed"))?;
            let mk = kdf::kdf_32(usage::MESSAGE_KEY, &ck[..]);
            let next = kdf::kdf_64(usage::NEXT_CHAIN_KEY, &ck[..]);
            ck.zeroize();
            *ck = next;
            self.skipped.insert((self.recv_ratchet_id, self.k), mk);
            self.k += 1;
        }
        Ok(())
    }

    fn derive_current(&mut self, i: u32, k: u32) -> Result<RecvKeys, OtrError> {
        let ck = self
            .ckr
            .as_mut()
            .ok_or(OtrError::InvalidState("no receiving chain installed"))?;
        let mut mk = kdf::kdf_32(usage::MESSAGE_KEY, &ck[..]);
        let next = kdf::kdf_64(usage::NEXT_CHAIN_KEY, &ck[..]);
        ck.zeroize();
        *ck = next;
        self.k = k + 1;
        let keys = recv_keys_from(&mk, i, k);
        mk.zeroize();
        Ok(keys)
    }

    /// Queue a spent inbound MAC key for disclosure with our next message.
    pub fn reveal_mac_key(&mut self, mac_key: &[u8; MAC_KEY_LENGTH]) {
        self.reveal.extend_from_slice(mac_key);
    }

    fn mix(&mut self, ecdh_secret: &[u8], dh_secret: Option<&[u8]>) -> [u8; CHAIN_KEY_LENGTH] {
        let mut input = Vec::with_capacity(ecdh_secret.len() + dh_secret.map_or(0, <[u8]>::len));
        input.extend_from_slice(ecdh_secret);
        if let Some(dh) = dh_secret {
            input.extend_from_slice(dh);
        }
        let mixed = kdf::kdf_64(usage::SHARED_SECRET, &input);
        input.zeroize();

        let mut root_input = Vec::with_capacity(ROOT_KEY_LENGTH + 64);
        root_input.extend_from_slice(&self.root_key);
        root_input.extend_from_slice(&mixed);
        let new_root = kdf::kdf_64(usage::ROOT_KEY, &root_input);
        root_input.zeroize();

        self.root_key.zeroize();
        self.root_key = new_root;
        self.mixed_key.zeroize();
        self.mixed_key = mixed;
        kdf::kdf_64(usage::CHAIN_KEY, &self.root_key)
    }
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.mixed_key.zeroize();
        if let Some(ck) = self.cks.as_mut() {
            ck.zeroize();
        }
        if let Some(ck) = self.ckr.as_mut() {
            ck.zeroize();
        }
        for (_, mk) in self.skipped.iter_mut() {
            mk.zeroize();
        }
        self.reveal.zeroize();
    }
}

fn nonce_for(i: u32, j: u32) -> [u8; NONCE_LENGTH] {
    let mut coords = [0u8; 8];
    coords[..4].copy_from_slice(&i.to_be_bytes());
    coords[4..].copy_from_slice(&j.to_be_bytes());
    kdf::kdf_24(usage::NONCE, &coords)
}

fn recv_keys_from(mk: &[u8; MESSAGE_KEY_LENGTH], i: u32, k: u32) -> RecvKeys {
    RecvKeys {
        message_key: *mk,
        mac_key: kdf::kdf_64(usage::MAC_KEY, mk),
        nonce: nonce_for(i, k),
    }
}
