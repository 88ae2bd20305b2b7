//! Legacy encrypted-session keys and data-message handling.
//!
//! Each side advances a keyid-labelled DH ratchet. A sender signs with
//! its previous key generation while advertising the newest one in the
//! `dh_y` field; a message that acknowledges our newest key retires the
//! generation before it and triggers a fresh one. Encryption is
//! AES-128-CTR under a per-direction key from the current DH secret;
//! authentication is HMAC-SHA1. MAC keys of retired receiving keys are
//! disclosed in later messages.

use std::collections::HashMap;

use num_bigint::BigUint;

use dl_otr_crypto::kdf::constant_time_equals;
use dl_otr_crypto::legacy::{aes128_ctr, hmac_sha1, sha1};
use dl_otr_proto::encode::Writer;
use dl_otr_proto::message::{DataMessageV3, Header};

use crate::error::OtrError;
use crate::v3::DhPair;

const AES_KEY_LENGTH: usize = 16;
const MAC_V3_KEY_LENGTH: usize = 20;

/// Direction byte for the key derivation: the numerically higher public
/// key sends with 0x01.
fn send_byte(sender_public: &BigUint, receiver_public: &BigUint) -> u8 {
    if sender_public > receiver_public {
        0x01
    } else {
        0x02
    }
}

fn derive_keys(s: &BigUint, byte: u8) -> ([u8; AES_KEY_LENGTH], [u8; MAC_V3_KEY_LENGTH]) {
    let mut w = Writer::new();
    w.write_mpi(&s.to_bytes_be());
    let secbytes = w.into_bytes();
    let mut input = Vec::with_capacity(1 + secbytes.len());
    input.push(byte);
    input.extend_from_slice(&secbytes);
    let h = sha1(&input);
    let mut ek = [0u8; AES_KEY_LENGTH];
    ek.copy_from_slice(&h[..AES_KEY_LENGTH]);
    let mk = sha1(&ek);
    (ek, mk)
}

struct ComboState {
    /// Highest counter seen from the peer under this key pair.
    max_ctr: u64,
    /// Receiving MAC key, kept so it can be revealed once retired.
    mac_key: [u8; MAC_V3_KEY_LENGTH],
    mac_used: bool,
}

pub struct V3Session {
    ssid: [u8; 8],
    /// Id of our newest (advertised) key; we sign with the one before it.
    our_keyid: u32,
    our_newest: DhPair,
    our_signing: DhPair,
    /// Newest peer key we have seen.
    their_keyid: u32,
    their_newest: BigUint,
    their_previous: Option<BigUint>,
    ctr_out: u64,
    combos: HashMap<(u32, u32), ComboState>,
    old_mac_keys: Vec<u8>,
}

impl V3Session {
    /// Stand the session up from the AKE result: both sides used key
    /// generation `ake_keyid` in the handshake, and we immediately
    /// advertise a fresh generation on top of it.
    pub fn new(
        ssid: [u8; 8],
        our_ake_pair: DhPair,
        ake_keyid: u32,
        their_public: BigUint,
        their_keyid: u32,
    ) -> Self {
        Self {
            ssid,
            our_keyid: ake_keyid + 1,
            our_newest: DhPair::generate(),
            our_signing: our_ake_pair,
            their_keyid,
            their_newest: their_public,
            their_previous: None,
            ctr_out: 0,
            combos: HashMap::new(),
            old_mac_keys: Vec::new(),
        }
    }

    pub fn ssid(&self) -> [u8; 8] {
        self.ssid
    }

    /// Encrypt and authenticate one outbound payload.
    pub fn encrypt(
        &mut self,
        header: Header,
        flags: u8,
        payload: &[u8],
    ) -> Result<DataMessageV3, OtrError> {
        let s = self.our_signing.shared_secret(&self.their_newest)?;
        let byte = send_byte(&self.our_signing.public, &self.their_newest);
        let (ek, mk) = derive_keys(&s, byte);

        self.ctr_out += 1;
        let ctr = self.ctr_out.to_be_bytes();
        let encrypted = aes128_ctr(&ek, &ctr, payload);

        let mut msg = DataMessageV3 {
            header,
            flags,
            sender_keyid: self.our_keyid - 1,
            recipient_keyid: self.their_keyid,
            dh_y: self.our_newest.public.to_bytes_be(),
            ctr,
            encrypted,
            mac: [0u8; MAC_V3_KEY_LENGTH],
            old_mac_keys: std::mem::take(&mut self.old_mac_keys),
        };
        msg.mac = hmac_sha1(&mk, &mac_input(&msg));
        Ok(msg)
    }

    /// Verify, decrypt and ratchet on one inbound data message.
    pub fn decrypt(&mut self, msg: &DataMessageV3) -> Result<Vec<u8>, OtrError> {
        let their_public = if msg.sender_keyid == self.their_keyid {
            self.their_newest.clone()
        } else if msg.sender_keyid + 1 == self.their_keyid {
            self.their_previous
                .clone()
                .ok_or(OtrError::OutOfOrderUnavailable)?
        } else {
            return Err(OtrError::OutOfOrderUnavailable);
        };
        let our_pair = if msg.recipient_keyid == self.our_keyid {
            self.our_newest.clone()
        } else if msg.recipient_keyid + 1 == self.our_keyid {
            self.our_signing.clone()
        } else {
            return Err(OtrError::OutOfOrderUnavailable);
        };

        let s = our_pair.shared_secret(&their_public)?;
        let byte = send_byte(&their_public, &our_pair.public);
        let (ek, mk) = derive_keys(&s, byte);

        let expected = hmac_sha1(&mk, &mac_input(msg));
        if !constant_time_equals(&expected, &msg.mac) {
            return Err(OtrError::Crypto("data message MAC mismatch".into()));
        }

        let ctr = u64::from_be_bytes(msg.ctr);
        let combo = self
            .combos
            .entry((msg.sender_keyid, msg.recipient_keyid))
            .or_insert(ComboState { max_ctr: 0, mac_key: mk, mac_used: false });
        if ctr == 0 || ctr <= combo.max_ctr {
            return Err(OtrError::Protocol("counter did not increase".into()));
        }
        combo.max_ctr = ctr;
        combo.mac_used = true;

        let payload = aes128_ctr(&ek, &msg.ctr, &msg.encrypted);

        // Adopt their newly advertised key.
        if msg.sender_keyid == self.their_keyid {
            let falling_out = self.their_keyid.saturating_sub(1);
            self.drain_combos(|(sk, _)| *sk == falling_out);
            let next = BigUint::from_bytes_be(&msg.dh_y);
            self.their_previous = Some(std::mem::replace(&mut self.their_newest, next));
            self.their_keyid += 1;
        }
        // They acknowledged our newest key: retire the signing generation.
        if msg.recipient_keyid == self.our_keyid {
            let falling_out = self.our_keyid - 1;
            self.drain_combos(|(_, rk)| *rk == falling_out);
            self.our_signing =
                std::mem::replace(&mut self.our_newest, DhPair::generate());
            self.our_keyid += 1;
        }

        Ok(payload)
    }

    fn drain_combos(&mut self, pred: impl Fn(&(u32, u32)) -> bool) {
        let retired: Vec<(u32, u32)> = self.combos.keys().filter(|k| pred(k)).copied().collect();
        for key in retired {
            if let Some(combo) = self.combos.remove(&key) {
                if combo.mac_used {
                    self.old_mac_keys.extend_from_slice(&combo.mac_key);
                }
            }
        }
    }
}

/// Bytes covered by the data-message MAC: header through ciphertext.
fn mac_input(msg: &DataMessageV3) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u16(msg.header.version);
    w.write_u8(msg.header.message_type);
    w.write_u32(msg.header.sender_tag);
    w.write_u32(msg.header.receiver_tag);
    w.write_u8(msg.flags);
    w.write_u32(msg.sender_keyid);
    w.write_u32(msg.recipient_keyid);
    w.write_mpi(&msg.dh_y);
    w.write_raw(&msg.ctr);
    w.write_data(&msg.encrypted);
    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dl_otr_proto::message::{msg_type, VERSION_3};

    fn header() -> Header {
        Header::new(VERSION_3, msg_type::DATA, 0x100, 0x200)
    }

    fn linked_pair() -> (V3Session, V3Session) {
        let a = DhPair::generate();
        let b = DhPair::generate();
        let ssid = [7u8; 8];
        let alice = V3Session::new(ssid, a.clone(), 1, b.public.clone(), 1);
        let bob = V3Session::new(ssid, b, 1, a.public, 1);
        (alice, bob)
    }

    #[test]
    fn conversation_ratchets_forward() {
        let (mut alice, mut bob) = linked_pair();
        for turn in 0..4 {
            let text = format!("message {turn}");
            let msg = alice.encrypt(header(), 0, text.as_bytes()).unwrap();
            assert_eq!(bob.decrypt(&msg).unwrap(), text.as_bytes());

            let reply = bob.encrypt(header(), 0, b"ack").unwrap();
            assert_eq!(alice.decrypt(&reply).unwrap(), b"ack");
        }
        // Both sides have advanced past their initial key generations.
        assert!(alice.our_keyid > 2 && alice.their_keyid > 2);
        assert!(bob.our_keyid > 2 && bob.their_keyid > 2);
    }

    #[test]
    fn one_sided_burst_still_decrypts() {
        let (mut alice, mut bob) = linked_pair();
        for i in 0..5 {
            let text = format!("burst {i}");
            let msg = alice.encrypt(header(), 0, text.as_bytes()).unwrap();
            assert_eq!(bob.decrypt(&msg).unwrap(), text.as_bytes());
        }
    }

    #[test]
    fn replayed_counter_rejected() {
        let (mut alice, mut bob) = linked_pair();
        let msg = alice.encrypt(header(), 0, b"once").unwrap();
        bob.decrypt(&msg).unwrap();
        assert!(matches!(
            bob.decrypt(&msg),
            Err(OtrError::OutOfOrderUnavailable) | Err(OtrError::Protocol(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (mut alice, mut bob) = linked_pair();
        let mut msg = alice.encrypt(header(), 0, b"payload").unwrap();
        msg.encrypted[0] ^= 1;
        assert!(matches!(bob.decrypt(&msg), Err(OtrError::Crypto(_))));
    }

    #[test]
    fn retired_keys_disclose_macs() {
        let (mut alice, mut bob) = linked_pair();
        for _ in 0..3 {
            let m = alice.encrypt(header(), 0, b"x").unwrap();
            bob.decrypt(&m).unwrap();
            let r = bob.encrypt(header(), 0, b"y").unwrap();
            alice.decrypt(&r).unwrap();
        }
        let m = alice.encrypt(header(), 0, b"final").unwrap();
        assert!(
            !m.old_mac_keys.is_empty(),
            "retired receiving MAC keys ride out with later messages"
        );
        assert_eq!(m.old_mac_keys.len() % MAC_V3_KEY_LENGTH, 0);
        bob.decrypt(&m).unwrap();
    }
}
