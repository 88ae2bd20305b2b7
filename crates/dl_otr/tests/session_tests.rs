//! End-to-end conversations between two engines over an in-memory host.

use std::sync::Arc;

use parking_lot::Mutex;

use dl_otr::host::{EventKind, Host, HostError, Policy, SessionId};
use dl_otr::keys::DsaKeyPair;
use dl_otr::session::Session;
use dl_otr_crypto::ed448::LongTermKeyPair;
use dl_otr_proto::armor::{classify, Classified};
use dl_otr_proto::message::Message;

const NOW: u64 = 1_700_000_000;

struct TestHost {
    long_term: Arc<LongTermKeyPair>,
    forging: Arc<LongTermKeyPair>,
    dsa: Option<Arc<DsaKeyPair>>,
    policy: Policy,
    max_fragment: Option<usize>,
    injected: Mutex<Vec<String>>,
    events: Mutex<Vec<(EventKind, String)>>,
    profile_store: Mutex<Option<Vec<u8>>>,
}

impl TestHost {
    fn new(policy: Policy, dsa: bool) -> Self {
        Self {
            long_term: Arc::new(LongTermKeyPair::generate()),
            forging: Arc::new(LongTermKeyPair::generate()),
            dsa: dsa.then(|| Arc::new(DsaKeyPair::generate())),
            policy,
            max_fragment: None,
            injected: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            profile_store: Mutex::new(None),
        }
    }

    fn drain_injected(&self) -> Vec<String> {
        std::mem::take(&mut *self.injected.lock())
    }

    fn has_event(&self, kind: EventKind) -> bool {
        self.events.lock().iter().any(|(k, _)| *k == kind)
    }

    fn event_detail(&self, kind: EventKind) -> Option<String> {
        self.events
            .lock()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, d)| d.clone())
    }
}

impl Host for TestHost {
    fn inject_message(&self, _id: &SessionId, raw: &str) -> Result<(), HostError> {
        self.injected.lock().push(raw.to_string());
        Ok(())
    }

    fn long_term_keypair(&self) -> Result<Arc<LongTermKeyPair>, HostError> {
        Ok(self.long_term.clone())
    }

    fn forging_keypair(&self) -> Result<Arc<LongTermKeyPair>, HostError> {
        Ok(self.forging.clone())
    }

    fn local_dsa_keypair(&self) -> Option<Arc<DsaKeyPair>> {
        self.dsa.clone()
    }

    fn restore_client_profile_payload(&self) -> Result<Option<Vec<u8>>, HostError> {
        Ok(self.profile_store.lock().clone())
    }

    fn update_client_profile_payload(&self, payload: &[u8]) {
        *self.profile_store.lock() = Some(payload.to_vec());
    }

    fn session_policy(&self, _id: &SessionId) -> Result<Policy, HostError> {
        Ok(self.policy.clone())
    }

    fn max_fragment_size(&self, _id: &SessionId) -> Option<usize> {
        self.max_fragment
    }

    fn handle_event(&self, _id: &SessionId, _peer_tag: u32, event: EventKind, detail: &str) {
        self.events.lock().push((event, detail.to_string()));
    }
}

struct Pair {
    alice: Session,
    alice_host: TestHost,
    bob: Session,
    bob_host: TestHost,
}

fn session_ids() -> (SessionId, SessionId) {
    (
        SessionId::new("alice@example.net", "bob@example.net", "xmpp"),
        SessionId::new("bob@example.net", "alice@example.net", "xmpp"),
    )
}

fn v4_pair() -> Pair {
    let (aid, bid) = session_ids();
    Pair {
        alice: Session::new(aid),
        alice_host: TestHost::new(Policy::default(), false),
        bob: Session::new(bid),
        bob_host: TestHost::new(Policy::default(), false),
    }
}

fn v3_pair() -> Pair {
    let (aid, bid) = session_ids();
    let policy = Policy { allow_v4: false, ..Policy::default() };
    Pair {
        alice: Session::new(aid),
        alice_host: TestHost::new(policy.clone(), true),
        bob: Session::new(bid),
        bob_host: TestHost::new(policy, true),
    }
}

impl Pair {
    /// Shuttle injected messages both ways until the wires are quiet.
    /// Returns (cleartext delivered to alice, cleartext delivered to bob).
    fn pump(&mut self) -> (Vec<String>, Vec<String>) {
        let mut to_alice = Vec::new();
        let mut to_bob = Vec::new();
        for _ in 0..32 {
            let from_alice = self.alice_host.drain_injected();
            let from_bob = self.bob_host.drain_injected();
            if from_alice.is_empty() && from_bob.is_empty() {
                break;
            }
            for raw in from_alice {
                to_bob.extend(
                    self.bob
                        .transform_receiving(&self.bob_host, &raw, NOW)
                        .expect("bob receive"),
                );
            }
            for raw in from_bob {
                to_alice.extend(
                    self.alice
                        .transform_receiving(&self.alice_host, &raw, NOW)
                        .expect("alice receive"),
                );
            }
        }
        (to_alice, to_bob)
    }

    /// Run the key exchange to completion, alice asking.
    fn establish(&mut self) {
        self.alice.start_session(&self.alice_host, NOW).expect("start");
        self.pump();
        assert!(self.alice_host.has_event(EventKind::EncryptedStart), "alice encrypted");
        assert!(self.bob_host.has_event(EventKind::EncryptedStart), "bob encrypted");
    }

    /// Deliver alice's outbound raws to bob, returning bob's cleartext.
    fn deliver_to_bob(&mut self, raws: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for raw in raws {
            out.extend(
                self.bob
                    .transform_receiving(&self.bob_host, raw, NOW)
                    .expect("bob receive"),
            );
        }
        out
    }
}

fn decode_data_v4(raw: &str) -> dl_otr_proto::message::DataMessageV4 {
    let Classified::Encoded(bytes) = classify(raw).expect("classify") else {
        panic!("expected encoded message, got {raw:?}");
    };
    match Message::decode(&bytes).expect("decode") {
        Message::DataV4(m) => m,
        other => panic!("expected v4 data message, got {other:?}"),
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn round_trip_first_message() {
    let mut pair = v4_pair();
    pair.establish();

    let raws = pair
        .alice
        .transform_sending(&pair.alice_host, "Hello Alice!", NOW)
        .expect("send");
    assert_eq!(raws.len(), 1);
    let msg = decode_data_v4(&raws[0]);
    assert_eq!((msg.ratchet_id, msg.message_id), (0, 0));
    assert!(msg.dh.is_some(), "ratchet 0 carries a DH key");

    let delivered = pair.deliver_to_bob(&raws);
    assert_eq!(delivered, vec!["Hello Alice!".to_string()]);

    // Bob's next message discloses the spent MAC key.
    let reply = pair
        .bob
        .transform_sending(&pair.bob_host, "hi", NOW)
        .expect("reply");
    let reply_msg = decode_data_v4(&reply[0]);
    assert_eq!(reply_msg.revealed_macs.len(), 64);
}

#[test]
fn three_in_a_row_then_reply() {
    let mut pair = v4_pair();
    pair.establish();

    for j in 0..3u32 {
        let raws = pair
            .alice
            .transform_sending(&pair.alice_host, &format!("msg {j}"), NOW)
            .expect("send");
        let msg = decode_data_v4(&raws[0]);
        assert_eq!((msg.ratchet_id, msg.message_id), (0, j));
        let delivered = pair.deliver_to_bob(&raws);
        assert_eq!(delivered, vec![format!("msg {j}")]);
    }

    let reply = pair
        .bob
        .transform_sending(&pair.bob_host, "reply", NOW)
        .expect("reply");
    let msg = decode_data_v4(&reply[0]);
    assert_eq!((msg.ratchet_id, msg.message_id), (1, 0));
    assert!(msg.dh.is_none(), "1 mod 3 != 0");
    let delivered: Vec<String> = reply
        .iter()
        .flat_map(|raw| {
            pair.alice
                .transform_receiving(&pair.alice_host, raw, NOW)
                .expect("alice receive")
        })
        .collect();
    assert_eq!(delivered, vec!["reply".to_string()]);
}

#[test]
fn reordered_delivery_all_decrypt() {
    let mut pair = v4_pair();
    pair.establish();

    let mut sent = Vec::new();
    for j in 0..3u32 {
        sent.push(
            pair.alice
                .transform_sending(&pair.alice_host, &format!("m{j}"), NOW)
                .expect("send")
                .remove(0),
        );
    }
    let mut delivered = Vec::new();
    for idx in [2usize, 0, 1] {
        delivered.extend(pair.deliver_to_bob(std::slice::from_ref(&sent[idx])));
    }
    assert_eq!(delivered, vec!["m2".to_string(), "m0".to_string(), "m1".to_string()]);
}

#[test]
fn replayed_message_is_unreadable() {
    let mut pair = v4_pair();
    pair.establish();

    let raws = pair
        .alice
        .transform_sending(&pair.alice_host, "once", NOW)
        .expect("send");
    assert_eq!(pair.deliver_to_bob(&raws), vec!["once".to_string()]);

    let replayed = pair.deliver_to_bob(&raws);
    assert!(replayed.is_empty(), "replay must not decrypt");
    assert!(pair.bob_host.has_event(EventKind::UnreadableMessage));
    assert_eq!(pair.bob.state_label(), "encrypted v4", "session survives replay");
}

#[test]
fn forged_auth_r_aborts_dake() {
    let mut pair = v4_pair();
    pair.alice.start_session(&pair.alice_host, NOW).expect("start");

    // query → bob, identity → alice, auth-r appears at alice's outbox.
    let query = pair.alice_host.drain_injected();
    for raw in &query {
        pair.bob.transform_receiving(&pair.bob_host, raw, NOW).unwrap();
    }
    let identity = pair.bob_host.drain_injected();
    for raw in &identity {
        pair.alice.transform_receiving(&pair.alice_host, raw, NOW).unwrap();
    }
    let auth_r = pair.alice_host.drain_injected();
    assert_eq!(auth_r.len(), 1);

    // Flip the last byte of the ring signature.
    let Classified::Encoded(mut bytes) = classify(&auth_r[0]).unwrap() else {
        panic!("expected encoded auth-r");
    };
    let n = bytes.len();
    bytes[n - 1] ^= 0x01;
    let forged = dl_otr_proto::armor::armor(&bytes);

    pair.bob.transform_receiving(&pair.bob_host, &forged, NOW).unwrap();
    assert!(pair.bob_host.has_event(EventKind::MessageDropped));
    assert_eq!(pair.bob.state_label(), "plaintext", "DAKE aborted");
}

#[test]
fn fragmented_message_reassembles_out_of_order() {
    let mut pair = v4_pair();
    pair.alice_host.max_fragment = Some(200);
    pair.establish();

    // Long enough that the armored form needs several 200-byte pieces.
    let text = "x".repeat(600);
    let raws = pair
        .alice
        .transform_sending(&pair.alice_host, &text, NOW)
        .expect("send");
    assert!(raws.len() >= 3, "expected at least three fragments, got {}", raws.len());
    for piece in &raws {
        assert!(piece.len() <= 200);
    }

    // Deliver 2, 3, 1 … then the rest in reverse.
    let mut order: Vec<usize> = vec![1, 2, 0];
    order.extend((3..raws.len()).rev());
    let mut delivered = Vec::new();
    for idx in order {
        delivered.extend(pair.deliver_to_bob(std::slice::from_ref(&raws[idx])));
    }
    assert_eq!(delivered, vec![text]);
}

#[test]
fn whitespace_tag_starts_dake_opportunistically() {
    let mut pair = v4_pair();
    pair.alice_host.policy = Policy { opportunistic: true, ..Policy::default() };

    let raws = pair
        .alice
        .transform_sending(&pair.alice_host, "hello there", NOW)
        .expect("send");
    assert_eq!(raws.len(), 1);
    assert!(raws[0].starts_with("hello there"));
    assert!(raws[0].len() > "hello there".len(), "tag appended");

    let delivered = pair.deliver_to_bob(&raws);
    assert_eq!(delivered, vec!["hello there".to_string()]);
    pair.pump();
    assert!(pair.alice_host.has_event(EventKind::EncryptedStart));
    assert!(pair.bob_host.has_event(EventKind::EncryptedStart));
}

#[test]
fn end_session_notifies_peer() {
    let mut pair = v4_pair();
    pair.establish();

    pair.alice.end_session(&pair.alice_host, NOW).expect("end");
    assert_eq!(pair.alice.state_label(), "plaintext");
    pair.pump();
    assert!(pair.bob_host.has_event(EventKind::EncryptedEnd));
    assert_eq!(pair.bob.state_label(), "finished");

    // Outbound text in FINISHED is dropped with an event.
    let out = pair.bob.transform_sending(&pair.bob_host, "too late", NOW).unwrap();
    assert!(out.is_empty());
    assert!(pair.bob_host.has_event(EventKind::SessionFinished));
}

#[test]
fn smp_succeeds_on_matching_secret() {
    let mut pair = v4_pair();
    pair.establish();

    pair.alice
        .initiate_smp(&pair.alice_host, "first pet?", "rex", NOW)
        .expect("initiate");
    pair.pump();
    assert_eq!(
        pair.bob_host.event_detail(EventKind::SmpStarted).as_deref(),
        Some("first pet?")
    );

    pair.bob.respond_smp(&pair.bob_host, "rex", NOW).expect("respond");
    pair.pump();
    assert!(pair.alice_host.has_event(EventKind::SmpSucceeded));
    assert!(pair.bob_host.has_event(EventKind::SmpSucceeded));
}

#[test]
fn smp_fails_on_differing_secret() {
    let mut pair = v4_pair();
    pair.establish();

    pair.alice
        .initiate_smp(&pair.alice_host, "", "rex", NOW)
        .expect("initiate");
    pair.pump();
    pair.bob.respond_smp(&pair.bob_host, "fido", NOW).expect("respond");
    pair.pump();
    assert!(pair.alice_host.has_event(EventKind::SmpFailed));
    assert!(pair.bob_host.has_event(EventKind::SmpFailed));
    assert_eq!(pair.alice.state_label(), "encrypted v4", "session unaffected");
}

#[test]
fn heartbeat_and_expiry_timers() {
    let mut pair = v4_pair();
    pair.establish();

    // Outbound silence past the heartbeat interval.
    pair.alice.tick(&pair.alice_host, NOW + 120).expect("tick");
    assert!(pair.alice_host.has_event(EventKind::HeartbeatSent));
    let (_, to_bob) = pair.pump();
    assert!(to_bob.is_empty(), "heartbeat carries no text");
    assert_eq!(pair.bob.state_label(), "encrypted v4");

    // Total inactivity past the expiry window.
    pair.alice.tick(&pair.alice_host, NOW + 7200).expect("tick");
    assert!(pair.alice_host.has_event(EventKind::SessionFinished));
    assert_eq!(pair.alice.state_label(), "plaintext");
}

#[test]
fn v3_fallback_establishes_and_chats() {
    let mut pair = v3_pair();
    pair.alice.start_session(&pair.alice_host, NOW).expect("start");
    pair.pump();
    assert_eq!(
        pair.alice_host.event_detail(EventKind::EncryptedStart).as_deref(),
        Some("3")
    );
    assert_eq!(pair.alice.state_label(), "encrypted v3");
    assert_eq!(pair.bob.state_label(), "encrypted v3");

    for turn in 0..3 {
        let text = format!("legacy {turn}");
        let raws = pair
            .alice
            .transform_sending(&pair.alice_host, &text, NOW)
            .expect("send");
        assert_eq!(pair.deliver_to_bob(&raws), vec![text.clone()]);

        let reply = pair.bob.transform_sending(&pair.bob_host, "ok", NOW).expect("reply");
        let delivered: Vec<String> = reply
            .iter()
            .flat_map(|raw| {
                pair.alice
                    .transform_receiving(&pair.alice_host, raw, NOW)
                    .expect("alice receive")
            })
            .collect();
        assert_eq!(delivered, vec!["ok".to_string()]);
    }

    // SMP stays v4-only.
    assert!(pair
        .alice
        .initiate_smp(&pair.alice_host, "", "secret", NOW)
        .is_err());

    pair.alice.end_session(&pair.alice_host, NOW).expect("end");
    assert_eq!(pair.alice.state_label(), "finished");
    pair.pump();
    assert_eq!(pair.bob.state_label(), "finished");
}

#[test]
fn plaintext_passthrough_without_otr() {
    let mut pair = v4_pair();
    let raws = pair
        .alice
        .transform_sending(&pair.alice_host, "no crypto here", NOW)
        .expect("send");
    assert_eq!(raws, vec!["no crypto here".to_string()]);
    let delivered = pair.deliver_to_bob(&raws);
    assert_eq!(delivered, vec!["no crypto here".to_string()]);
    assert_eq!(pair.bob.state_label(), "plaintext");
}

#[test]
fn require_encryption_drops_and_starts() {
    let mut pair = v4_pair();
    pair.alice_host.policy = Policy { require_encryption: true, ..Policy::default() };

    let out = pair
        .alice
        .transform_sending(&pair.alice_host, "secret thought", NOW)
        .expect("send");
    assert!(out.is_empty(), "plaintext suppressed");
    assert!(pair.alice_host.has_event(EventKind::MessageDropped));

    // The triggered exchange completes on its own.
    pair.pump();
    assert!(pair.alice_host.has_event(EventKind::EncryptedStart));
}
