//! Socialist Millionaire Protocol over Ed448.
//!
//! A four-round zero-knowledge comparison of a low-entropy shared secret.
//! Each round carries discrete-log equality proofs; a verifier learns
//! nothing beyond "equal" or "not equal". Round state:
//!
//!   EXPECT1 → EXPECT2 → EXPECT3 → EXPECT4 → SUCCEEDED | FAILED
//!
//! Either side may abort at any point, which resets to EXPECT1. A proof
//! failure is an SMP error and resets the run; it never touches the
//! enclosing encrypted session.

use ed448_goldilocks::{EdwardsPoint, EdwardsScalar as Scalar};

use dl_otr_crypto::ed448::{
    decode_point, decode_scalar, encode_point, encode_scalar, hash_to_scalar, random_scalar,
    FINGERPRINT_LENGTH,
};
use dl_otr_crypto::kdf::usage;
use dl_otr_proto::encode::{Reader, Writer};

use crate::error::OtrError;

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Smp1 {
    pub question: Vec<u8>,
    pub g2a: EdwardsPoint,
    pub c2: Scalar,
    pub d2: Scalar,
    pub g3a: EdwardsPoint,
    pub c3: Scalar,
    pub d3: Scalar,
}

#[derive(Clone)]
pub struct Smp2 {
    pub g2b: EdwardsPoint,
    pub c2: Scalar,
    pub d2: Scalar,
    pub g3b: EdwardsPoint,
    pub c3: Scalar,
    pub d3: Scalar,
    pub pb: EdwardsPoint,
    pub qb: EdwardsPoint,
    pub cp: Scalar,
    pub d5: Scalar,
    pub d6: Scalar,
}

#[derive(Clone)]
pub struct Smp3 {
    pub pa: EdwardsPoint,
    pub qa: EdwardsPoint,
    pub cp: Scalar,
    pub d5: Scalar,
    pub d6: Scalar,
    pub ra: EdwardsPoint,
    pub cr: Scalar,
    pub d7: Scalar,
}

#[derive(Clone)]
pub struct Smp4 {
    pub rb: EdwardsPoint,
    pub cr: Scalar,
    pub d7: Scalar,
}

#[derive(Clone)]
pub enum SmpMessage {
    One(Smp1),
    Two(Smp2),
    Three(Smp3),
    Four(Smp4),
}

macro_rules! write_points_scalars {
    ($w:expr, $( $field:expr => $kind:ident ),+ $(,)?) => {
        $( write_points_scalars!(@one $w, $field, $kind); )+
    };
    (@one $w:expr, $field:expr, point) => {
        $w.write_point(&encode_point(&$field));
    };
    (@one $w:expr, $field:expr, scalar) => {
        $w.write_scalar(&encode_scalar(&$field));
    };
}

impl SmpMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            SmpMessage::One(m) => {
                w.write_data(&m.question);
                write_points_scalars!(w,
                    m.g2a => point, m.c2 => scalar, m.d2 => scalar,
                    m.g3a => point, m.c3 => scalar, m.d3 => scalar,
                );
            }
            SmpMessage::Two(m) => {
                write_points_scalars!(w,
                    m.g2b => point, m.c2 => scalar, m.d2 => scalar,
                    m.g3b => point, m.c3 => scalar, m.d3 => scalar,
                    m.pb => point, m.qb => point,
                    m.cp => scalar, m.d5 => scalar, m.d6 => scalar,
                );
            }
            SmpMessage::Three(m) => {
                write_points_scalars!(w,
                    m.pa => point, m.qa => point,
                    m.cp => scalar, m.d5 => scalar, m.d6 => scalar,
                    m.ra => point, m.cr => scalar, m.d7 => scalar,
                );
            }
            SmpMessage::Four(m) => {
                write_points_scalars!(w,
                    m.rb => point, m.cr => scalar, m.d7 => scalar,
                );
            }
        }
        w.into_bytes()
    }

    pub fn decode_smp1(bytes: &[u8]) -> Result<Smp1, OtrError> {
        let mut r = Reader::new(bytes);
        let question = r.read_data()?;
        let msg = Smp1 {
            question,
            g2a: read_point(&mut r)?,
            c2: read_scalar(&mut r)?,
            d2: read_scalar(&mut r)?,
            g3a: read_point(&mut r)?,
            c3: read_scalar(&mut r)?,
            d3: read_scalar(&mut r)?,
        };
        r.expect_end()?;
        Ok(msg)
    }

    pub fn decode_smp2(bytes: &[u8]) -> Result<Smp2, OtrError> {
        let mut r = Reader::new(bytes);
        let msg = Smp2 {
            g2b: read_point(&mut r)?,
            c2: read_scalar(&mut r)?,
            d2: read_scalar(&mut r)?,
            g3b: read_point(&mut r)?,
            c3: read_scalar(&mut r)?,
            d3: read_scalar(&mut r)?,
            pb: read_point(&mut r)?,
            qb: read_point(&mut r)?,
            cp: read_scalar(&mut r)?,
            d5: read_scalar(&mut r)?,
            d6: read_scalar(&mut r)?,
        };
        r.expect_end()?;
        Ok(msg)
    }

    pub fn decode_smp3(bytes: &[u8]) -> Result<Smp3, OtrError> {
        let mut r = Reader::new(bytes);
        let msg = Smp3 {
            pa: read_point(&mut r)?,
            qa: read_point(&mut r)?,
            cp: read_scalar(&mut r)?,
            d5: read_scalar(&mut r)?,
            d6: read_scalar(&mut r)?,
            ra: read_point(&mut r)?,
            cr: read_scalar(&mut r)?,
            d7: read_scalar(&mut r)?,
        };
        r.expect_end()?;
        Ok(msg)
    }

    pub fn decode_smp4(bytes: &[u8]) -> Result<Smp4, OtrError> {
        let mut r = Reader::new(bytes);
        let msg = Smp4 {
            rb: read_point(&mut r)?,
            cr: read_scalar(&mut r)?,
            d7: read_scalar(&mut r)?,
        };
        r.expect_end()?;
        Ok(msg)
    }
}

fn read_point(r: &mut Reader<'_>) -> Result<EdwardsPoint, OtrError> {
    Ok(decode_point(&r.read_point()?)?)
}

fn read_scalar(r: &mut Reader<'_>) -> Result<Scalar, OtrError> {
    Ok(decode_scalar(&r.read_scalar()?)?)
}

// ── State machine ────────────────────────────────────────────────────────────

pub enum SmpState {
    Expect1,
    /// Peer opened a run; waiting for our user to type the secret.
    PromptedSecret { msg1: Box<Smp1> },
    /// We initiated and await SMP2.
    Expect2 { x: Scalar, a2: Scalar, a3: Scalar },
    /// We responded and await SMP3.
    Expect3 {
        g3a: EdwardsPoint,
        g2: EdwardsPoint,
        g3: EdwardsPoint,
        b3: Scalar,
        pb: EdwardsPoint,
        qb: EdwardsPoint,
    },
    /// We sent SMP3 and await the closing SMP4.
    Expect4 {
        g3b: EdwardsPoint,
        pa_pb: EdwardsPoint,
        qa_qb: EdwardsPoint,
        a3: Scalar,
    },
    Succeeded,
    Failed,
    Aborted,
}

/// What the session should tell the host after a handled round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpEvent {
    Started { question: String },
    Progress { percent: u8 },
    Succeeded,
    Failed,
    Aborted,
}

pub struct SmpOutcome {
    pub reply: Option<SmpMessage>,
    pub event: Option<SmpEvent>,
}

pub struct Smp {
    state: SmpState,
}

impl Default for Smp {
    fn default() -> Self {
        Self::new()
    }
}

impl Smp {
    pub fn new() -> Self {
        Self { state: SmpState::Expect1 }
    }

    pub fn state_label(&self) -> &'static str {
        match self.state {
            SmpState::Expect1 => "expect1",
            SmpState::PromptedSecret { .. } => "prompted",
            SmpState::Expect2 { .. } => "expect2",
            SmpState::Expect3 { .. } => "expect3",
            SmpState::Expect4 { .. } => "expect4",
            SmpState::Succeeded => "succeeded",
            SmpState::Failed => "failed",
            SmpState::Aborted => "aborted",
        }
    }

    pub fn in_progress(&self) -> bool {
        matches!(
            self.state,
            SmpState::PromptedSecret { .. }
                | SmpState::Expect2 { .. }
                | SmpState::Expect3 { .. }
                | SmpState::Expect4 { .. }
        )
    }

    /// Reset to EXPECT1 (local or remote abort).
    pub fn abort(&mut self) {
        self.state = SmpState::Aborted;
    }

    /// Open a run as the asking side.
    pub fn initiate(
        &mut self,
        secret: &Scalar,
        question: &str,
    ) -> Result<SmpMessage, OtrError> {
        if self.in_progress() {
            return Err(OtrError::Smp("comparison already in progress".into()));
        }
        let a2 = random_scalar();
        let a3 = random_scalar();
        let r2 = random_scalar();
        let r3 = random_scalar();
        let g2a = EdwardsPoint::GENERATOR * a2;
        let g3a = EdwardsPoint::GENERATOR * a3;
        let c2 = proof_hash(1, &[EdwardsPoint::GENERATOR * r2]);
        let d2 = r2 - a2 * c2;
        let c3 = proof_hash(2, &[EdwardsPoint::GENERATOR * r3]);
        let d3 = r3 - a3 * c3;
        self.state = SmpState::Expect2 { x: *secret, a2, a3 };
        Ok(SmpMessage::One(Smp1 {
            question: question.as_bytes().to_vec(),
            g2a,
            c2,
            d2,
            g3a,
            c3,
            d3,
        }))
    }

    /// Peer opened a run. Verifies the knowledge proofs and parks the
    /// message until the user supplies the secret.
    pub fn on_smp1(&mut self, msg: Smp1) -> Result<SmpOutcome, OtrError> {
        if self.in_progress() {
            self.state = SmpState::Aborted;
            return Err(OtrError::Smp("SMP1 during an active run".into()));
        }
        verify_proof(1, msg.c2, msg.d2, &msg.g2a)?;
        verify_proof(2, msg.c3, msg.d3, &msg.g3a)?;
        let question = String::from_utf8_lossy(&msg.question).into_owned();
        self.state = SmpState::PromptedSecret { msg1: Box::new(msg) };
        Ok(SmpOutcome {
            reply: None,
            event: Some(SmpEvent::Started { question }),
        })
    }

    /// The user answered; build SMP2.
    pub fn respond(&mut self, secret: &Scalar) -> Result<SmpMessage, OtrError> {
        let msg1 = match std::mem::replace(&mut self.state, SmpState::Expect1) {
            SmpState::PromptedSecret { msg1 } => msg1,
            other => {
                self.state = other;
                return Err(OtrError::InvalidState("no SMP question pending"));
            }
        };
        let y = *secret;
        let b2 = random_scalar();
        let b3 = random_scalar();
        let r2 = random_scalar();
        let r3 = random_scalar();
        let r4 = random_scalar();
        let r5 = random_scalar();
        let r6 = random_scalar();

        let g2b = EdwardsPoint::GENERATOR * b2;
        let g3b = EdwardsPoint::GENERATOR * b3;
        let c2 = proof_hash(3, &[EdwardsPoint::GENERATOR * r2]);
        let d2 = r2 - b2 * c2;
        let c3 = proof_hash(4, &[EdwardsPoint::GENERATOR * r3]);
        let d3 = r3 - b3 * c3;

        let g2 = msg1.g2a * b2;
        let g3 = msg1.g3a * b3;
        let pb = g3 * r4;
        let qb = EdwardsPoint::GENERATOR * r4 + g2 * y;
        let cp = proof_hash(5, &[g3 * r5, EdwardsPoint::GENERATOR * r5 + g2 * r6]);
        let d5 = r5 - r4 * cp;
        let d6 = r6 - y * cp;

        self.state = SmpState::Expect3 { g3a: msg1.g3a, g2, g3, b3, pb, qb };
        Ok(SmpMessage::Two(Smp2 { g2b, c2, d2, g3b, c3, d3, pb, qb, cp, d5, d6 }))
    }

    /// Initiator handles SMP2 and answers with SMP3.
    pub fn on_smp2(&mut self, msg: Smp2) -> Result<SmpOutcome, OtrError> {
        let SmpState::Expect2 { x, a2, a3 } =
            std::mem::replace(&mut self.state, SmpState::Expect1)
        else {
            return Err(OtrError::Smp("unexpected SMP2".into()));
        };
        verify_proof(3, msg.c2, msg.d2, &msg.g2b)?;
        verify_proof(4, msg.c3, msg.d3, &msg.g3b)?;

        let g2 = msg.g2b * a2;
        let g3 = msg.g3b * a3;
        // cp proves Pb/Qb are well-formed under (g2, g3).
        let cp_check = proof_hash(
            5,
            &[
                g3 * msg.d5 + msg.pb * msg.cp,
                EdwardsPoint::GENERATOR * msg.d5 + g2 * msg.d6 + msg.qb * msg.cp,
            ],
        );
        if !scalars_equal(&cp_check, &msg.cp) {
            return Err(OtrError::Smp("SMP2 Pb/Qb proof rejected".into()));
        }

        let r4 = random_scalar();
        let r5 = random_scalar();
        let r6 = random_scalar();
        let r7 = random_scalar();

        let pa = g3 * r4;
        let qa = EdwardsPoint::GENERATOR * r4 + g2 * x;
        let cp = proof_hash(6, &[g3 * r5, EdwardsPoint::GENERATOR * r5 + g2 * r6]);
        let d5 = r5 - r4 * cp;
        let d6 = r6 - x * cp;

        let qa_qb = qa - msg.qb;
        let ra = qa_qb * a3;
        let cr = proof_hash(7, &[EdwardsPoint::GENERATOR * r7, qa_qb * r7]);
        let d7 = r7 - a3 * cr;

        self.state = SmpState::Expect4 {
            g3b: msg.g3b,
            pa_pb: pa - msg.pb,
            qa_qb,
            a3,
        };
        Ok(SmpOutcome {
            reply: Some(SmpMessage::Three(Smp3 { pa, qa, cp, d5, d6, ra, cr, d7 })),
            event: Some(SmpEvent::Progress { percent: 60 }),
        })
    }

    /// Responder handles SMP3, learns the verdict, and closes with SMP4.
    pub fn on_smp3(&mut self, msg: Smp3) -> Result<SmpOutcome, OtrError> {
        let SmpState::Expect3 { g3a, g2, g3, b3, pb, qb } =
            std::mem::replace(&mut self.state, SmpState::Expect1)
        else {
            return Err(OtrError::Smp("unexpected SMP3".into()));
        };
        let cp_check = proof_hash(
            6,
            &[
                g3 * msg.d5 + msg.pa * msg.cp,
                EdwardsPoint::GENERATOR * msg.d5 + g2 * msg.d6 + msg.qa * msg.cp,
            ],
        );
        if !scalars_equal(&cp_check, &msg.cp) {
            return Err(OtrError::Smp("SMP3 Pa/Qa proof rejected".into()));
        }
        let qa_qb = msg.qa - qb;
        let cr_check = proof_hash(
            7,
            &[
                EdwardsPoint::GENERATOR * msg.d7 + g3a * msg.cr,
                qa_qb * msg.d7 + msg.ra * msg.cr,
            ],
        );
        if !scalars_equal(&cr_check, &msg.cr) {
            return Err(OtrError::Smp("SMP3 Ra proof rejected".into()));
        }

        let r7 = random_scalar();
        let rb = qa_qb * b3;
        let cr = proof_hash(8, &[EdwardsPoint::GENERATOR * r7, qa_qb * r7]);
        let d7 = r7 - b3 * cr;

        let equal = msg.ra * b3 == msg.pa - pb;
        self.state = if equal { SmpState::Succeeded } else { SmpState::Failed };
        Ok(SmpOutcome {
            reply: Some(SmpMessage::Four(Smp4 { rb, cr, d7 })),
            event: Some(if equal { SmpEvent::Succeeded } else { SmpEvent::Failed }),
        })
    }

    /// Initiator handles the closing SMP4 and learns the verdict.
    pub fn on_smp4(&mut self, msg: Smp4) -> Result<SmpOutcome, OtrError> {
        let SmpState::Expect4 { g3b, pa_pb, qa_qb, a3 } =
            std::mem::replace(&mut self.state, SmpState::Expect1)
        else {
            return Err(OtrError::Smp("unexpected SMP4".into()));
        };
        let cr_check = proof_hash(
            8,
            &[
                EdwardsPoint::GENERATOR * msg.d7 + g3b * msg.cr,
                qa_qb * msg.d7 + msg.rb * msg.cr,
            ],
        );
        if !scalars_equal(&cr_check, &msg.cr) {
            return Err(OtrError::Smp("SMP4 Rb proof rejected".into()));
        }
        let equal = msg.rb * a3 == pa_pb;
        self.state = if equal { SmpState::Succeeded } else { SmpState::Failed };
        Ok(SmpOutcome {
            reply: None,
            event: Some(if equal { SmpEvent::Succeeded } else { SmpEvent::Failed }),
        })
    }
}

// ── Derivations ──────────────────────────────────────────────────────────────

/// Map the typed secret onto a scalar, bound to both identities and this
/// session. The SMP initiator's fingerprint goes first.
pub fn compute_secret(
    initiator_fingerprint: &[u8; FINGERPRINT_LENGTH],
    responder_fingerprint: &[u8; FINGERPRINT_LENGTH],
    ssid: &[u8; 8],
    answer: &[u8],
) -> Scalar {
    let mut input = Vec::with_capacity(1 + 2 * FINGERPRINT_LENGTH + 8 + answer.len());
    input.push(0x01);
    input.extend_from_slice(initiator_fingerprint);
    input.extend_from_slice(responder_fingerprint);
    input.extend_from_slice(ssid);
    input.extend_from_slice(answer);
    hash_to_scalar(usage::SMP_SECRET, &input)
}

fn proof_hash(round: u8, points: &[EdwardsPoint]) -> Scalar {
    let mut input = Vec::with_capacity(1 + points.len() * 57);
    input.push(round);
    for p in points {
        input.extend_from_slice(&encode_point(p));
    }
    hash_to_scalar(usage::SMP_SCALAR, &input)
}

/// Knowledge-of-discrete-log proof check: `c == H(round, d·G + c·P)`.
fn verify_proof(round: u8, c: Scalar, d: Scalar, public: &EdwardsPoint) -> Result<(), OtrError> {
    let check = proof_hash(round, &[EdwardsPoint::GENERATOR * d + *public * c]);
    if scalars_equal(&check, &c) {
        Ok(())
    } else {
        Err(OtrError::Smp(format!("round {round} knowledge proof rejected")))
    }
}

fn scalars_equal(a: &Scalar, b: &Scalar) -> bool {
    dl_otr_crypto::kdf::constant_time_equals(&encode_scalar(a), &encode_scalar(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(secret_a: &[u8], secret_b: &[u8]) -> (SmpEvent, SmpEvent) {
        let fpr_a = [1u8; FINGERPRINT_LENGTH];
        let fpr_b = [2u8; FINGERPRINT_LENGTH];
        let ssid = [3u8; 8];
        let xa = compute_secret(&fpr_a, &fpr_b, &ssid, secret_a);
        let xb = compute_secret(&fpr_a, &fpr_b, &ssid, secret_b);

        let mut alice = Smp::new();
        let mut bob = Smp::new();

        let SmpMessage::One(m1) = alice.initiate(&xa, "favourite colour?").unwrap() else {
            panic!("expected SMP1");
        };
        let started = bob.on_smp1(m1).unwrap();
        assert_eq!(
            started.event,
            Some(SmpEvent::Started { question: "favourite colour?".into() })
        );
        let SmpMessage::Two(m2) = bob.respond(&xb).unwrap() else {
            panic!("expected SMP2");
        };
        let out3 = alice.on_smp2(m2).unwrap();
        let Some(SmpMessage::Three(m3)) = out3.reply else {
            panic!("expected SMP3");
        };
        let out4 = bob.on_smp3(m3).unwrap();
        let Some(SmpMessage::Four(m4)) = out4.reply else {
            panic!("expected SMP4");
        };
        let fin = alice.on_smp4(m4).unwrap();
        (out4.event.unwrap(), fin.event.unwrap())
    }

    #[test]
    fn matching_secrets_succeed() {
        let (bob_event, alice_event) = run(b"hunter2", b"hunter2");
        assert_eq!(bob_event, SmpEvent::Succeeded);
        assert_eq!(alice_event, SmpEvent::Succeeded);
    }

    #[test]
    fn differing_secrets_fail_without_leaking() {
        let (bob_event, alice_event) = run(b"hunter2", b"hunter3");
        assert_eq!(bob_event, SmpEvent::Failed);
        assert_eq!(alice_event, SmpEvent::Failed);
    }

    #[test]
    fn tampered_round_is_rejected() {
        let x = compute_secret(&[1; FINGERPRINT_LENGTH], &[2; FINGERPRINT_LENGTH], &[3; 8], b"s");
        let mut alice = Smp::new();
        let mut bob = Smp::new();
        let SmpMessage::One(mut m1) = alice.initiate(&x, "").unwrap() else {
            panic!();
        };
        m1.d2 = random_scalar();
        assert!(bob.on_smp1(m1).is_err());
    }

    #[test]
    fn message_roundtrip() {
        let x = compute_secret(&[1; FINGERPRINT_LENGTH], &[2; FINGERPRINT_LENGTH], &[3; 8], b"s");
        let mut alice = Smp::new();
        let msg = alice.initiate(&x, "q?").unwrap();
        let bytes = msg.encode();
        let decoded = SmpMessage::decode_smp1(&bytes).unwrap();
        assert_eq!(decoded.question, b"q?");
    }

    #[test]
    fn respond_requires_pending_question() {
        let x = compute_secret(&[1; FINGERPRINT_LENGTH], &[2; FINGERPRINT_LENGTH], &[3; 8], b"s");
        let mut smp = Smp::new();
        assert!(matches!(smp.respond(&x), Err(OtrError::InvalidState(_))));
    }
}
