//! Typed message records and their binary encodings.
//!
//! Every encoded message opens with the same header: protocol version
//! (SHORT), message type (BYTE), sender instance tag (INT), receiver
//! instance tag (INT). The remainder is positional per type.

use dl_otr_crypto::ed448::POINT_LENGTH;
use dl_otr_crypto::rsig::RSIG_LENGTH;

use crate::encode::{Reader, Writer};
use crate::error::ProtoError;

pub const VERSION_3: u16 = 3;
pub const VERSION_4: u16 = 4;

/// Authenticator length on v4 data messages.
pub const MAC_LENGTH: usize = 64;
/// Authenticator length on v3 messages.
pub const MAC_V3_LENGTH: usize = 20;

/// Instance tags below this are reserved; 0 means "unspecified".
pub const MIN_INSTANCE_TAG: u32 = 0x100;

pub mod msg_type {
    pub const DH_COMMIT: u8 = 0x02;
    pub const DATA: u8 = 0x03;
    pub const DH_KEY: u8 = 0x0A;
    pub const REVEAL_SIGNATURE: u8 = 0x11;
    pub const SIGNATURE: u8 = 0x12;
    pub const IDENTITY: u8 = 0x35;
    pub const AUTH_R: u8 = 0x36;
    pub const AUTH_I: u8 = 0x37;
}

/// Data-message flag: receiver must not surface an error if unreadable.
pub const FLAG_IGNORE_UNREADABLE: u8 = 0x01;

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub message_type: u8,
    pub sender_tag: u32,
    pub receiver_tag: u32,
}

impl Header {
    pub fn new(version: u16, message_type: u8, sender_tag: u32, receiver_tag: u32) -> Self {
        Self { version, message_type, sender_tag, receiver_tag }
    }

    fn write(&self, w: &mut Writer) {
        w.write_u16(self.version);
        w.write_u8(self.message_type);
        w.write_u32(self.sender_tag);
        w.write_u32(self.receiver_tag);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        let version = r.read_u16()?;
        if version != VERSION_3 && version != VERSION_4 {
            return Err(ProtoError::UnknownVersion(version));
        }
        let message_type = r.read_u8()?;
        let sender_tag = r.read_u32()?;
        let receiver_tag = r.read_u32()?;
        // The sender must identify itself; the receiver tag may still be
        // unspecified during key exchange.
        validate_tag(sender_tag, false)?;
        validate_tag(receiver_tag, true)?;
        Ok(Self { version, message_type, sender_tag, receiver_tag })
    }
}

/// Reject tags in the reserved band. Zero is allowed only where the
/// context allows "unspecified".
pub fn validate_tag(tag: u32, zero_ok: bool) -> Result<(), ProtoError> {
    if tag == 0 {
        return if zero_ok { Ok(()) } else { Err(ProtoError::ReservedInstanceTag(0)) };
    }
    if tag < MIN_INSTANCE_TAG {
        return Err(ProtoError::ReservedInstanceTag(tag));
    }
    Ok(())
}

// ── Version 4 records ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMessage {
    pub header: Header,
    /// Signed client-profile payload, opaque at this layer.
    pub profile: Vec<u8>,
    pub ecdh: [u8; POINT_LENGTH],
    pub dh: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRMessage {
    pub header: Header,
    pub profile: Vec<u8>,
    pub ecdh: [u8; POINT_LENGTH],
    pub dh: Vec<u8>,
    pub sigma: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthIMessage {
    pub header: Header,
    pub sigma: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessageV4 {
    pub header: Header,
    pub flags: u8,
    /// Length of the sender's previous sending chain.
    pub pn: u32,
    pub ratchet_id: u32,
    pub message_id: u32,
    pub ecdh: [u8; POINT_LENGTH],
    /// Present exactly when `ratchet_id % 3 == 0`.
    pub dh: Option<Vec<u8>>,
    pub ciphertext: Vec<u8>,
    pub authenticator: [u8; MAC_LENGTH],
    pub revealed_macs: Vec<u8>,
}

// ── Version 3 records ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhCommitMessage {
    pub header: Header,
    pub encrypted_gx: Vec<u8>,
    pub hashed_gx: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhKeyMessage {
    pub header: Header,
    pub gy: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealSignatureMessage {
    pub header: Header,
    pub revealed_key: Vec<u8>,
    pub encrypted_sig: Vec<u8>,
    pub mac: [u8; MAC_V3_LENGTH],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMessage {
    pub header: Header,
    pub encrypted_sig: Vec<u8>,
    pub mac: [u8; MAC_V3_LENGTH],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessageV3 {
    pub header: Header,
    pub flags: u8,
    pub sender_keyid: u32,
    pub recipient_keyid: u32,
    pub dh_y: Vec<u8>,
    pub ctr: [u8; 8],
    pub encrypted: Vec<u8>,
    pub mac: [u8; MAC_V3_LENGTH],
    pub old_mac_keys: Vec<u8>,
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Identity(IdentityMessage),
    AuthR(AuthRMessage),
    AuthI(AuthIMessage),
    DataV4(DataMessageV4),
    DhCommit(DhCommitMessage),
    DhKey(DhKeyMessage),
    RevealSignature(RevealSignatureMessage),
    Signature(SignatureMessage),
    DataV3(DataMessageV3),
}

impl Message {
    pub fn header(&self) -> &Header {
        match self {
            Message::Identity(m) => &m.header,
            Message::AuthR(m) => &m.header,
            Message::AuthI(m) => &m.header,
            Message::DataV4(m) => &m.header,
            Message::DhCommit(m) => &m.header,
            Message::DhKey(m) => &m.header,
            Message::RevealSignature(m) => &m.header,
            Message::Signature(m) => &m.header,
            Message::DataV3(m) => &m.header,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Message::Identity(m) => {
                m.header.write(&mut w);
                w.write_data(&m.profile);
                w.write_point(&m.ecdh);
                w.write_mpi(&m.dh);
            }
            Message::AuthR(m) => {
                m.header.write(&mut w);
                w.write_data(&m.profile);
                w.write_point(&m.ecdh);
                w.write_mpi(&m.dh);
                w.write_raw(&m.sigma);
            }
            Message::AuthI(m) => {
                m.header.write(&mut w);
                w.write_raw(&m.sigma);
            }
            Message::DataV4(m) => {
                m.header.write(&mut w);
                w.write_u8(m.flags);
                w.write_u32(m.pn);
                w.write_u32(m.ratchet_id);
                w.write_u32(m.message_id);
                w.write_point(&m.ecdh);
                if let Some(dh) = &m.dh {
                    w.write_mpi(dh);
                }
                w.write_data(&m.ciphertext);
                w.write_raw(&m.authenticator);
                w.write_data(&m.revealed_macs);
            }
            Message::DhCommit(m) => {
                m.header.write(&mut w);
                w.write_data(&m.encrypted_gx);
                w.write_data(&m.hashed_gx);
            }
            Message::DhKey(m) => {
                m.header.write(&mut w);
                w.write_mpi(&m.gy);
            }
            Message::RevealSignature(m) => {
                m.header.write(&mut w);
                w.write_data(&m.revealed_key);
                w.write_data(&m.encrypted_sig);
                w.write_raw(&m.mac);
            }
            Message::Signature(m) => {
                m.header.write(&mut w);
                w.write_data(&m.encrypted_sig);
                w.write_raw(&m.mac);
            }
            Message::DataV3(m) => {
                m.header.write(&mut w);
                w.write_u8(m.flags);
                w.write_u32(m.sender_keyid);
                w.write_u32(m.recipient_keyid);
                w.write_mpi(&m.dh_y);
                w.write_raw(&m.ctr);
                w.write_data(&m.encrypted);
                w.write_raw(&m.mac);
                w.write_data(&m.old_mac_keys);
            }
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        let mut r = Reader::new(bytes);
        let header = Header::read(&mut r)?;
        let msg = match (header.version, header.message_type) {
            (VERSION_4, msg_type::IDENTITY) => Message::Identity(IdentityMessage {
                header,
                profile: r.read_data()?,
                ecdh: r.read_point()?,
                dh: r.read_mpi()?,
            }),
            (VERSION_4, msg_type::AUTH_R) => Message::AuthR(AuthRMessage {
                header,
                profile: r.read_data()?,
                ecdh: r.read_point()?,
                dh: r.read_mpi()?,
                sigma: r.read_raw(RSIG_LENGTH)?.to_vec(),
            }),
            (VERSION_4, msg_type::AUTH_I) => Message::AuthI(AuthIMessage {
                header,
                sigma: r.read_raw(RSIG_LENGTH)?.to_vec(),
            }),
            (VERSION_4, msg_type::DATA) => {
                let flags = r.read_u8()?;
                let pn = r.read_u32()?;
                let ratchet_id = r.read_u32()?;
                let message_id = r.read_u32()?;
                let ecdh = r.read_point()?;
                let dh = if ratchet_id % 3 == 0 { Some(r.read_mpi()?) } else { None };
                let ciphertext = r.read_data()?;
                let mut authenticator = [0u8; MAC_LENGTH];
                authenticator.copy_from_slice(r.read_raw(MAC_LENGTH)?);
                let revealed_macs = r.read_data()?;
                Message::DataV4(DataMessageV4 {
                    header,
                    flags,
                    pn,
                    ratchet_id,
                    message_id,
                    ecdh,
                    dh,
                    ciphertext,
                    authenticator,
                    revealed_macs,
                })
            }
            (VERSION_3, msg_type::DH_COMMIT) => Message::DhCommit(DhCommitMessage {
                header,
                encrypted_gx: r.read_data()?,
                hashed_gx: r.read_data()?,
            }),
            (VERSION_3, msg_type::DH_KEY) => Message::DhKey(DhKeyMessage {
                header,
                gy: r.read_mpi()?,
            }),
            (VERSION_3, msg_type::REVEAL_SIGNATURE) => {
                let revealed_key = r.read_data()?;
                let encrypted_sig = r.read_data()?;
                let mut mac = [0u8; MAC_V3_LENGTH];
                mac.copy_from_slice(r.read_raw(MAC_V3_LENGTH)?);
                Message::RevealSignature(RevealSignatureMessage {
                    header,
                    revealed_key,
                    encrypted_sig,
                    mac,
                })
            }
            (VERSION_3, msg_type::SIGNATURE) => {
                let encrypted_sig = r.read_data()?;
                let mut mac = [0u8; MAC_V3_LENGTH];
                mac.copy_from_slice(r.read_raw(MAC_V3_LENGTH)?);
                Message::Signature(SignatureMessage { header, encrypted_sig, mac })
            }
            (VERSION_3, msg_type::DATA) => {
                let flags = r.read_u8()?;
                let sender_keyid = r.read_u32()?;
                let recipient_keyid = r.read_u32()?;
                let dh_y = r.read_mpi()?;
                let mut ctr = [0u8; 8];
                ctr.copy_from_slice(r.read_raw(8)?);
                let encrypted = r.read_data()?;
                let mut mac = [0u8; MAC_V3_LENGTH];
                mac.copy_from_slice(r.read_raw(MAC_V3_LENGTH)?);
                let old_mac_keys = r.read_data()?;
                Message::DataV3(DataMessageV3 {
                    header,
                    flags,
                    sender_keyid,
                    recipient_keyid,
                    dh_y,
                    ctr,
                    encrypted,
                    mac,
                    old_mac_keys,
                })
            }
            (version, other) => {
                let known = matches!(
                    other,
                    msg_type::DH_COMMIT
                        | msg_type::DATA
                        | msg_type::DH_KEY
                        | msg_type::REVEAL_SIGNATURE
                        | msg_type::SIGNATURE
                        | msg_type::IDENTITY
                        | msg_type::AUTH_R
                        | msg_type::AUTH_I
                );
                return Err(if known {
                    ProtoError::TypeVersionMismatch(other, version)
                } else {
                    ProtoError::UnknownMessageType(other)
                });
            }
        };
        r.expect_end()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(version: u16, message_type: u8) -> Header {
        Header::new(version, message_type, 0x100, 0x200)
    }

    #[test]
    fn identity_roundtrip() {
        let msg = Message::Identity(IdentityMessage {
            header: header(VERSION_4, msg_type::IDENTITY),
            profile: vec![1, 2, 3],
            ecdh: [7u8; POINT_LENGTH],
            dh: vec![9u8; 384],
        });
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn auth_r_roundtrip() {
        let msg = Message::AuthR(AuthRMessage {
            header: header(VERSION_4, msg_type::AUTH_R),
            profile: vec![4; 10],
            ecdh: [1u8; POINT_LENGTH],
            dh: vec![2u8; 384],
            sigma: vec![3u8; RSIG_LENGTH],
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn data_v4_roundtrip_with_and_without_dh() {
        for (ratchet_id, dh) in [(0u32, Some(vec![5u8; 10])), (1, None), (3, Some(vec![6u8; 4]))] {
            let msg = Message::DataV4(DataMessageV4 {
                header: header(VERSION_4, msg_type::DATA),
                flags: FLAG_IGNORE_UNREADABLE,
                pn: 2,
                ratchet_id,
                message_id: 7,
                ecdh: [8u8; POINT_LENGTH],
                dh,
                ciphertext: b"ciphertext".to_vec(),
                authenticator: [9u8; MAC_LENGTH],
                revealed_macs: vec![0xAA; 64],
            });
            assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn data_v3_roundtrip() {
        let msg = Message::DataV3(DataMessageV3 {
            header: header(VERSION_3, msg_type::DATA),
            flags: 0,
            sender_keyid: 1,
            recipient_keyid: 2,
            dh_y: vec![3u8; 192],
            ctr: [1, 0, 0, 0, 0, 0, 0, 0],
            encrypted: b"secret".to_vec(),
            mac: [4u8; MAC_V3_LENGTH],
            old_mac_keys: vec![],
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn remaining_kinds_roundtrip() {
        let msgs = [
            Message::AuthI(AuthIMessage {
                header: header(VERSION_4, msg_type::AUTH_I),
                sigma: vec![0xAB; RSIG_LENGTH],
            }),
            Message::DhCommit(DhCommitMessage {
                header: header(VERSION_3, msg_type::DH_COMMIT),
                encrypted_gx: vec![1; 196],
                hashed_gx: vec![2; 32],
            }),
            Message::DhKey(DhKeyMessage {
                header: header(VERSION_3, msg_type::DH_KEY),
                gy: vec![3; 192],
            }),
            Message::RevealSignature(RevealSignatureMessage {
                header: header(VERSION_3, msg_type::REVEAL_SIGNATURE),
                revealed_key: vec![4; 16],
                encrypted_sig: vec![5; 100],
                mac: [6u8; MAC_V3_LENGTH],
            }),
            Message::Signature(SignatureMessage {
                header: header(VERSION_3, msg_type::SIGNATURE),
                encrypted_sig: vec![7; 100],
                mac: [8u8; MAC_V3_LENGTH],
            }),
        ];
        for msg in msgs {
            assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn rejects_unknown_version() {
        let msg = Message::DhKey(DhKeyMessage {
            header: header(VERSION_3, msg_type::DH_KEY),
            gy: vec![1],
        });
        let mut bytes = msg.encode();
        bytes[1] = 5;
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtoError::UnknownVersion(5))
        ));
    }

    #[test]
    fn rejects_v4_type_under_v3() {
        let msg = Message::AuthI(AuthIMessage {
            header: header(VERSION_4, msg_type::AUTH_I),
            sigma: vec![0u8; RSIG_LENGTH],
        });
        let mut bytes = msg.encode();
        bytes[1] = 3;
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtoError::TypeVersionMismatch(msg_type::AUTH_I, VERSION_3))
        ));
    }

    #[test]
    fn rejects_reserved_sender_tag() {
        let msg = Message::DhKey(DhKeyMessage {
            header: Header::new(VERSION_3, msg_type::DH_KEY, 0x42, 0),
            gy: vec![1],
        });
        assert!(matches!(
            Message::decode(&msg.encode()),
            Err(ProtoError::ReservedInstanceTag(0x42))
        ));
    }

    #[test]
    fn rejects_truncated_message() {
        let msg = Message::AuthI(AuthIMessage {
            header: header(VERSION_4, msg_type::AUTH_I),
            sigma: vec![0u8; RSIG_LENGTH],
        });
        let bytes = msg.encode();
        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 1]),
            Err(ProtoError::ShortRead)
        ));
    }

    #[test]
    fn rejects_trailing_garbage() {
        let msg = Message::DhKey(DhKeyMessage {
            header: header(VERSION_3, msg_type::DH_KEY),
            gy: vec![1],
        });
        let mut bytes = msg.encode();
        bytes.push(0);
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtoError::TrailingBytes)
        ));
    }
}
