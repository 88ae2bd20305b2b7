//! Base64 armor and top-level classification.
//!
//! What the transport sees is always a plain string. Five shapes are
//! recognised: armored binary (`?OTR:` … `.`), fragments (`?OTR|` /
//! `?OTR,`), queries (`?OTRv…?`), error messages (`?OTR Error:`), and
//! everything else, which is plaintext and may carry an invisible
//! whitespace tag advertising OTR support.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::ProtoError;
use crate::message::{VERSION_3, VERSION_4};

pub const ENCODED_PREFIX: &str = "?OTR:";
pub const ERROR_PREFIX: &str = "?OTR Error: ";
const QUERY_PREFIX: &str = "?OTRv";

/// 16-character tag marking a plaintext message as OTR-capable.
pub const TAG_BASE: &str = " \t  \t\t\t\t \t \t \t  ";
/// Per-version 8-character suffixes appended after the base tag.
pub const TAG_V3: &str = "  \t\t  \t\t";
pub const TAG_V4: &str = "  \t\t \t  ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Decoded armored message bytes, ready for `Message::decode`.
    Encoded(Vec<u8>),
    /// A fragment; feed the raw string to the reassembler.
    FragmentText(String),
    /// `?OTRv…?` with the advertised versions.
    Query { versions: Vec<u16> },
    /// Peer-reported error text.
    Error(String),
    /// Ordinary text, whitespace tag stripped if one was present.
    Plaintext { text: String, tag_versions: Vec<u16> },
}

pub fn classify(raw: &str) -> Result<Classified, ProtoError> {
    if let Some(body) = raw.strip_prefix(ENCODED_PREFIX) {
        let body = body.strip_suffix('.').ok_or(ProtoError::NotEncoded)?;
        return Ok(Classified::Encoded(STANDARD.decode(body)?));
    }
    if raw.starts_with("?OTR|") || raw.starts_with("?OTR,") {
        return Ok(Classified::FragmentText(raw.to_string()));
    }
    if let Some(text) = raw.strip_prefix(ERROR_PREFIX) {
        return Ok(Classified::Error(text.to_string()));
    }
    if let Some(versions) = parse_query(raw) {
        return Ok(Classified::Query { versions });
    }
    let (text, tag_versions) = strip_whitespace_tag(raw);
    Ok(Classified::Plaintext { text, tag_versions })
}

// ── Emitters ─────────────────────────────────────────────────────────────────

pub fn armor(bytes: &[u8]) -> String {
    format!("{}{}.", ENCODED_PREFIX, STANDARD.encode(bytes))
}

pub fn query_message(versions: &[u16]) -> String {
    let digits: String = versions.iter().map(|v| v.to_string()).collect();
    format!("{QUERY_PREFIX}{digits}?")
}

pub fn error_message(text: &str) -> String {
    format!("{ERROR_PREFIX}{text}")
}

/// Whitespace tag advertising `versions`, appended to outgoing plaintext.
pub fn whitespace_tag(versions: &[u16]) -> String {
    let mut tag = TAG_BASE.to_string();
    for v in versions {
        match *v {
            VERSION_3 => tag.push_str(TAG_V3),
            VERSION_4 => tag.push_str(TAG_V4),
            _ => {}
        }
    }
    tag
}

// ── Parsing ──────────────────────────────────────────────────────────────────

fn parse_query(raw: &str) -> Option<Vec<u16>> {
    let rest = raw.strip_prefix(QUERY_PREFIX)?;
    let end = rest.find('?')?;
    let digits = &rest[..end];
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let versions = digits
        .chars()
        .filter_map(|c| match c {
            '3' => Some(VERSION_3),
            '4' => Some(VERSION_4),
            _ => None,
        })
        .collect();
    Some(versions)
}

/// Find and remove a whitespace tag; report the versions it advertised.
fn strip_whitespace_tag(raw: &str) -> (String, Vec<u16>) {
    let Some(start) = raw.find(TAG_BASE) else {
        return (raw.to_string(), Vec::new());
    };
    let mut versions = Vec::new();
    let mut end = start + TAG_BASE.len();
    loop {
        let rest = &raw[end..];
        if rest.starts_with(TAG_V3) {
            versions.push(VERSION_3);
            end += TAG_V3.len();
        } else if rest.starts_with(TAG_V4) {
            versions.push(VERSION_4);
            end += TAG_V4.len();
        } else {
            break;
        }
    }
    let mut text = String::with_capacity(raw.len());
    text.push_str(&raw[..start]);
    text.push_str(&raw[end..]);
    (text, versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armor_roundtrip() {
        let bytes = vec![0u8, 1, 2, 250, 251, 252];
        let s = armor(&bytes);
        assert!(s.starts_with("?OTR:") && s.ends_with('.'));
        match classify(&s).unwrap() {
            Classified::Encoded(decoded) => assert_eq!(decoded, bytes),
            other => panic!("expected Encoded, got {other:?}"),
        }
    }

    #[test]
    fn query_parse_and_emit() {
        assert_eq!(query_message(&[VERSION_3, VERSION_4]), "?OTRv34?");
        match classify("?OTRv34?").unwrap() {
            Classified::Query { versions } => assert_eq!(versions, vec![VERSION_3, VERSION_4]),
            other => panic!("expected Query, got {other:?}"),
        }
        // Unknown digits are ignored rather than fatal.
        match classify("?OTRv24?").unwrap() {
            Classified::Query { versions } => assert_eq!(versions, vec![VERSION_4]),
            other => panic!("expected Query, got {other:?}"),
        }
    }

    #[test]
    fn error_classification() {
        match classify("?OTR Error: something broke").unwrap() {
            Classified::Error(text) => assert_eq!(text, "something broke"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn whitespace_tag_roundtrip() {
        let tagged = format!("hi there{}", whitespace_tag(&[VERSION_3, VERSION_4]));
        match classify(&tagged).unwrap() {
            Classified::Plaintext { text, tag_versions } => {
                assert_eq!(text, "hi there");
                assert_eq!(tag_versions, vec![VERSION_3, VERSION_4]);
            }
            other => panic!("expected Plaintext, got {other:?}"),
        }
    }

    #[test]
    fn untagged_plaintext_passes_through() {
        match classify("just words").unwrap() {
            Classified::Plaintext { text, tag_versions } => {
                assert_eq!(text, "just words");
                assert!(tag_versions.is_empty());
            }
            other => panic!("expected Plaintext, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_armor_is_rejected() {
        assert!(classify("?OTR:AAAA").is_err());
    }
}
