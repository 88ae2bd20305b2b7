//! Fragmentation and reassembly.
//!
//! Three inbound formats are recognised, distinguished by their heads:
//!
//!   v2:  `?OTR,k,n,payload,`
//!   v3:  `?OTR|sender|receiver,k,n,payload,`
//!   v4:  `?OTR|identifier|sender|receiver,k,n,payload,`
//!
//! `k` is 1-based; `0 < k <= n <= 65535`; payload at most 250 KiB per
//! fragment. Reassembly keeps one slot per sender, keyed by (sender,
//! identifier); a new identifier from the same sender evicts the old
//! slot. Duplicate indices and mismatched totals abort the slot.

use std::collections::HashMap;

use crate::error::ProtoError;

pub const MAX_FRAGMENT_PAYLOAD: usize = 250 * 1024;
pub const MAX_FRAGMENT_COUNT: u32 = 65535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Zero for v2/v3 fragments, which carry no identifier.
    pub identifier: u32,
    /// Zero for v2 fragments, which carry no tags.
    pub sender_tag: u32,
    pub receiver_tag: u32,
    pub index: u16,
    pub total: u16,
    pub payload: String,
}

// ── Parsing ──────────────────────────────────────────────────────────────────

pub fn parse_fragment(raw: &str) -> Result<Fragment, ProtoError> {
    let bad = |why: &str| ProtoError::Fragment(why.to_string());

    let (identifier, sender_tag, receiver_tag, rest) = if let Some(rest) = raw.strip_prefix("?OTR|")
    {
        let head_end = rest.find(',').ok_or_else(|| bad("missing body"))?;
        let head: Vec<&str> = rest[..head_end].split('|').collect();
        let body = &rest[head_end + 1..];
        match head.len() {
            2 => {
                let sender = parse_hex_tag(head[0])?;
                let receiver = parse_hex_tag(head[1])?;
                (0, sender, receiver, body)
            }
            3 => {
                let identifier = parse_hex_tag(head[0])?;
                let sender = parse_hex_tag(head[1])?;
                let receiver = parse_hex_tag(head[2])?;
                (identifier, sender, receiver, body)
            }
            _ => return Err(bad("malformed fragment head")),
        }
    } else if let Some(rest) = raw.strip_prefix("?OTR,") {
        (0, 0, 0, rest)
    } else {
        return Err(bad("not a fragment"));
    };

    let mut parts = rest.splitn(3, ',');
    let index: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| bad("bad index"))?;
    let total: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| bad("bad total"))?;
    let tail = parts.next().ok_or_else(|| bad("missing payload"))?;
    let payload = tail.strip_suffix(',').ok_or_else(|| bad("unterminated payload"))?;

    if index == 0 || total == 0 || index > total || total > MAX_FRAGMENT_COUNT {
        return Err(bad("index out of range"));
    }
    if payload.len() > MAX_FRAGMENT_PAYLOAD {
        return Err(bad("payload too large"));
    }

    Ok(Fragment {
        identifier,
        sender_tag,
        receiver_tag,
        index: index as u16,
        total: total as u16,
        payload: payload.to_string(),
    })
}

fn parse_hex_tag(s: &str) -> Result<u32, ProtoError> {
    u32::from_str_radix(s, 16).map_err(|_| ProtoError::Fragment("bad hex tag".to_string()))
}

// ── Emission ─────────────────────────────────────────────────────────────────

/// Split an outbound message into v4 fragments of at most `max_size`
/// characters each. A message that already fits is returned unsplit.
pub fn fragment_v4(
    msg: &str,
    max_size: usize,
    identifier: u32,
    sender_tag: u32,
    receiver_tag: u32,
) -> Result<Vec<String>, ProtoError> {
    fragment_with(msg, max_size, |index, total, piece| {
        format!("?OTR|{identifier:08x}|{sender_tag:08x}|{receiver_tag:08x},{index:05},{total:05},{piece},")
    })
}

/// v3 fragment format (no identifier).
pub fn fragment_v3(
    msg: &str,
    max_size: usize,
    sender_tag: u32,
    receiver_tag: u32,
) -> Result<Vec<String>, ProtoError> {
    fragment_with(msg, max_size, |index, total, piece| {
        format!("?OTR|{sender_tag:08x}|{receiver_tag:08x},{index:05},{total:05},{piece},")
    })
}

fn fragment_with(
    msg: &str,
    max_size: usize,
    render: impl Fn(u32, u32, &str) -> String,
) -> Result<Vec<String>, ProtoError> {
    if max_size == 0 || msg.len() <= max_size {
        return Ok(vec![msg.to_string()]);
    }
    // Header overhead measured off a worst-case rendering.
    let overhead = render(MAX_FRAGMENT_COUNT, MAX_FRAGMENT_COUNT, "").len();
    let chunk = max_size.saturating_sub(overhead).max(1);
    let total = msg.len().div_ceil(chunk);
    if total as u32 > MAX_FRAGMENT_COUNT {
        return Err(ProtoError::Fragment("message needs too many fragments".to_string()));
    }
    let bytes = msg.as_bytes();
    let mut out = Vec::with_capacity(total);
    for (i, piece) in bytes.chunks(chunk).enumerate() {
        // Armored messages are ASCII; chunking cannot split a code point.
        let piece = std::str::from_utf8(piece)
            .map_err(|_| ProtoError::Fragment("payload is not ASCII".to_string()))?;
        out.push(render(i as u32 + 1, total as u32, piece));
    }
    Ok(out)
}

// ── Reassembly ───────────────────────────────────────────────────────────────

struct Slot {
    identifier: u32,
    total: u16,
    parts: Vec<Option<String>>,
    received: usize,
    last_activity: u64,
}

/// One reassembly slot per sender tag. Completion hands the joined payload
/// back; violations evict the slot and surface a protocol error.
pub struct Reassembler {
    slots: HashMap<u32, Slot>,
    timeout_secs: u64,
}

impl Reassembler {
    pub fn new(timeout_secs: u64) -> Self {
        Self { slots: HashMap::new(), timeout_secs }
    }

    pub fn receive(&mut self, frag: Fragment, now: u64) -> Result<Option<String>, ProtoError> {
        if frag.total == 1 {
            self.slots.remove(&frag.sender_tag);
            return Ok(Some(frag.payload));
        }

        let slot = self.slots.entry(frag.sender_tag).or_insert_with(|| Slot {
            identifier: frag.identifier,
            total: frag.total,
            parts: vec![None; frag.total as usize],
            received: 0,
            last_activity: now,
        });

        // A fresh identifier from the same sender replaces the old slot.
        if slot.identifier != frag.identifier {
            *slot = Slot {
                identifier: frag.identifier,
                total: frag.total,
                parts: vec![None; frag.total as usize],
                received: 0,
                last_activity: now,
            };
        }

        if slot.total != frag.total {
            self.slots.remove(&frag.sender_tag);
            return Err(ProtoError::Fragment("total changed mid-series".to_string()));
        }
        let idx = frag.index as usize - 1;
        if slot.parts[idx].is_some() {
            self.slots.remove(&frag.sender_tag);
            return Err(ProtoError::Fragment("duplicate fragment index".to_string()));
        }

        slot.parts[idx] = Some(frag.payload);
        slot.received += 1;
        slot.last_activity = now;

        if slot.received == slot.total as usize {
            let slot = self.slots.remove(&frag.sender_tag).expect("slot exists");
            let mut joined = String::new();
            for part in slot.parts.into_iter() {
                joined.push_str(&part.expect("all parts received"));
            }
            return Ok(Some(joined));
        }
        Ok(None)
    }

    /// Drop slots that have been idle past the timeout.
    pub fn expire(&mut self, now: u64) {
        let timeout = self.timeout_secs;
        self.slots
            .retain(|_, slot| now.saturating_sub(slot.last_activity) < timeout);
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(identifier: u32, index: u16, total: u16, payload: &str) -> Fragment {
        Fragment {
            identifier,
            sender_tag: 0x100,
            receiver_tag: 0x200,
            index,
            total,
            payload: payload.to_string(),
        }
    }

    #[test]
    fn v4_parse_roundtrip() {
        let pieces = fragment_v4("A".repeat(600).as_str(), 200, 7, 0x100, 0x200).unwrap();
        assert!(pieces.len() > 1);
        for (i, p) in pieces.iter().enumerate() {
            let f = parse_fragment(p).unwrap();
            assert_eq!(f.identifier, 7);
            assert_eq!(f.sender_tag, 0x100);
            assert_eq!(f.index as usize, i + 1);
            assert_eq!(f.total as usize, pieces.len());
            assert!(p.len() <= 200);
        }
    }

    #[test]
    fn v3_and_v2_formats_parse() {
        let f = parse_fragment("?OTR|00000100|00000200,00001,00002,abc,").unwrap();
        assert_eq!((f.identifier, f.sender_tag, f.index, f.total), (0, 0x100, 1, 2));
        let f = parse_fragment("?OTR,1,2,abc,").unwrap();
        assert_eq!((f.sender_tag, f.index, f.total), (0, 1, 2));
    }

    #[test]
    fn index_bounds() {
        assert!(parse_fragment("?OTR,0,2,abc,").is_err());
        assert!(parse_fragment("?OTR,3,2,abc,").is_err());
        assert!(parse_fragment("?OTR,1,65535,abc,").is_ok());
        assert!(parse_fragment("?OTR,1,65536,abc,").is_err());
    }

    #[test]
    fn out_of_order_reassembly() {
        let mut r = Reassembler::new(60);
        assert_eq!(r.receive(frag(1, 2, 3, "BB"), 0).unwrap(), None);
        assert_eq!(r.receive(frag(1, 3, 3, "CC"), 1).unwrap(), None);
        assert_eq!(r.receive(frag(1, 1, 3, "AA"), 2).unwrap(), Some("AABBCC".to_string()));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn duplicate_index_aborts() {
        let mut r = Reassembler::new(60);
        r.receive(frag(1, 1, 3, "AA"), 0).unwrap();
        assert!(r.receive(frag(1, 1, 3, "AA"), 1).is_err());
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn total_mismatch_aborts() {
        let mut r = Reassembler::new(60);
        r.receive(frag(1, 1, 3, "AA"), 0).unwrap();
        assert!(r.receive(frag(1, 2, 4, "BB"), 1).is_err());
    }

    #[test]
    fn new_identifier_replaces_slot() {
        let mut r = Reassembler::new(60);
        r.receive(frag(1, 1, 2, "AA"), 0).unwrap();
        assert_eq!(r.receive(frag(2, 1, 2, "XX"), 1).unwrap(), None);
        assert_eq!(r.receive(frag(2, 2, 2, "YY"), 2).unwrap(), Some("XXYY".to_string()));
    }

    #[test]
    fn timeout_evicts() {
        let mut r = Reassembler::new(10);
        r.receive(frag(1, 1, 2, "AA"), 100).unwrap();
        r.expire(105);
        assert_eq!(r.pending(), 1);
        r.expire(111);
        assert_eq!(r.pending(), 0);
    }
}
