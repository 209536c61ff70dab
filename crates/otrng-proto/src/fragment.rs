//! Message fragmentation and reassembly.
//!
//! Grounded in `examples/original_source/src/fragment.c`: the frame
//! format `?OTR|<identifier:8hex>|<sender_tag:8hex>|<receiver_tag:8hex>,
//! <index:5dec>,<total:5dec>,<payload>,` and the
//! UNFRAGMENTED/INCOMPLETE/COMPLETE context states. The C source's
//! `list_element_s` fragment list (`list.c`) becomes a plain `HashMap`
//! keyed sparse map here rather than a linked list.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::error::ProtoError;

pub const FRAGMENT_PREFIX: &str = "?OTR|";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStatus {
    Unfragmented,
    Incomplete,
    Complete,
}

/// Split `message` into `?OTR|...` frames no larger than `max_size` bytes
/// each. All returned frames share one randomly chosen `identifier`.
pub fn fragment_message(
    message: &str,
    max_size: usize,
    our_instance: u32,
    their_instance: u32,
) -> Result<Vec<String>, ProtoError> {
    let identifier = rand::rngs::OsRng.next_u32();
    let header_len = format!(
        "?OTR|{:08x}|{:08x}|{:08x},{:05},{:05},,",
        identifier, our_instance, their_instance, 1, 1
    )
    .len();
    if max_size <= header_len {
        return Err(ProtoError::InvalidFragment(
            "max_size too small to fit the fragment header".into(),
        ));
    }

    let limit = max_size - header_len;
    let bytes = message.as_bytes();
    let total = if bytes.is_empty() {
        1
    } else {
        (bytes.len() - 1) / limit + 1
    };
    if total == 0 || total > 65535 {
        return Err(ProtoError::InvalidFragment(format!(
            "fragment count {total} out of range"
        )));
    }

    let mut pieces = Vec::with_capacity(total);
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[]]
    } else {
        bytes.chunks(limit).collect()
    };
    for (i, chunk) in chunks.iter().enumerate() {
        let piece = String::from_utf8_lossy(chunk);
        pieces.push(format!(
            "?OTR|{:08x}|{:08x}|{:08x},{:05},{:05},{},",
            identifier,
            our_instance,
            their_instance,
            i + 1,
            total,
            piece
        ));
    }
    Ok(pieces)
}

pub fn is_fragment(message: &str) -> bool {
    message.starts_with(FRAGMENT_PREFIX)
}

struct ParsedFragment<'a> {
    identifier: u32,
    sender_tag: u32,
    receiver_tag: u32,
    index: u16,
    total: u16,
    payload: &'a str,
}

fn too_short() -> ProtoError {
    ProtoError::InvalidFragment("fragment header truncated".into())
}

fn bad_int(field: &str) -> ProtoError {
    ProtoError::InvalidFragment(format!("bad integer in field {field}"))
}

fn parse_fragment(message: &str) -> Result<ParsedFragment<'_>, ProtoError> {
    let rest = message.strip_prefix(FRAGMENT_PREFIX).ok_or_else(too_short)?;

    let mut hex_parts = rest.splitn(3, '|');
    let identifier_hex = hex_parts.next().ok_or_else(too_short)?;
    let sender_hex = hex_parts.next().ok_or_else(too_short)?;
    let tail = hex_parts.next().ok_or_else(too_short)?;

    let mut fields = tail.splitn(4, ',');
    let receiver_hex = fields.next().ok_or_else(too_short)?;
    let index_dec = fields.next().ok_or_else(too_short)?;
    let total_dec = fields.next().ok_or_else(too_short)?;
    let payload_and_trailer = fields.next().ok_or_else(too_short)?;
    let payload = payload_and_trailer
        .strip_suffix(',')
        .ok_or_else(|| ProtoError::InvalidFragment("fragment missing trailing comma".into()))?;

    Ok(ParsedFragment {
        identifier: u32::from_str_radix(identifier_hex, 16).map_err(|_| bad_int("identifier"))?,
        sender_tag: u32::from_str_radix(sender_hex, 16).map_err(|_| bad_int("sender_tag"))?,
        receiver_tag: u32::from_str_radix(receiver_hex, 16).map_err(|_| bad_int("receiver_tag"))?,
        index: index_dec.parse().map_err(|_| bad_int("index"))?,
        total: total_dec.parse().map_err(|_| bad_int("total"))?,
        payload,
    })
}

struct FragmentContext {
    total: u16,
    count: u16,
    total_bytes: usize,
    pieces: HashMap<u16, String>,
    status: FragmentStatus,
    first_received_at: Instant,
}

impl FragmentContext {
    fn new(total: u16) -> Self {
        Self {
            total,
            count: 0,
            total_bytes: 0,
            pieces: HashMap::new(),
            status: FragmentStatus::Incomplete,
            first_received_at: Instant::now(),
        }
    }
}

/// Per-Conversation fragment reassembly state, keyed by
/// `(sender_tag, identifier)` so an identifier collision between two
/// different peers can never contaminate the other peer's reassembly.
#[derive(Default)]
pub struct FragmentReassembler {
    contexts: HashMap<(u32, u32), FragmentContext>,
}

impl FragmentReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one incoming message. Returns `Some(text)` once a complete
    /// message is available — either immediately, for non-fragment input,
    /// or once the last piece of a fragmented message arrives. Returns
    /// `Ok(None)` for an intermediate fragment or one silently dropped
    /// because it targets a different instance tag.
    pub fn unfragment(
        &mut self,
        message: &str,
        our_instance_tag: u32,
    ) -> Result<Option<String>, ProtoError> {
        if !is_fragment(message) {
            return Ok(Some(message.to_string()));
        }

        let parsed = parse_fragment(message)?;
        if parsed.index == 0 || parsed.total == 0 || parsed.index > parsed.total {
            return Err(ProtoError::InvalidFragment(
                "fragment index/total out of range".into(),
            ));
        }
        if parsed.receiver_tag != 0 && parsed.receiver_tag != our_instance_tag {
            return Ok(None);
        }

        let key = (parsed.sender_tag, parsed.identifier);
        let context = self
            .contexts
            .entry(key)
            .or_insert_with(|| FragmentContext::new(parsed.total));

        if context
            .pieces
            .insert(parsed.index, parsed.payload.to_string())
            .is_none()
        {
            context.count += 1;
            context.total_bytes += parsed.payload.len();
        }

        if context.count == context.total {
            let mut joined = String::with_capacity(context.total_bytes);
            for i in 1..=context.total {
                if let Some(piece) = context.pieces.get(&i) {
                    joined.push_str(piece);
                }
            }
            context.status = FragmentStatus::Complete;
            self.contexts.remove(&key);
            return Ok(Some(joined));
        }

        Ok(None)
    }

    /// Discard any in-progress context older than `max_age`.
    pub fn expire(&mut self, max_age: Duration) {
        let now = Instant::now();
        self.contexts
            .retain(|_, ctx| now.duration_since(ctx.first_received_at) <= max_age);
    }

    pub fn in_progress_count(&self) -> usize {
        self.contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_fragmentation() {
        let msg = "We should fragment when is needed";
        let pieces = fragment_message(msg, 30, 0x1111_1111, 0x2222_2222).unwrap();
        assert!(pieces.len() > 1);

        let mut reassembler = FragmentReassembler::new();
        let mut result = None;
        for piece in &pieces {
            result = reassembler.unfragment(piece, 0x2222_2222).unwrap();
        }
        assert_eq!(result.as_deref(), Some(msg));
        assert_eq!(reassembler.in_progress_count(), 0);
    }

    #[test]
    fn non_fragment_passes_through() {
        let mut reassembler = FragmentReassembler::new();
        let result = reassembler.unfragment("plain message", 1).unwrap();
        assert_eq!(result.as_deref(), Some("plain message"));
    }

    #[test]
    fn wrong_instance_tag_is_dropped_silently() {
        let pieces = fragment_message("hello there", 20, 0x1, 0x2).unwrap();
        let mut reassembler = FragmentReassembler::new();
        let result = reassembler.unfragment(&pieces[0], 0xdead_beef).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn identifier_collision_across_peers_does_not_contaminate() {
        let mut reassembler = FragmentReassembler::new();

        // Craft two fragments that happen to share an identifier but come
        // from different sender tags.
        let from_p = "?OTR|deadbeef|00000001|00000002,00001,00002,hello,";
        let from_q = "?OTR|deadbeef|00000003|00000002,00001,00002,world,";

        assert!(reassembler.unfragment(from_p, 2).unwrap().is_none());
        assert!(reassembler.unfragment(from_q, 2).unwrap().is_none());
        assert_eq!(reassembler.in_progress_count(), 2);

        let finish_p = "?OTR|deadbeef|00000001|00000002,00002,00002, P,";
        let finish_q = "?OTR|deadbeef|00000003|00000002,00002,00002, Q,";

        let p_done = reassembler.unfragment(finish_p, 2).unwrap().unwrap();
        let q_done = reassembler.unfragment(finish_q, 2).unwrap().unwrap();
        assert_eq!(p_done, "hello P");
        assert_eq!(q_done, "world Q");
    }

    #[test]
    fn max_size_too_small_is_rejected() {
        let err = fragment_message("hi", 5, 0, 0);
        assert!(err.is_err());
    }
}
