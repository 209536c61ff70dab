//! Outer wire envelope: the `?OTR:...` base64 wrap, the query token, the
//! whitespace tag, and the format discriminator that decides which path
//! an incoming string takes: bytes → fragment reassembly → format
//! discriminator → DAKE or data-message path.
//!
//! Grounded in `dl_proto::codec`'s framing role (padding/batching live
//! there for Darklock; here the equivalent "what does this string mean"
//! job is the format discriminator) and `dl_proto::envelope`'s
//! opaque-to-the-relay framing idea, adapted to OTRv4's plaintext-visible
//! query/whitespace tokens.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::ProtoError;

pub const QUERY_TOKEN: &str = "?OTRv43?";
pub const WIRE_PREFIX: &str = "?OTR:";
pub const WIRE_SUFFIX: &str = ".";
pub const ERROR_PREFIX: &str = "?OTR Error:";

/// Base tag shared by every version, followed by a per-version suffix —
/// the historical OTR whitespace-tag convention, narrowed to the one
/// version this engine speaks.
const WHITESPACE_TAG_BASE: &str = " \t  \t\t\t\t\t\t \t \t  ";
const WHITESPACE_TAG_V4: &str = " \t \t  \t \t";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatDiscriminator {
    /// A base64-wrapped OTRv4 DAKE or data message.
    Otrv4,
    /// Recognized as OTR wire traffic but not a version this engine
    /// speaks (e.g. legacy OTRv3) — handed off opaquely rather than parsed.
    LegacyOrUnknown,
    /// A query token, optionally followed by a human tagline.
    Query,
    /// Plaintext carrying an embedded whitespace tag.
    WhitespaceTag,
    /// An OTR Error message.
    Error,
    /// Ordinary plaintext with no OTR significance.
    PlainText,
}

pub fn classify(message: &str) -> FormatDiscriminator {
    if message.starts_with(WIRE_PREFIX) {
        return FormatDiscriminator::Otrv4;
    }
    if message.starts_with(ERROR_PREFIX) {
        return FormatDiscriminator::Error;
    }
    if message.starts_with(QUERY_TOKEN) {
        return FormatDiscriminator::Query;
    }
    if message.starts_with("?OTR") {
        return FormatDiscriminator::LegacyOrUnknown;
    }
    if message.contains(WHITESPACE_TAG_BASE) {
        return FormatDiscriminator::WhitespaceTag;
    }
    FormatDiscriminator::PlainText
}

/// Produce an OTRv4 query token followed by the human-readable tagline.
pub fn query_message(tagline: &str) -> String {
    format!("{QUERY_TOKEN}{tagline}")
}

/// Embed the whitespace tag in an otherwise plaintext message, signaling
/// OTR support without interrupting the conversation.
pub fn with_whitespace_tag(plaintext: &str) -> String {
    format!("{plaintext}{WHITESPACE_TAG_BASE}{WHITESPACE_TAG_V4}")
}

pub fn strip_whitespace_tag(message: &str) -> String {
    message
        .replace(&format!("{WHITESPACE_TAG_BASE}{WHITESPACE_TAG_V4}"), "")
        .replace(WHITESPACE_TAG_BASE, "")
}

/// Wrap a serialized OTR message body for the wire: `?OTR:<base64>.`
pub fn wrap(body: &[u8]) -> String {
    format!("{WIRE_PREFIX}{}{WIRE_SUFFIX}", STANDARD.encode(body))
}

/// Undo `wrap`, returning the raw message bytes.
pub fn unwrap(message: &str) -> Result<Vec<u8>, ProtoError> {
    let inner = message
        .strip_prefix(WIRE_PREFIX)
        .and_then(|s| s.strip_suffix(WIRE_SUFFIX))
        .ok_or(ProtoError::NotOtrWire)?;
    Ok(STANDARD.decode(inner)?)
}

pub fn error_message(text: &str) -> String {
    format!("{ERROR_PREFIX} {text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let body = b"arbitrary binary payload \x00\x01\x02";
        let wrapped = wrap(body);
        assert!(wrapped.starts_with(WIRE_PREFIX));
        assert_eq!(unwrap(&wrapped).unwrap(), body);
    }

    #[test]
    fn classifies_query_and_plaintext() {
        assert_eq!(classify("?OTRv43?Hi bob"), FormatDiscriminator::Query);
        assert_eq!(classify("just chatting"), FormatDiscriminator::PlainText);
        assert_eq!(classify(&wrap(b"x")), FormatDiscriminator::Otrv4);
    }

    #[test]
    fn whitespace_tag_roundtrip() {
        let tagged = with_whitespace_tag("hello");
        assert_eq!(classify(&tagged), FormatDiscriminator::WhitespaceTag);
        assert_eq!(strip_whitespace_tag(&tagged), "hello");
    }

    #[test]
    fn unwrap_rejects_non_wire_input() {
        assert!(unwrap("not wrapped at all").is_err());
    }
}
