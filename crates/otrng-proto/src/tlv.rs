//! TLV framing for records carried inside a decrypted data-message
//! payload: SMP steps, disconnect, padding.
//!
//! Type numbering: padding=0, disconnect=1, SMP messages 1-4 = 2..5,
//! abort=6, message-1-with-question=7. Wire shape
//! (`type: u16, len: u16, value`) follows the same length-prefixed-value
//! idiom as `otrng_serialize_data` in serialize.c, narrowed to `u16`
//! since a TLV payload is bounded by the surrounding data message.

use crate::error::ProtoError;
use crate::mpi::{Reader, Writer};

pub const TLV_PADDING: u16 = 0;
pub const TLV_DISCONNECT: u16 = 1;
pub const TLV_SMP_MESSAGE_1: u16 = 2;
pub const TLV_SMP_MESSAGE_2: u16 = 3;
pub const TLV_SMP_MESSAGE_3: u16 = 4;
pub const TLV_SMP_MESSAGE_4: u16 = 5;
pub const TLV_SMP_ABORT: u16 = 6;
pub const TLV_SMP_MESSAGE_1Q: u16 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tlv_type: u16, value: Vec<u8>) -> Self {
        Self { tlv_type, value }
    }

    fn write(&self, w: &mut Writer) {
        w.write_u16(self.tlv_type);
        w.write_u16(self.value.len() as u16);
        w.write_raw(&self.value);
    }

    fn read(r: &mut Reader) -> Result<Self, ProtoError> {
        let tlv_type = r.read_u16()?;
        let len = r.read_u16()? as usize;
        let value = r.read_fixed(len)?.to_vec();
        Ok(Tlv { tlv_type, value })
    }
}

/// A zero-filled padding TLV of `len` bytes.
pub fn padding_tlv(len: usize) -> Tlv {
    Tlv::new(TLV_PADDING, vec![0u8; len])
}

/// A padding TLV sized so that `payload_len` plus the TLV (4-byte header
/// plus value) lands on a multiple of `padding` bytes. `padding == 0`
/// disables padding entirely (empty TLV value, as if absent).
pub fn padding_tlv_for(payload_len: usize, padding: usize) -> Tlv {
    if padding == 0 {
        return Tlv::new(TLV_PADDING, Vec::new());
    }
    let framed_len = payload_len + 4;
    let remainder = framed_len % padding;
    let pad_len = if remainder == 0 { 0 } else { padding - remainder };
    Tlv::new(TLV_PADDING, vec![0u8; pad_len])
}

/// Serialize a sequence of TLV records back to back — the tail of a data
/// message payload, after the plaintext proper.
pub fn encode_tlvs(tlvs: &[Tlv]) -> Vec<u8> {
    let mut w = Writer::new();
    for tlv in tlvs {
        tlv.write(&mut w);
    }
    w.into_bytes()
}

pub fn decode_tlvs(bytes: &[u8]) -> Result<Vec<Tlv>, ProtoError> {
    let mut r = Reader::new(bytes);
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(Tlv::read(&mut r)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_single_tlv() {
        let tlvs = vec![Tlv::new(TLV_DISCONNECT, vec![])];
        let bytes = encode_tlvs(&tlvs);
        assert_eq!(decode_tlvs(&bytes).unwrap(), tlvs);
    }

    #[test]
    fn roundtrip_multiple_tlvs() {
        let tlvs = vec![
            Tlv::new(TLV_SMP_MESSAGE_1, vec![1, 2, 3]),
            padding_tlv(16),
            Tlv::new(TLV_SMP_ABORT, vec![]),
        ];
        let bytes = encode_tlvs(&tlvs);
        assert_eq!(decode_tlvs(&bytes).unwrap(), tlvs);
    }

    #[test]
    fn truncated_tlv_stream_errors() {
        let bytes = vec![0, TLV_SMP_MESSAGE_1 as u8, 0, 10, 1, 2];
        assert!(decode_tlvs(&bytes).is_err());
    }

    #[test]
    fn sized_padding_rounds_up_to_multiple() {
        let payload_len = 37;
        let padding = 256;
        let tlv = padding_tlv_for(payload_len, padding);
        let total = payload_len + 4 + tlv.value.len();
        assert_eq!(total % padding, 0);
    }

    #[test]
    fn sized_padding_no_op_on_exact_multiple() {
        let tlv = padding_tlv_for(252, 256);
        assert_eq!(tlv.value.len(), 0);
    }

    #[test]
    fn sized_padding_disabled_when_zero() {
        let tlv = padding_tlv_for(1000, 0);
        assert_eq!(tlv.value.len(), 0);
    }
}
