//! DAKE messages, the data message, and the signed profile/prekey wire
//! types they carry.
//!
//! The data message has an exact byte grammar and is
//! serialized with the `mpi` writer/reader, mirroring
//! `otrng_serialize_*` in serialize.c. DAKE messages and profiles carry
//! no such byte-exact grammar, so — matching
//! `dl_proto::envelope`/`dl_proto::message`'s own choice for its
//! non-byte-critical structs — they are plain `serde` types, JSON on the
//! wire once base64-wrapped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use otrng_crypto::{DhPublic, EcdhPublic, RingSig, SigningPublic};

use crate::error::ProtoError;
use crate::mpi::{Reader, Writer};

pub const PROTOCOL_VERSION: u16 = 4;
pub const MSG_TYPE_DATA: u8 = 0x03;

/// `{protocol_version, type, sender_instag, receiver_instag, flags,
/// previous_chain_length, ratchet_id, message_id, sender_ECDH, sender_DH,
/// nonce, ciphertext, auth_tag, old_mac_keys}`.
///
/// Two primitive-width substitutions versus the classic OTRv4 field
/// widths, both inherited from `otrng_crypto::primitives`' documented
/// curve/AEAD facade choice:
/// the point is 32 bytes (X25519) rather than 57 (Ed448), and the
/// authentication tag is the 32-byte BLAKE3 keyed MAC from
/// `otrng_crypto::aead::mac_tag` rather than a 64-byte tag.
#[derive(Debug, Clone)]
pub struct DataMessage {
    pub sender_instance_tag: u32,
    pub receiver_instance_tag: u32,
    pub flags: u8,
    pub previous_chain_length: u32,
    pub ratchet_id: u32,
    pub message_id: u32,
    pub sender_ecdh: EcdhPublic,
    pub sender_dh: Option<DhPublic>,
    pub nonce: [u8; 24],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; 32],
    pub old_mac_keys: Vec<[u8; 32]>,
}

impl DataMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u16(PROTOCOL_VERSION);
        w.write_u8(MSG_TYPE_DATA);
        w.write_u32(self.sender_instance_tag);
        w.write_u32(self.receiver_instance_tag);
        w.write_u8(self.flags);
        w.write_u32(self.previous_chain_length);
        w.write_u32(self.ratchet_id);
        w.write_u32(self.message_id);
        w.write_raw(self.sender_ecdh.as_bytes());
        match &self.sender_dh {
            Some(dh) => w.write_mpi(dh.as_bytes()),
            None => w.write_mpi(&[]),
        }
        w.write_raw(&self.nonce);
        w.write_data(&self.ciphertext);
        w.write_raw(&self.auth_tag);
        let mut mac_bytes = Vec::with_capacity(self.old_mac_keys.len() * 32);
        for key in &self.old_mac_keys {
            mac_bytes.extend_from_slice(key);
        }
        w.write_data(&mac_bytes);
        w.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        let mut r = Reader::new(bytes);
        let version = r.read_u16()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtoError::InvalidFormat(format!(
                "unsupported protocol version {version}"
            )));
        }
        let msg_type = r.read_u8()?;
        if msg_type != MSG_TYPE_DATA {
            return Err(ProtoError::InvalidFormat(format!(
                "expected data message type 0x{MSG_TYPE_DATA:02x}, got 0x{msg_type:02x}"
            )));
        }
        let sender_instance_tag = r.read_u32()?;
        let receiver_instance_tag = r.read_u32()?;
        let flags = r.read_u8()?;
        let previous_chain_length = r.read_u32()?;
        let ratchet_id = r.read_u32()?;
        let message_id = r.read_u32()?;

        let ecdh_bytes: [u8; 32] = r
            .read_fixed(32)?
            .try_into()
            .map_err(|_| ProtoError::InvalidFormat("bad sender ECDH length".into()))?;
        let sender_ecdh = EcdhPublic(ecdh_bytes);

        let dh_bytes = r.read_mpi()?;
        let sender_dh = if dh_bytes.is_empty() {
            None
        } else {
            let arr: [u8; 32] = dh_bytes
                .try_into()
                .map_err(|_| ProtoError::InvalidFormat("bad sender DH length".into()))?;
            Some(DhPublic(arr))
        };

        let nonce: [u8; 24] = r
            .read_fixed(24)?
            .try_into()
            .map_err(|_| ProtoError::InvalidFormat("bad nonce length".into()))?;
        let ciphertext = r.read_data()?.to_vec();
        let auth_tag: [u8; 32] = r
            .read_fixed(32)?
            .try_into()
            .map_err(|_| ProtoError::InvalidFormat("bad auth tag length".into()))?;

        let mac_bytes = r.read_data()?;
        if mac_bytes.len() % 32 != 0 {
            return Err(ProtoError::InvalidFormat(
                "old_mac_keys length is not a multiple of 32".into(),
            ));
        }
        let old_mac_keys = mac_bytes
            .chunks(32)
            .map(|c| c.try_into().expect("chunk of 32"))
            .collect();

        if !r.is_empty() {
            return Err(ProtoError::InvalidFormat(format!(
                "{} trailing bytes after data message",
                r.remaining()
            )));
        }

        Ok(Self {
            sender_instance_tag,
            receiver_instance_tag,
            flags,
            previous_chain_length,
            ratchet_id,
            message_id,
            sender_ecdh,
            sender_dh,
            nonce,
            ciphertext,
            auth_tag,
            old_mac_keys,
        })
    }
}

/// Long-lived signed record asserting an account's long-term and
/// forging public keys and supported protocol versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub owner_instance_tag: u32,
    pub public_key: SigningPublic,
    pub forging_key: SigningPublic,
    pub versions: Vec<u8>,
    pub expiration: DateTime<Utc>,
    #[serde(with = "sig64")]
    pub signature: [u8; 64],
}

/// Shorter-lived signed record binding an ephemeral shared-prekey point
/// to the client's instance tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyProfile {
    pub owner_instance_tag: u32,
    pub shared_prekey: EcdhPublic,
    pub expiration: DateTime<Utc>,
    #[serde(with = "sig64")]
    pub signature: [u8; 64],
}

/// One-shot material stored by the originator until consumed by a
/// non-interactive DAKE initiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyMessage {
    pub id: u32,
    pub instance_tag: u32,
    pub ecdh_public: EcdhPublic,
    pub dh_public: DhPublic,
}

/// Bundle handed to a non-interactive DAKE initiator by the prekey
/// server: the peer's long-term profile, prekey profile, and one
/// unconsumed prekey message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyEnsemble {
    pub client_profile: ClientProfile,
    pub prekey_profile: PrekeyProfile,
    pub prekey_message: PrekeyMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityMessage {
    pub sender_instance_tag: u32,
    pub receiver_instance_tag: u32,
    pub client_profile: ClientProfile,
    pub ephemeral_ecdh: EcdhPublic,
    pub ephemeral_dh: DhPublic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRMessage {
    pub sender_instance_tag: u32,
    pub receiver_instance_tag: u32,
    pub client_profile: ClientProfile,
    pub ephemeral_ecdh: EcdhPublic,
    pub ephemeral_dh: DhPublic,
    pub sigma: RingSig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthIMessage {
    pub sender_instance_tag: u32,
    pub receiver_instance_tag: u32,
    pub sigma: RingSig,
}

/// One-shot handshake-plus-first-message for the non-interactive DAKE
/// path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonInteractiveAuthMessage {
    pub sender_instance_tag: u32,
    pub receiver_instance_tag: u32,
    pub client_profile: ClientProfile,
    pub ephemeral_ecdh: EcdhPublic,
    pub ephemeral_dh: DhPublic,
    pub prekey_message_id: u32,
    pub sigma: RingSig,
    #[serde(with = "data_message_bytes")]
    pub first_data_message: DataMessage,
}

mod sig64 {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(&s)
            .map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

mod data_message_bytes {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::DataMessage;

    pub fn serialize<S: Serializer>(msg: &DataMessage, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(msg.to_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DataMessage, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(&s)
            .map_err(serde::de::Error::custom)?;
        DataMessage::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Authenticated context folded into the DAKE transcript ("Phi
/// serialization"): `ser(min(tag)) || ser(max(tag)) ||
/// DATA(shared_session_state) || DATA(initial_message_or_empty)`.
pub fn serialize_phi(
    sender_instance_tag: u32,
    receiver_instance_tag: u32,
    shared_session_state: &str,
    initial_message: Option<&str>,
) -> Vec<u8> {
    let mut w = Writer::new();
    let (lo, hi) = if sender_instance_tag < receiver_instance_tag {
        (sender_instance_tag, receiver_instance_tag)
    } else {
        (receiver_instance_tag, sender_instance_tag)
    };
    w.write_u32(lo);
    w.write_u32(hi);
    w.write_data(shared_session_state.as_bytes());
    w.write_data(initial_message.unwrap_or("").as_bytes());
    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use otrng_crypto::{DhKeyPair, EcdhKeyPair};

    fn sample_message(ratchet_id: u32) -> DataMessage {
        let ecdh = EcdhKeyPair::generate();
        let dh = DhKeyPair::generate();
        DataMessage {
            sender_instance_tag: 0x1234_5678,
            receiver_instance_tag: 0x9abc_def0,
            flags: 0,
            previous_chain_length: 3,
            ratchet_id,
            message_id: 7,
            sender_ecdh: ecdh.public(),
            sender_dh: if ratchet_id % 3 == 0 {
                Some(dh.public())
            } else {
                None
            },
            nonce: [9u8; 24],
            ciphertext: b"ciphertext-bytes".to_vec(),
            auth_tag: [1u8; 32],
            old_mac_keys: vec![[2u8; 32], [3u8; 32]],
        }
    }

    #[test]
    fn data_message_roundtrips_with_dh() {
        let msg = sample_message(3);
        let bytes = msg.to_bytes();
        let parsed = DataMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.ratchet_id, 3);
        assert!(parsed.sender_dh.is_some());
        assert_eq!(parsed.old_mac_keys, msg.old_mac_keys);
    }

    #[test]
    fn data_message_roundtrips_without_dh() {
        let msg = sample_message(4);
        let bytes = msg.to_bytes();
        let parsed = DataMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.ratchet_id, 4);
        assert!(parsed.sender_dh.is_none());
    }

    #[test]
    fn rejects_wrong_protocol_version() {
        let mut bytes = sample_message(3).to_bytes();
        bytes[1] = 3;
        assert!(DataMessage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn phi_is_order_independent_in_instance_tags() {
        let a = serialize_phi(10, 20, "state", Some("hi"));
        let b = serialize_phi(20, 10, "state", Some("hi"));
        assert_eq!(a, b);
    }
}
