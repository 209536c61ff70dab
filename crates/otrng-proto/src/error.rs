use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message truncated while parsing")]
    Truncated,

    #[error("invalid wire format: {0}")]
    InvalidFormat(String),

    #[error("invalid fragment: {0}")]
    InvalidFragment(String),

    #[error("unknown TLV type {0}")]
    UnknownTlvType(u16),

    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("not an OTRv4-wrapped message")]
    NotOtrWire,
}
