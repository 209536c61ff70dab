//! Error taxonomy for the client/conversation layer.
//!
//! Mirrors `StoreError`'s shape: one `thiserror` enum per crate-level
//! concern, `#[from]` for the lower layers, each variant carrying enough
//! context for `Callbacks::display_error_message` to produce something
//! user-presentable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("malformed frame: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("conversation is not in ENCRYPTED_MESSAGES")]
    NotEncrypted,

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("out of resource: {0}")]
    OutOfResource(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("replayed message")]
    Replay,

    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error(transparent)]
    Crypto(#[from] otrng_crypto::CryptoError),

    #[error(transparent)]
    Proto(#[from] otrng_proto::ProtoError),

    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// True for the "silent" failure class: the message is dropped,
    /// `should_ignore=true`, session preserved — never surfaced as wire
    /// output or a hard error to the caller.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            ClientError::AuthenticationFailed | ClientError::Replay
        ) || matches!(
            self,
            ClientError::Crypto(otrng_crypto::CryptoError::Replay { .. })
        )
    }

    /// True for protocol violations during a DAKE, which abort the DAKE
    /// back to `START` rather than just dropping one message (§7(b)).
    pub fn aborts_dake(&self) -> bool {
        matches!(self, ClientError::ProtocolViolation(_))
            || matches!(self, ClientError::Proto(_))
    }
}
