use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signature verification failed")]
    SignatureVerification,

    #[error("ring signature key set invalid: signer's public key is not exactly one of the three")]
    BadKeySet,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch — possible tampering)")]
    AeadDecrypt,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("too many skipped messages ({0} > {1})")]
    TooManySkipped(u64, u64),

    #[error("replayed or out-of-window message ({ratchet_id}, {message_id})")]
    Replay { ratchet_id: u32, message_id: u32 },

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
