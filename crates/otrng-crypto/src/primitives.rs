//! Curve / DH / hash primitives facade.
//!
//! The rest of the core never imports `x25519_dalek` or `ed25519_dalek`
//! directly — everything goes through the newtypes here. That keeps the
//! concrete curve choice (Ed25519/X25519, standing in for OTRv4's
//! Ed448/Goldilocks and the 3072-bit MODP group) swappable behind one
//! module, keeping primitive choice out of the rest of the core.
//!
//! `EcdhKeyPair` is the per-ratchet-step key; `DhKeyPair` is the
//! coarser-grained key mixed in every third ratchet step.
//! Both wrap the same concrete curve today, but are kept as distinct types
//! so a future swap to a real MODP/DH group only touches this module.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Constant-time byte comparison. Used anywhere a secret-derived value is
/// compared (MAC tags, fingerprints, ring-signature challenges).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

// ── ECDH (per-ratchet-step keys) ─────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdhPublic(#[serde(with = "b64_32")] pub [u8; 32]);

impl EcdhPublic {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<&X25519Public> for EcdhPublic {
    fn from(p: &X25519Public) -> Self {
        EcdhPublic(*p.as_bytes())
    }
}

#[derive(ZeroizeOnDrop)]
pub struct EcdhKeyPair {
    #[zeroize(skip)]
    public: EcdhPublic,
    secret: [u8; 32],
}

impl EcdhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = EcdhPublic::from(&X25519Public::from(&secret));
        Self { public, secret: secret.to_bytes() }
    }

    pub fn public(&self) -> EcdhPublic {
        self.public
    }

    /// Diffie-Hellman with a peer's public point. Output is raw, unmixed
    /// DH material — callers must run it through a KDF before use.
    pub fn diffie_hellman(&self, peer: &EcdhPublic) -> [u8; 32] {
        let secret = StaticSecret::from(self.secret);
        let peer_pub = X25519Public::from(peer.0);
        *secret.diffie_hellman(&peer_pub).as_bytes()
    }
}

// ── DH (coarse-grained, every-third-ratchet keys) ────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhPublic(#[serde(with = "b64_32")] pub [u8; 32]);

impl DhPublic {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[derive(ZeroizeOnDrop)]
pub struct DhKeyPair {
    #[zeroize(skip)]
    public: DhPublic,
    secret: [u8; 32],
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = DhPublic(*X25519Public::from(&secret).as_bytes());
        Self { public, secret: secret.to_bytes() }
    }

    pub fn public(&self) -> DhPublic {
        self.public
    }

    pub fn diffie_hellman(&self, peer: &DhPublic) -> [u8; 32] {
        let secret = StaticSecret::from(self.secret);
        let peer_pub = X25519Public::from(peer.0);
        *secret.diffie_hellman(&peer_pub).as_bytes()
    }
}

// ── Long-term signing identity (Ed25519) ─────────────────────────────────────

/// Long-term Ed448-style (here: Ed25519) signing keypair. Used for both the
/// account's signing key and its forging key (a public key whose private
/// half is deliberately leaked after use — see `otrng_client::profile`).
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)]
    public: SigningPublic,
    secret: [u8; 32],
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningPublic(#[serde(with = "b64_32")] pub [u8; 32]);

impl SigningPublic {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// BLAKE3-based fingerprint for manual verification, grouped in 4-hex
    /// chunks for readability.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let public = SigningPublic(signing_key.verifying_key().to_bytes());
        Self { public, secret: signing_key.to_bytes() }
    }

    pub fn public(&self) -> SigningPublic {
        self.public
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        use ed25519_dalek::Signer;
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&self.secret);
        signing_key.sign(msg).to_bytes()
    }

    pub fn verify(public: &SigningPublic, msg: &[u8], sig: &[u8; 64]) -> Result<(), CryptoError> {
        use ed25519_dalek::Verifier;
        let vk = ed25519_dalek::VerifyingKey::from_bytes(&public.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let signature = ed25519_dalek::Signature::from_bytes(sig);
        vk.verify(msg, &signature)
            .map_err(|_| CryptoError::SignatureVerification)
    }

    /// Exposes the raw secret scalar for the RSig authenticator, which needs
    /// to do its own scalar arithmetic rather than call through `sign`.
    pub fn secret_scalar_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

mod b64_32 {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_agrees() {
        let a = EcdhKeyPair::generate();
        let b = EcdhKeyPair::generate();
        assert_eq!(a.diffie_hellman(&b.public()), b.diffie_hellman(&a.public()));
    }

    #[test]
    fn signing_roundtrip() {
        let kp = SigningKeyPair::generate();
        let sig = kp.sign(b"hello");
        SigningKeyPair::verify(&kp.public(), b"hello", &sig).unwrap();
        assert!(SigningKeyPair::verify(&kp.public(), b"tampered", &sig).is_err());
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
