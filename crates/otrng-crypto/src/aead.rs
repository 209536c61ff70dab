//! Message encryption + detached authentication.
//!
//! Generalizes `dl_crypto::aead` (XChaCha20-Poly1305, nonce-prepended) with
//! one addition: OTRv4 data messages carry the authentication tag as a
//! field separate from the ciphertext, computed over the *whole* framed
//! header (`auth_tag: 64 B`), not just the AEAD's own internal
//! tag. We keep XChaCha20-Poly1305 for confidentiality+integrity of the
//! plaintext itself, and layer a BLAKE3 keyed MAC over the header and
//! ciphertext using a key distinct from the AEAD key — this is what makes
//! MAC-key revelation possible without touching the AEAD
//! key which must stay secret for the ciphertext to stay confidential.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    XChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::primitives::constant_time_eq;

/// Encrypt `plaintext` under `key`, returning `nonce (24B) || ciphertext+tag`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, chacha20poly1305::aead::Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;
    let mut out = Vec::with_capacity(24 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce || ciphertext+tag` under `key`.
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < 24 {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(24);
    let nonce = chacha20poly1305::XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(nonce, chacha20poly1305::aead::Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

/// Authentication tag over a framed message, keyed by the per-message
/// `mac_key` output of `kdf::kdf_ck`. Revealed `mac_key`s let a peer prove,
/// after the fact, what it authenticated — without exposing anything that
/// could be used to forge a *new* message (deniability).
pub fn mac_tag(mac_key: &[u8; 32], framed: &[u8]) -> [u8; 32] {
    blake3::keyed_hash(mac_key, framed).into()
}

pub fn verify_mac(mac_key: &[u8; 32], framed: &[u8], tag: &[u8; 32]) -> bool {
    let expected = mac_tag(mac_key, framed);
    constant_time_eq(&expected, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [7u8; 32];
        let ct = encrypt(&key, b"hello bob", b"aad").unwrap();
        let pt = decrypt(&key, &ct, b"aad").unwrap();
        assert_eq!(&pt[..], b"hello bob");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = [7u8; 32];
        let mut ct = encrypt(&key, b"hello bob", b"aad").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(decrypt(&key, &ct, b"aad").is_err());
    }

    #[test]
    fn mac_tag_detects_tamper() {
        let mac_key = [9u8; 32];
        let tag = mac_tag(&mac_key, b"header||ciphertext");
        assert!(verify_mac(&mac_key, b"header||ciphertext", &tag));
        assert!(!verify_mac(&mac_key, b"header||ciphertextX", &tag));
    }
}
