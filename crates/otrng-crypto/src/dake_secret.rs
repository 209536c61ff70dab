//! Mixes the DAKE's ECDH and DH contributions into the shared secret `K`
//! that seeds the double ratchet's root key ("at DAKE
//! completion both parties have a shared secret K, mixed from ECDH ...
//! and DH ...").
//!
//! Grounded in `dl_crypto::x3dh`'s "concatenate DH outputs behind a fixed
//! domain-separation prefix, then HKDF-expand" shape, narrowed to the two
//! DH outputs OTRv4's interactive DAKE produces (one ECDH, one DH) in
//! place of X3DH's three or four.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// `K = HKDF(salt="otrng-dake-k", ikm = ecdh_output || dh_output,
/// info="otrng-shared-secret", 64)`.
pub fn mix_dake_secret(
    ecdh_output: &[u8; 32],
    dh_output: &[u8; 32],
) -> Result<[u8; 64], CryptoError> {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(ecdh_output);
    ikm.extend_from_slice(dh_output);

    let hk = Hkdf::<Sha256>::new(Some(b"otrng-dake-k"), &ikm);
    let mut k = [0u8; 64];
    hk.expand(b"otrng-shared-secret", &mut k)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    ikm.zeroize();
    Ok(k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixing_is_deterministic() {
        let ecdh = [1u8; 32];
        let dh = [2u8; 32];
        assert_eq!(
            mix_dake_secret(&ecdh, &dh).unwrap(),
            mix_dake_secret(&ecdh, &dh).unwrap()
        );
    }

    #[test]
    fn differing_inputs_diverge() {
        let ecdh = [1u8; 32];
        let dh_a = [2u8; 32];
        let dh_b = [3u8; 32];
        assert_ne!(
            mix_dake_secret(&ecdh, &dh_a).unwrap(),
            mix_dake_secret(&ecdh, &dh_b).unwrap()
        );
    }
}
