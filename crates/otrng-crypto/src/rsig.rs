//! RSig — three-public-key deniable ring signature.
//!
//! No direct analogue exists in `dl_crypto` (its deniability story rests
//! on X3DH + Double Ratchet alone); this module is grounded in
//! `examples/original_source/src/test/units/test_auth.c`, the reference
//! implementation's own test of `otrng_rsig_authenticate` /
//! `otrng_rsig_verify`, adapted from Ed448/Goldilocks scalars to the
//! Edwards25519 group already used by `primitives::SigningKeyPair` (the
//! facade's curve choice — see primitives.rs's module doc).
//!
//! Algorithm: given three public keys `A1, A2, A3` of which
//! exactly one, `A_k`, is the signer's own, produce `(c_i, r_i)` triples
//! such that a verifier who does not know which index is real learns only
//! that *some* `A_i` signed.

use curve25519_dalek::{edwards::CompressedEdwardsY, scalar::Scalar};
use rand::rngs::OsRng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::primitives::{SigningKeyPair, SigningPublic};

/// Expands an Ed25519 seed into the actual scalar used for `A = s * G`
/// (RFC 8032 §5.1.5 clamping — identical to what `ed25519-dalek` does
/// internally, and to the clamping `dl_crypto::x3dh::ed25519_secret_to_x25519`
/// performs for the X25519 conversion).
fn expand_signing_scalar(seed: &[u8; 32]) -> Scalar {
    let mut h = Sha512::digest(seed);
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut clamped = [0u8; 32];
    clamped.copy_from_slice(&h[..32]);
    h.zeroize();
    let scalar = Scalar::from_bytes_mod_order(clamped);
    clamped.zeroize();
    scalar
}

fn decompress(pub_key: &SigningPublic) -> Result<curve25519_dalek::edwards::EdwardsPoint, CryptoError> {
    CompressedEdwardsY(*pub_key.as_bytes())
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("public key is not a valid curve point".into()))
}

/// `c = H(usage, domain, A1, A2, A3, T1, T2, T3, msg) mod q`, via a wide
/// (64-byte) BLAKE3 XOF output reduced into the scalar field.
fn challenge(
    usage: u8,
    domain: &[u8],
    a: [&SigningPublic; 3],
    t: [&curve25519_dalek::edwards::EdwardsPoint; 3],
    msg: &[u8],
) -> Scalar {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[usage]);
    hasher.update(domain);
    for pk in a {
        hasher.update(pk.as_bytes());
    }
    for point in t {
        hasher.update(point.compress().as_bytes());
    }
    hasher.update(msg);
    let mut wide = [0u8; 64];
    hasher.finalize_xof().fill(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingSig {
    c1: [u8; 32],
    r1: [u8; 32],
    c2: [u8; 32],
    r2: [u8; 32],
    c3: [u8; 32],
    r3: [u8; 32],
}

/// Produce a ring signature over `msg`, proving knowledge of the private
/// key for exactly one of `a1, a2, a3` without revealing which.
pub fn authenticate(
    signer: &SigningKeyPair,
    a1: &SigningPublic,
    a2: &SigningPublic,
    a3: &SigningPublic,
    usage: u8,
    domain: &[u8],
    msg: &[u8],
) -> Result<RingSig, CryptoError> {
    let keys = [a1, a2, a3];
    if a1.as_bytes() == a2.as_bytes() || a2.as_bytes() == a3.as_bytes() || a1.as_bytes() == a3.as_bytes()
    {
        return Err(CryptoError::BadKeySet);
    }
    let signer_pub = signer.public();
    let matches: Vec<usize> = keys
        .iter()
        .enumerate()
        .filter(|(_, k)| k.as_bytes() == signer_pub.as_bytes())
        .map(|(i, _)| i)
        .collect();
    if matches.len() != 1 {
        return Err(CryptoError::BadKeySet);
    }
    let k = matches[0];

    let points = [decompress(a1)?, decompress(a2)?, decompress(a3)?];

    let mut c = [Scalar::ZERO; 3];
    let mut r = [Scalar::ZERO; 3];
    let mut t_points = [points[0], points[1], points[2]];

    // Simulate the two indices that are not the real signer.
    for i in 0..3 {
        if i == k {
            continue;
        }
        let mut c_bytes = [0u8; 32];
        let mut r_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut c_bytes);
        OsRng.fill_bytes(&mut r_bytes);
        c[i] = Scalar::from_bytes_mod_order(c_bytes);
        r[i] = Scalar::from_bytes_mod_order(r_bytes);
        t_points[i] = curve25519_dalek::edwards::EdwardsPoint::mul_base(&r[i]) + points[i] * c[i];
    }

    // Real index: ephemeral commitment.
    let mut t_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut t_bytes);
    let t_scalar = Scalar::from_bytes_mod_order(t_bytes);
    t_bytes.zeroize();
    t_points[k] = curve25519_dalek::edwards::EdwardsPoint::mul_base(&t_scalar);

    let c_total = challenge(
        usage,
        domain,
        [a1, a2, a3],
        [&t_points[0], &t_points[1], &t_points[2]],
        msg,
    );

    let mut sum_others = Scalar::ZERO;
    for i in 0..3 {
        if i != k {
            sum_others += c[i];
        }
    }
    c[k] = c_total - sum_others;

    let signer_scalar = expand_signing_scalar(signer.secret_scalar_bytes());
    r[k] = t_scalar - c[k] * signer_scalar;

    Ok(RingSig {
        c1: c[0].to_bytes(),
        r1: r[0].to_bytes(),
        c2: c[1].to_bytes(),
        r2: r[1].to_bytes(),
        c3: c[2].to_bytes(),
        r3: r[2].to_bytes(),
    })
}

/// Verify a ring signature: accepts iff `c1 + c2 + c3 ≡ c (mod q)` for the
/// recomputed challenge.
pub fn verify(
    sig: &RingSig,
    a1: &SigningPublic,
    a2: &SigningPublic,
    a3: &SigningPublic,
    usage: u8,
    domain: &[u8],
    msg: &[u8],
) -> Result<bool, CryptoError> {
    let points = [decompress(a1)?, decompress(a2)?, decompress(a3)?];
    let c = [
        Scalar::from_canonical_bytes(sig.c1)
            .into_option()
            .ok_or_else(|| CryptoError::InvalidKey("c1 not canonical".into()))?,
        Scalar::from_canonical_bytes(sig.c2)
            .into_option()
            .ok_or_else(|| CryptoError::InvalidKey("c2 not canonical".into()))?,
        Scalar::from_canonical_bytes(sig.c3)
            .into_option()
            .ok_or_else(|| CryptoError::InvalidKey("c3 not canonical".into()))?,
    ];
    let r = [
        Scalar::from_canonical_bytes(sig.r1)
            .into_option()
            .ok_or_else(|| CryptoError::InvalidKey("r1 not canonical".into()))?,
        Scalar::from_canonical_bytes(sig.r2)
            .into_option()
            .ok_or_else(|| CryptoError::InvalidKey("r2 not canonical".into()))?,
        Scalar::from_canonical_bytes(sig.r3)
            .into_option()
            .ok_or_else(|| CryptoError::InvalidKey("r3 not canonical".into()))?,
    ];

    let t_points: Vec<_> = (0..3)
        .map(|i| curve25519_dalek::edwards::EdwardsPoint::mul_base(&r[i]) + points[i] * c[i])
        .collect();

    let recomputed = challenge(usage, domain, [a1, a2, a3], [&t_points[0], &t_points[1], &t_points[2]], msg);
    Ok(c[0] + c[1] + c[2] == recomputed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_for_each_ring_position() {
        let p1 = SigningKeyPair::generate();
        let p2 = SigningKeyPair::generate();
        let p3 = SigningKeyPair::generate();
        let msg = b"hi";

        for (signer, a1, a2, a3) in [
            (&p1, p1.public(), p2.public(), p3.public()),
            (&p2, p1.public(), p2.public(), p3.public()),
            (&p3, p1.public(), p2.public(), p3.public()),
        ] {
            let sig = authenticate(signer, &a1, &a2, &a3, 0x11, b"OTR-Prekey-Server", msg).unwrap();
            assert!(verify(&sig, &a1, &a2, &a3, 0x11, b"OTR-Prekey-Server", msg).unwrap());
        }
    }

    #[test]
    fn rejects_signer_not_in_ring() {
        let p1 = SigningKeyPair::generate();
        let p2 = SigningKeyPair::generate();
        let p3 = SigningKeyPair::generate();
        let outsider = SigningKeyPair::generate();

        let err = authenticate(
            &outsider,
            &p1.public(),
            &p2.public(),
            &p3.public(),
            0x11,
            b"OTR-Prekey-Server",
            b"hi",
        );
        assert!(matches!(err, Err(CryptoError::BadKeySet)));
    }

    #[test]
    fn rejects_duplicate_ring_member() {
        let p1 = SigningKeyPair::generate();
        let p3 = SigningKeyPair::generate();
        let err = authenticate(&p1, &p1.public(), &p1.public(), &p3.public(), 0x11, b"domain", b"hi");
        assert!(matches!(err, Err(CryptoError::BadKeySet)));
    }

    #[test]
    fn tampering_any_byte_breaks_verification() {
        let p1 = SigningKeyPair::generate();
        let p2 = SigningKeyPair::generate();
        let p3 = SigningKeyPair::generate();
        let msg = b"hi";
        let sig = authenticate(&p1, &p1.public(), &p2.public(), &p3.public(), 0x11, b"d", msg).unwrap();

        let mut broken = sig.clone();
        broken.c1[0] ^= 0x01;
        assert!(!verify(&broken, &p1.public(), &p2.public(), &p3.public(), 0x11, b"d", msg).unwrap());

        let mut broken = sig.clone();
        broken.r3[31] ^= 0x01;
        assert!(!verify(&broken, &p1.public(), &p2.public(), &p3.public(), 0x11, b"d", msg).unwrap());
    }
}
