//! Cryptographic core for the OTRv4-style secure messaging protocol:
//! curve/DH primitives, key derivation, authenticated encryption, the
//! three-key deniable ring signature, and the double ratchet.
//!
//! Layering mirrors `dl_crypto`: this crate never logs, never touches the
//! network or disk, and never makes policy decisions — those live in
//! `otrng-client`. Every secret-holding type here zeroizes on drop.

pub mod aead;
pub mod dake_secret;
pub mod error;
pub mod kdf;
pub mod primitives;
pub mod ratchet;
pub mod rsig;

pub use dake_secret::mix_dake_secret;
pub use error::CryptoError;
pub use primitives::{DhKeyPair, DhPublic, EcdhKeyPair, EcdhPublic, SigningKeyPair, SigningPublic};
pub use ratchet::{RatchetHeader, RatchetState};
pub use rsig::RingSig;
