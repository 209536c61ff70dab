//! Wire format for the OTRv4-style secure messaging engine: MPI
//! encoding, TLV framing, fragmentation, the outer base64 envelope, and
//! the DAKE/data message structs that ride inside it.
//!
//! This crate depends on `otrng-crypto` for the key/signature newtypes
//! its wire structs carry, but performs no cryptographic operations
//! itself — encryption, signing, and verification stay in
//! `otrng-crypto` and the state machine in `otrng-client`.

pub mod error;
pub mod fragment;
pub mod message;
pub mod mpi;
pub mod tlv;
pub mod wire;

pub use error::ProtoError;
pub use fragment::{FragmentReassembler, FragmentStatus};
pub use message::{
    AuthIMessage, AuthRMessage, ClientProfile, DataMessage, IdentityMessage,
    NonInteractiveAuthMessage, PrekeyEnsemble, PrekeyMessage, PrekeyProfile,
};
pub use tlv::Tlv;
