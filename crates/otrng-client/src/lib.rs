//! Account- and conversation-level state machine for an OTRv4-style
//! secure messaging engine: long-term identity and signed profiles,
//! the DAKE driver, the double-ratchet-backed `Conversation`, SMP, and
//! the host integration surface (`Callbacks`) that drives all of it.
//!
//! Layering mirrors `otrng-proto`/`otrng-crypto`: this crate owns every
//! policy and error-handling decision and is the only one that talks to
//! a host application, but never touches the wire directly — that's
//! `otrng-proto`'s job, reached through `Conversation`.

pub mod callbacks;
pub mod client;
pub mod conversation;
pub mod dake;
pub mod error;
pub mod fingerprint;
pub mod fragment_mgr;
pub mod policy;
pub mod profile;
pub mod smp;

pub use callbacks::{Callbacks, MsgEvent, SmpEvent};
pub use client::{Client, ClientId};
pub use conversation::{Conversation, Outcome};
pub use error::ClientError;
pub use fingerprint::{FingerprintStore, Observation, TrustState};
pub use fragment_mgr::{ExpirySchedule, FragmentPolicy};
pub use policy::Policy;
pub use profile::{ClientIdentity, PrekeyMessagePool};
