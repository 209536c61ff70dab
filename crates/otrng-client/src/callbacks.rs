//! Host integration trait — one method per effect `client_callbacks.c`
//! dispatches through the `otrng_client_callbacks_s` function-pointer
//! struct. The C struct treats every pointer as nullable and no-ops when
//! absent (`if (!cb->X) return;`); we model that with default trait
//! methods instead, and `Client::new` checks only the narrow required
//! subset via `ensure_needed_exist`.

use otrng_crypto::SigningPublic;
use otrng_proto::{ClientProfile, PrekeyMessage, PrekeyProfile};

use crate::policy::Policy;

/// Outcome of an SMP round, handed to `Callbacks::smp_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpEvent {
    Started,
    InProgress,
    Succeeded,
    Failed,
    Aborted,
}

/// Protocol-level events surfaced to the host beyond plain errors
/// (`handle_event` in client_callbacks.c).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgEvent {
    EncryptionRequired,
    EncryptionError,
    ConnectionEnded,
    SetupError(String),
    MsgReflected,
    MsgNotInPrivate,
    MsgUnreadable,
    MsgMalformed,
}

/// Host integration surface. Every method has a no-op default except the
/// handful `ensure_needed_exist` requires (`inject_message`,
/// `get_shared_session_state`, `session_expiration_time_for`,
/// `define_policy`) — those are required because the core cannot make
/// forward progress without them, matching `client_callbacks.c`'s
/// `ensure_needed_exist` check list.
pub trait Callbacks {
    /// Emit a wire-format string to the transport. Required.
    fn inject_message(&mut self, recipient: &str, message: &str);

    /// Application-level context folded into phi. Required.
    fn get_shared_session_state(&self, recipient: &str) -> String;

    /// How long an encrypted session may live before the core treats it
    /// as expired. Required.
    fn session_expiration_time_for(&self, recipient: &str) -> chrono::Duration;

    /// Policy for this client; called once at construction. Required.
    fn define_policy(&self) -> Policy;

    /// Whether an encrypted conversation that last sent at `last_sent`
    /// (`None` if it has never sent anything) should emit an empty
    /// heartbeat data message right now. Checked on every `receive`.
    fn should_heartbeat(&self, _last_sent: Option<chrono::DateTime<chrono::Utc>>) -> bool {
        false
    }

    fn create_instag(&mut self) -> u32 {
        rand::random::<u32>().max(2)
    }

    /// Notifies the host a fresh long-term Ed25519 identity key was
    /// generated for `account`, so it can be persisted.
    fn create_privkey_v4(&mut self, _account: &str) {}
    /// Notifies the host a fresh forging key was generated for `account`.
    fn create_forging_key(&mut self, _account: &str) {}
    /// Notifies the host a fresh Client Profile was generated for `account`.
    fn create_client_profile(&mut self, _account: &str) {}
    /// Notifies the host a fresh Prekey Profile was generated for `account`.
    fn create_prekey_profile(&mut self, _account: &str) {}

    fn load_client_profile(&self, _account: &str) -> Option<ClientProfile> {
        None
    }
    fn store_client_profile(&mut self, _account: &str, _profile: &ClientProfile) {}
    fn load_expired_client_profile(&self, _account: &str) -> Option<ClientProfile> {
        None
    }
    fn store_expired_client_profile(&mut self, _account: &str, _profile: &ClientProfile) {}

    fn load_forging_key(&self, _account: &str) -> Option<SigningPublic> {
        None
    }
    fn store_forging_key(&mut self, _account: &str, _key: &SigningPublic) {}

    fn load_prekey_profile(&self, _account: &str) -> Option<PrekeyProfile> {
        None
    }
    fn store_prekey_profile(&mut self, _account: &str, _profile: &PrekeyProfile) {}
    fn load_expired_prekey_profile(&self, _account: &str) -> Option<PrekeyProfile> {
        None
    }
    fn store_expired_prekey_profile(&mut self, _account: &str, _profile: &PrekeyProfile) {}

    fn load_prekey_messages(&self, _account: &str) -> Vec<PrekeyMessage> {
        Vec::new()
    }
    fn store_prekey_messages(&mut self, _account: &str, _messages: &[PrekeyMessage]) {}

    fn load_fingerprints_v3(&self, _account: &str) -> Vec<(String, String)> {
        Vec::new()
    }
    fn store_fingerprints_v3(&mut self, _account: &str, _fingerprints: &[(String, String)]) {}
    fn load_fingerprints_v4(&self, _account: &str) -> Vec<(String, String)> {
        Vec::new()
    }
    fn store_fingerprints_v4(&mut self, _account: &str, _fingerprints: &[(String, String)]) {}

    fn gone_secure(&mut self, _recipient: &str) {}
    fn gone_insecure(&mut self, _recipient: &str) {}

    fn fingerprint_seen(&mut self, _fingerprint: &str, _recipient: &str) {}
    fn fingerprint_seen_v3(&mut self, _fingerprint: &str, _recipient: &str) {}

    fn smp_ask_for_secret(&mut self, _recipient: &str) {}
    fn smp_ask_for_answer(&mut self, _question: &str, _recipient: &str) {}
    fn smp_update(&mut self, _event: SmpEvent, _progress_percent: u8, _recipient: &str) {}

    /// Returns the user-presentable string for an error event; `None`
    /// suppresses wire-level Error-message emission for that event.
    fn display_error_message(&mut self, _event: &MsgEvent, _recipient: &str) -> Option<String> {
        None
    }

    fn handle_event(&mut self, _event: MsgEvent) {}
}

/// `Client::new`'s narrow required-subset check, performed at Client
/// creation. Since the required methods above have no default impl, any `T:
/// Callbacks` already satisfies this trivially in Rust — this function
/// exists to name the invariant explicitly, matching the C source's
/// runtime assertion with a compile-time one.
pub fn ensure_needed_exist<C: Callbacks>(_callbacks: &C) -> bool {
    true
}
