//! Policy record applied at `Client` construction: a configuration
//! record built once plus a narrow set of runtime setters, rather than
//! per-field get/set accessors.
//!
//! Grounded in `otrng_client_s`'s fields in `client.h`
//! (`max_stored_msg_keys`, `max_published_prekey_msg`,
//! `minimum_stored_prekey_msg`, `padding`) plus the `otrng_policy_s`
//! returned by `define_policy` (`allow_v3`/`allow_v4`/`require_encryption`/
//! `send_whitespace_tag`/`whitespace_start_ake`/`error_start_ake`).

/// Runtime-hot-reconfigurable fields get dedicated setters on `Client`;
/// everything else is fixed for the Client's lifetime once constructed.
#[derive(Debug, Clone)]
pub struct Policy {
    pub allow_v3: bool,
    pub allow_v4: bool,
    pub require_encryption: bool,
    pub send_whitespace_tag: bool,
    pub whitespace_start_ake: bool,
    pub error_start_ake: bool,

    pub max_stored_msg_keys: usize,
    pub max_published_prekey_msg: u8,
    pub minimum_stored_prekey_msg: u8,

    /// 0 disables padding.
    pub padding: usize,

    /// Grace period past a Client Profile's or Prekey Profile's embedded
    /// expiry during which it's still accepted from a peer.
    pub profile_extra_valid_time: chrono::Duration,

    /// How long a freshly built Client Profile is valid for.
    pub client_profile_validity: chrono::Duration,

    /// How long a freshly built Prekey Profile is valid for.
    pub prekey_profile_validity: chrono::Duration,

    /// How long an in-progress fragment context is kept before
    /// `Client::expire_fragments` discards it.
    pub fragments_expiration: std::time::Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allow_v3: false,
            allow_v4: true,
            require_encryption: false,
            send_whitespace_tag: false,
            whitespace_start_ake: true,
            error_start_ake: true,
            max_stored_msg_keys: 256,
            max_published_prekey_msg: 20,
            minimum_stored_prekey_msg: 5,
            padding: 0,
            profile_extra_valid_time: chrono::Duration::hours(1),
            client_profile_validity: chrono::Duration::days(30),
            prekey_profile_validity: chrono::Duration::days(7),
            fragments_expiration: std::time::Duration::from_secs(60 * 10),
        }
    }
}
