//! Known-peer fingerprint store.
//!
//! Grounded in `dl_crypto::identity::PublicKeyBytes::fingerprint` /
//! `fingerprints_match` and, one layer up, the verified-contact
//! key-change policy documented at the top of `identity.rs` ("if a
//! stored public key for a verified contact changes, the application
//! MUST block send/receive and require explicit re-verification") —
//! narrowed here to the store itself; enforcement of the policy is the
//! host's job via `Callbacks::fingerprint_seen`.

use std::collections::HashMap;

use otrng_crypto::SigningPublic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    Unverified,
    Verified,
}

struct Entry {
    key: SigningPublic,
    trust: TrustState,
}

/// Per-Client store of recipient → long-term public key, so a key change
/// for a recipient we've already seen can be detected and raised through
/// `Callbacks::fingerprint_seen`.
#[derive(Default)]
pub struct FingerprintStore {
    known: HashMap<String, Entry>,
}

pub enum Observation {
    /// First time we've seen any key for this recipient.
    New,
    /// Matches the previously stored key.
    Unchanged,
    /// Differs from the previously stored key — the host must be told.
    Changed,
}

impl FingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed public key for `recipient`, returning whether
    /// this is new, matches prior knowledge, or represents a key change.
    /// A key change resets trust to `Unverified` — re-verification is
    /// always required after a change, never carried over silently.
    pub fn observe(&mut self, recipient: &str, key: SigningPublic) -> Observation {
        match self.known.get_mut(recipient) {
            None => {
                self.known.insert(
                    recipient.to_string(),
                    Entry { key, trust: TrustState::Unverified },
                );
                Observation::New
            }
            Some(entry) if entry.key.as_bytes() == key.as_bytes() => Observation::Unchanged,
            Some(entry) => {
                entry.key = key;
                entry.trust = TrustState::Unverified;
                Observation::Changed
            }
        }
    }

    pub fn mark_verified(&mut self, recipient: &str) {
        if let Some(entry) = self.known.get_mut(recipient) {
            entry.trust = TrustState::Verified;
        }
    }

    pub fn trust_state(&self, recipient: &str) -> Option<TrustState> {
        self.known.get(recipient).map(|e| e.trust)
    }

    pub fn fingerprint_of(&self, recipient: &str) -> Option<String> {
        self.known.get(recipient).map(|e| e.key.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otrng_crypto::SigningKeyPair;

    #[test]
    fn first_observation_is_new_and_unverified() {
        let mut store = FingerprintStore::new();
        let key = SigningKeyPair::generate().public();
        assert!(matches!(store.observe("bob", key), Observation::New));
        assert!(matches!(store.trust_state("bob"), Some(TrustState::Unverified)));
    }

    #[test]
    fn same_key_is_unchanged() {
        let mut store = FingerprintStore::new();
        let key = SigningKeyPair::generate().public();
        store.observe("bob", key);
        assert!(matches!(store.observe("bob", key), Observation::Unchanged));
    }

    #[test]
    fn key_change_resets_trust_to_unverified() {
        let mut store = FingerprintStore::new();
        let key1 = SigningKeyPair::generate().public();
        let key2 = SigningKeyPair::generate().public();
        store.observe("bob", key1);
        store.mark_verified("bob");
        assert!(matches!(store.trust_state("bob"), Some(TrustState::Verified)));

        assert!(matches!(store.observe("bob", key2), Observation::Changed));
        assert!(matches!(store.trust_state("bob"), Some(TrustState::Unverified)));
    }
}
