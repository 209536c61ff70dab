//! `Client`: the account-level entity a host application owns one of
//! per account. Owns long-term identity, the signed
//! profiles built from it, the outstanding Prekey Message pool, one
//! `Conversation` per recipient, and the fingerprint store — and
//! drives all of those through a `Callbacks` implementation the host
//! supplies.
//!
//! Grounded in `client.h`'s public API block
//! (`otrng_client_new`/`_query_message`/`_send`/`_receive`/
//! `_disconnect`/`_smp_start`/`_smp_respond`/`_expire_fragments`/
//! `_get_our_fingerprint`/`_build_prekey_messages`/`_add_instance_tag`).

use std::collections::HashMap;

use otrng_crypto::{DhKeyPair, EcdhKeyPair};
use otrng_proto::{wire, ClientProfile, PrekeyEnsemble, PrekeyMessage};

use crate::callbacks::{ensure_needed_exist, Callbacks, MsgEvent};
use crate::conversation::{Conversation, Outcome};
use crate::error::ClientError;
use crate::fingerprint::FingerprintStore;
use crate::fragment_mgr::{ExpirySchedule, FragmentPolicy};
use crate::policy::Policy;
use crate::profile::{ClientIdentity, PrekeyMessagePool};

const QUERY_TAGLINE: &str = " - OTR encryption required";

/// Stable identifier for an account, mirroring `otrng_client_id_s`
/// (`protocol`/`account` pair the host uses to key profile storage).
#[derive(Debug, Clone)]
pub struct ClientId {
    pub protocol: String,
    pub account: String,
}

pub struct Client<C: Callbacks> {
    pub id: ClientId,
    pub identity: ClientIdentity,
    pub policy: Policy,
    profile: ClientProfile,
    prekeys: PrekeyMessagePool,
    conversations: HashMap<String, Conversation>,
    fingerprints: FingerprintStore,
    fragment_policy: FragmentPolicy,
    expiry: ExpirySchedule,
    pub callbacks: C,
}

impl<C: Callbacks> Client<C> {
    /// Build a new `Client`, generating (or loading, via
    /// `Callbacks::load_client_profile`) its long-term identity and
    /// Client Profile. Fails if `callbacks` doesn't satisfy the narrow
    /// required subset, though in Rust that's enforced at
    /// the type level already — `ensure_needed_exist` just names it.
    pub fn new(id: ClientId, mut callbacks: C) -> Result<Self, ClientError> {
        if !ensure_needed_exist(&callbacks) {
            return Err(ClientError::InvalidParameter(
                "callbacks missing a required method".into(),
            ));
        }
        let policy = callbacks.define_policy();
        let instance_tag = callbacks.create_instag().max(2);
        let identity = ClientIdentity::generate(instance_tag);
        let profile = match callbacks.load_client_profile(&id.account) {
            Some(p) => p,
            None => {
                let fresh = identity.build_client_profile(policy.client_profile_validity);
                callbacks.store_client_profile(&id.account, &fresh);
                fresh
            }
        };
        Ok(Self {
            id,
            identity,
            policy,
            profile,
            prekeys: PrekeyMessagePool::new(),
            conversations: HashMap::new(),
            fingerprints: FingerprintStore::new(),
            fragment_policy: FragmentPolicy::default(),
            expiry: ExpirySchedule::new(std::time::Duration::from_secs(600)),
            callbacks,
        })
    }

    /// Override the outgoing-fragmentation frame-size limit (`client.h`'s
    /// `otrng_client_set_padding`-style runtime setters).
    pub fn set_fragment_policy(&mut self, policy: FragmentPolicy) {
        self.fragment_policy = policy;
    }

    pub fn instance_tag(&self) -> u32 {
        self.identity.instance_tag
    }

    /// Override the instance tag generated at construction time, e.g.
    /// to restore one a host persisted from a previous run
    /// (`otrng_client_add_instance_tag`). Rejected once any conversation
    /// exists, since every in-flight DAKE and ratchet is keyed to the
    /// instance tag it started with.
    pub fn add_instance_tag(&mut self, instag: u32) -> Result<(), ClientError> {
        if instag < 2 {
            return Err(ClientError::InvalidParameter(
                "instance tags 0 and 1 are reserved".into(),
            ));
        }
        if !self.conversations.is_empty() {
            return Err(ClientError::PolicyViolation(
                "cannot change instance tag once a conversation has started".into(),
            ));
        }
        self.identity.instance_tag = instag;
        Ok(())
    }

    pub fn client_profile(&self) -> &ClientProfile {
        &self.profile
    }

    fn conversation_mut(&mut self, recipient: &str) -> &mut Conversation {
        self.conversations
            .entry(recipient.to_string())
            .or_insert_with(|| Conversation::new(recipient, self.identity.instance_tag))
    }

    pub fn get_conversation(&self, recipient: &str) -> Option<&Conversation> {
        self.conversations.get(recipient)
    }

    /// `?OTRv43?` query token plus this client's human tagline, used to
    /// invite a peer into an interactive DAKE.
    pub fn query_message(&self, _recipient: &str) -> String {
        wire::query_message(QUERY_TAGLINE)
    }

    /// Publish fresh Prekey Messages alongside the client's Prekey
    /// Profile, forming the Prekey Ensemble a peer consumes for a
    /// non-interactive DAKE.
    pub fn build_prekey_messages(&mut self, count: u8) -> Vec<PrekeyMessage> {
        self.prekeys.generate(count, self.identity.instance_tag)
    }

    pub fn build_prekey_profile(&self, shared_prekey: &otrng_crypto::EcdhPublic) -> otrng_proto::PrekeyProfile {
        self.identity.build_prekey_profile(shared_prekey, self.policy.prekey_profile_validity)
    }

    /// Encrypt and send `message` to `recipient`, fragmenting and
    /// injecting via `Callbacks::inject_message`. If no encrypted
    /// session exists yet: under `require_encryption` the message is
    /// withheld and `MsgEvent::EncryptionRequired` is raised; otherwise
    /// it goes out in the clear (optionally whitespace-tagged to invite
    /// a DAKE).
    pub fn send(&mut self, recipient: &str, message: &str) -> Result<(), ClientError> {
        let our_tag = self.identity.instance_tag;
        let padding = self.policy.padding;
        let send_tag = self.policy.send_whitespace_tag;
        let conv = self.conversation_mut(recipient);
        if !conv.is_encrypted() {
            if self.policy.require_encryption {
                tracing::warn!(recipient = %recipient, "withholding send, no encrypted session and encryption required");
                self.callbacks.handle_event(MsgEvent::EncryptionRequired);
                return Ok(());
            }
            let out = if send_tag { wire::with_whitespace_tag(message) } else { message.to_string() };
            self.callbacks.inject_message(recipient, &out);
            return Ok(());
        }
        let wire_msg = conv.send(message, padding)?;
        let their_tag = conv.their_instance_tag.unwrap_or(0);
        for frame in self.fragment_policy.maybe_fragment(&wire_msg, our_tag, their_tag)? {
            self.callbacks.inject_message(recipient, &frame);
        }
        Ok(())
    }

    /// Feed one inbound wire message from `recipient` through its
    /// conversation, injecting any replies and surfacing side effects
    /// (fingerprint changes, SMP events, secure/insecure transitions)
    /// through `Callbacks`. Returns the plaintext to display, if any.
    pub fn receive(&mut self, recipient: &str, raw: &str) -> Result<Option<String>, ClientError> {
        let shared_session_state = self.callbacks.get_shared_session_state(recipient);
        let grace = self.policy.profile_extra_valid_time;
        let max_stored_msg_keys = self.policy.max_stored_msg_keys;
        let identity = &self.identity;
        let profile = &self.profile;
        let prekeys = &mut self.prekeys;

        let mut take_prekey = move |id: u32| -> Option<(EcdhKeyPair, DhKeyPair)> { prekeys.take(id) };

        let conv = self.conversations.entry(recipient.to_string()).or_insert_with(|| {
            Conversation::new(recipient, identity.instance_tag)
        });

        let outcome: Outcome = match conv.receive(
            raw,
            identity,
            profile,
            &shared_session_state,
            grace,
            max_stored_msg_keys,
            None,
            Some(&mut take_prekey),
        ) {
            Ok(o) => o,
            Err(e) if e.is_silent() => {
                tracing::warn!(recipient = %recipient, error = %e, "dropping unreadable message");
                self.callbacks.handle_event(MsgEvent::MsgUnreadable);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let display = self.apply_outcome(recipient, outcome)?;
        self.maybe_heartbeat(recipient)?;
        Ok(display)
    }

    /// Spontaneously emits an empty encrypted data message if
    /// `Callbacks::should_heartbeat` says the conversation has gone quiet
    /// too long. Called on every `receive`.
    fn maybe_heartbeat(&mut self, recipient: &str) -> Result<(), ClientError> {
        let due = match self.conversations.get(recipient) {
            Some(conv) if conv.is_encrypted() => self.callbacks.should_heartbeat(conv.last_sent),
            _ => false,
        };
        if !due {
            return Ok(());
        }
        let our_tag = self.identity.instance_tag;
        let padding = self.policy.padding;
        let conv = self.conversation_mut(recipient);
        let wire_msg = conv.send("", padding)?;
        let their_tag = conv.their_instance_tag.unwrap_or(0);
        for frame in self.fragment_policy.maybe_fragment(&wire_msg, our_tag, their_tag)? {
            self.callbacks.inject_message(recipient, &frame);
        }
        Ok(())
    }

    fn apply_outcome(&mut self, recipient: &str, outcome: Outcome) -> Result<Option<String>, ClientError> {
        for reply in &outcome.replies {
            self.callbacks.inject_message(recipient, reply);
        }
        if outcome.gone_secure {
            self.callbacks.gone_secure(recipient);
        }
        if outcome.gone_insecure {
            self.callbacks.gone_insecure(recipient);
        }
        for (event, progress_hint) in &outcome.smp_events {
            let percent = match event {
                crate::callbacks::SmpEvent::Started => 0,
                crate::callbacks::SmpEvent::InProgress => 50,
                crate::callbacks::SmpEvent::Succeeded | crate::callbacks::SmpEvent::Failed | crate::callbacks::SmpEvent::Aborted => 100,
            };
            self.callbacks.smp_update(*event, percent, recipient);
            if let Some(question) = progress_hint {
                self.callbacks.smp_ask_for_answer(question, recipient);
            } else if matches!(event, crate::callbacks::SmpEvent::Started) {
                self.callbacks.smp_ask_for_secret(recipient);
            }
        }
        Ok(outcome.display)
    }

    pub fn smp_start(&mut self, recipient: &str, secret: &[u8], question: Option<String>) -> Result<(), ClientError> {
        let conv = self.conversation_mut(recipient);
        let wire_msg = conv.smp_start(secret, question)?;
        self.callbacks.inject_message(recipient, &wire_msg);
        Ok(())
    }

    pub fn smp_respond(&mut self, recipient: &str, secret: &[u8]) -> Result<(), ClientError> {
        let conv = self.conversation_mut(recipient);
        let wire_msg = conv.smp_respond(secret)?;
        self.callbacks.inject_message(recipient, &wire_msg);
        Ok(())
    }

    pub fn smp_abort(&mut self, recipient: &str) -> Result<(), ClientError> {
        let conv = self.conversation_mut(recipient);
        let wire_msg = conv.smp_abort()?;
        self.callbacks.inject_message(recipient, &wire_msg);
        Ok(())
    }

    pub fn disconnect(&mut self, recipient: &str) -> Result<(), ClientError> {
        let conv = self.conversation_mut(recipient);
        let wire_msg = conv.disconnect()?;
        self.callbacks.inject_message(recipient, &wire_msg);
        self.callbacks.gone_insecure(recipient);
        Ok(())
    }

    /// Sweep every conversation's in-progress fragment contexts,
    /// discarding ones older than `Policy::fragments_expiration`, but
    /// only if the schedule's interval has actually elapsed — cheap to
    /// call from a host's timer on every tick.
    pub fn expire_fragments(&mut self) {
        if !self.expiry.due(chrono::Utc::now()) {
            return;
        }
        let max_age = self.policy.fragments_expiration;
        for conv in self.conversations.values_mut() {
            conv.expire_fragments(max_age);
        }
    }

    pub fn get_our_fingerprint(&self) -> String {
        self.identity.signing_key.public().fingerprint()
    }

    /// Observe `recipient`'s long-term key from a freshly verified
    /// Client Profile, surfacing a key change to the host via
    /// `Callbacks::fingerprint_seen`.
    pub fn note_peer_profile(&mut self, recipient: &str, profile: &ClientProfile) {
        match self.fingerprints.observe(recipient, profile.public_key) {
            crate::fingerprint::Observation::Changed => {
                let fp = profile.public_key.fingerprint();
                self.callbacks.fingerprint_seen(&fp, recipient);
            }
            crate::fingerprint::Observation::New => {
                let fp = profile.public_key.fingerprint();
                self.callbacks.fingerprint_seen(&fp, recipient);
            }
            crate::fingerprint::Observation::Unchanged => {}
        }
    }

    pub fn build_prekey_ensemble(&self, prekey_message: PrekeyMessage, prekey_profile: otrng_proto::PrekeyProfile) -> PrekeyEnsemble {
        PrekeyEnsemble {
            client_profile: self.profile.clone(),
            prekey_profile,
            prekey_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;

    struct TestCallbacks {
        injected: Vec<(String, String)>,
    }

    impl Callbacks for TestCallbacks {
        fn inject_message(&mut self, recipient: &str, message: &str) {
            self.injected.push((recipient.to_string(), message.to_string()));
        }
        fn get_shared_session_state(&self, _recipient: &str) -> String {
            "test-session".into()
        }
        fn session_expiration_time_for(&self, _recipient: &str) -> chrono::Duration {
            chrono::Duration::days(7)
        }
        fn define_policy(&self) -> Policy {
            Policy::default()
        }
    }

    fn make_client(account: &str) -> Client<TestCallbacks> {
        Client::new(
            ClientId { protocol: "otrng-test".into(), account: account.into() },
            TestCallbacks { injected: Vec::new() },
        )
        .unwrap()
    }

    #[test]
    fn interactive_handshake_and_message_round_trip_between_two_clients() {
        let mut alice = make_client("alice");
        let mut bob = make_client("bob");

        let query = alice.query_message("bob");
        alice.callbacks.injected.clear();
        bob.receive("alice", &query).unwrap();
        assert_eq!(bob.callbacks.injected.len(), 1);

        let (_, identity_wire) = bob.callbacks.injected[0].clone();
        alice.receive("bob", &identity_wire).unwrap();
        assert_eq!(alice.callbacks.injected.len(), 1);

        let (_, auth_r_wire) = alice.callbacks.injected[0].clone();
        bob.receive("alice", &auth_r_wire).unwrap();
        assert!(bob.get_conversation("alice").unwrap().is_encrypted());

        let (_, auth_i_wire) = bob.callbacks.injected[1].clone();
        alice.receive("bob", &auth_i_wire).unwrap();
        assert!(alice.get_conversation("bob").unwrap().is_encrypted());

        alice.send("bob", "hello from alice").unwrap();
        let (_, data_wire) = alice.callbacks.injected.last().unwrap().clone();
        let received = bob.receive("alice", &data_wire).unwrap();
        assert_eq!(received.as_deref(), Some("hello from alice"));
    }

    /// A data message too large for one wire frame is split into
    /// `?OTR|...` fragments on send and reassembled transparently on
    /// receive.
    #[test]
    fn large_message_is_fragmented_and_reassembles_on_receive() {
        let mut alice = make_client("alice");
        let mut bob = make_client("bob");
        alice.set_fragment_policy(FragmentPolicy { max_size: 200 });

        let query = alice.query_message("bob");
        bob.receive("alice", &query).unwrap();
        let (_, identity_wire) = bob.callbacks.injected[0].clone();
        alice.receive("bob", &identity_wire).unwrap();
        let (_, auth_r_wire) = alice.callbacks.injected.last().unwrap().clone();
        bob.receive("alice", &auth_r_wire).unwrap();
        let (_, auth_i_wire) = bob.callbacks.injected.last().unwrap().clone();
        alice.receive("bob", &auth_i_wire).unwrap();
        assert!(alice.get_conversation("bob").unwrap().is_encrypted());

        alice.callbacks.injected.clear();
        let long_message = "this is a long message that will not fit in a single 200 byte wire frame so it has to be fragmented ".repeat(4);
        alice.send("bob", &long_message).unwrap();
        assert!(alice.callbacks.injected.len() > 1);

        let mut received = None;
        for (_, frame) in &alice.callbacks.injected {
            if let Some(text) = bob.receive("alice", frame).unwrap() {
                received = Some(text);
            }
        }
        assert_eq!(received.as_deref(), Some(long_message.as_str()));
    }

    #[test]
    fn add_instance_tag_is_rejected_once_a_conversation_exists() {
        let mut alice = make_client("alice");
        alice.send("bob", "hi").unwrap();
        assert!(alice.add_instance_tag(0x1234_5678).is_err());
    }

    #[test]
    fn add_instance_tag_overrides_a_fresh_client() {
        let mut alice = make_client("alice");
        alice.add_instance_tag(0x1234_5678).unwrap();
        assert_eq!(alice.instance_tag(), 0x1234_5678);
    }

    #[test]
    fn plaintext_is_sent_when_not_yet_encrypted_and_encryption_not_required() {
        let mut alice = make_client("alice");
        alice.send("bob", "hi").unwrap();
        assert_eq!(alice.callbacks.injected.last().unwrap().1, "hi");
    }

    #[test]
    fn send_is_withheld_when_encryption_required_and_no_session_exists() {
        struct RequireEncryption(TestCallbacks);
        impl Callbacks for RequireEncryption {
            fn inject_message(&mut self, recipient: &str, message: &str) {
                self.0.inject_message(recipient, message);
            }
            fn get_shared_session_state(&self, recipient: &str) -> String {
                self.0.get_shared_session_state(recipient)
            }
            fn session_expiration_time_for(&self, recipient: &str) -> chrono::Duration {
                self.0.session_expiration_time_for(recipient)
            }
            fn define_policy(&self) -> Policy {
                Policy { require_encryption: true, ..Policy::default() }
            }
        }
        let mut client = Client::new(
            ClientId { protocol: "otrng-test".into(), account: "alice".into() },
            RequireEncryption(TestCallbacks { injected: Vec::new() }),
        )
        .unwrap();
        client.send("bob", "should not go out").unwrap();
        assert!(client.callbacks.0.injected.is_empty());
    }
}
