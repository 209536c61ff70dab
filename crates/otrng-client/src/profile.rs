//! Long-term identity, signed Client/Prekey Profiles, and the Prekey
//! Message pool.
//!
//! Grounded in `client.h`'s `client_profile_s`/`otrng_prekey_profile_s`/
//! `otrng_stored_prekeys_s` fields and in `dl_crypto::identity::DeviceCert`'s
//! "canonical JSON payload, sign it, carry the signature alongside" shape
//! (`issue`/`verify`).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand_core::RngCore;

use otrng_crypto::{DhKeyPair, DhPublic, EcdhKeyPair, EcdhPublic, SigningKeyPair, SigningPublic};
use otrng_proto::{ClientProfile, PrekeyMessage, PrekeyProfile};

use crate::error::ClientError;

/// `versions` this build's Client Profile advertises. Value `4` is the
/// only version this engine speaks (OTRv3 is an opaque legacy handoff).
pub const SUPPORTED_VERSIONS: &[u8] = &[4];

/// Long-term keys owned by a `Client` for its lifetime: the
/// signing keypair and the "forging key" — a keypair whose private half
/// is deliberately leaked after use so no transcript can be attributed to
/// its holder (Design Note §9).
pub struct ClientIdentity {
    pub signing_key: SigningKeyPair,
    pub forging_key: SigningKeyPair,
    pub instance_tag: u32,
}

impl ClientIdentity {
    pub fn generate(instance_tag: u32) -> Self {
        Self {
            signing_key: SigningKeyPair::generate(),
            forging_key: SigningKeyPair::generate(),
            instance_tag,
        }
    }

    pub fn forging_public(&self) -> SigningPublic {
        self.forging_key.public()
    }

    /// Canonical payload signed into a Client Profile. Field ordering is
    /// fixed by building a JSON object through `serde_json::json!`, which
    /// (absent the `preserve_order` feature) sorts map keys — the same
    /// technique `DeviceCert::issue`/`verify` use to keep sign/verify
    /// payloads byte-identical.
    fn client_profile_payload(
        owner_instance_tag: u32,
        public_key: &SigningPublic,
        forging_key: &SigningPublic,
        versions: &[u8],
        expiration: &DateTime<Utc>,
    ) -> Vec<u8> {
        let payload = serde_json::json!({
            "expiration": expiration.to_rfc3339(),
            "forging_key": forging_key,
            "owner_instance_tag": owner_instance_tag,
            "public_key": public_key,
            "versions": versions,
        });
        serde_json::to_vec(&payload).expect("json serialization of profile payload cannot fail")
    }

    pub fn build_client_profile(&self, validity: Duration) -> ClientProfile {
        let expiration = Utc::now() + validity;
        let public_key = self.signing_key.public();
        let forging_key = self.forging_public();
        let payload = Self::client_profile_payload(
            self.instance_tag,
            &public_key,
            &forging_key,
            SUPPORTED_VERSIONS,
            &expiration,
        );
        let signature = self.signing_key.sign(&payload);
        ClientProfile {
            owner_instance_tag: self.instance_tag,
            public_key,
            forging_key,
            versions: SUPPORTED_VERSIONS.to_vec(),
            expiration,
            signature,
        }
    }

    fn prekey_profile_payload(
        owner_instance_tag: u32,
        shared_prekey: &EcdhPublic,
        expiration: &DateTime<Utc>,
    ) -> Vec<u8> {
        let payload = serde_json::json!({
            "expiration": expiration.to_rfc3339(),
            "owner_instance_tag": owner_instance_tag,
            "shared_prekey": shared_prekey,
        });
        serde_json::to_vec(&payload).expect("json serialization of profile payload cannot fail")
    }

    pub fn build_prekey_profile(
        &self,
        shared_prekey: &EcdhPublic,
        validity: Duration,
    ) -> PrekeyProfile {
        let expiration = Utc::now() + validity;
        let payload =
            Self::prekey_profile_payload(self.instance_tag, shared_prekey, &expiration);
        let signature = self.signing_key.sign(&payload);
        PrekeyProfile {
            owner_instance_tag: self.instance_tag,
            shared_prekey: *shared_prekey,
            expiration,
            signature,
        }
    }
}

/// Verify a peer's Client Profile: signature under its own embedded
/// public key, and `now < expiration + grace`.
pub fn verify_client_profile(profile: &ClientProfile, grace: Duration) -> Result<(), ClientError> {
    let payload = ClientIdentity::client_profile_payload(
        profile.owner_instance_tag,
        &profile.public_key,
        &profile.forging_key,
        &profile.versions,
        &profile.expiration,
    );
    SigningKeyPair::verify(&profile.public_key, &payload, &profile.signature)?;
    if Utc::now() > profile.expiration + grace {
        return Err(ClientError::Expired("client profile expired".into()));
    }
    Ok(())
}

/// Verify a Prekey Profile against the long-term public key from the
/// owner's Client Profile (a Prekey Profile carries no embedded public
/// key of its own — it is signed by the owning account's Client Profile
/// key instead).
pub fn verify_prekey_profile_with_key(
    profile: &PrekeyProfile,
    owner_public_key: &SigningPublic,
    grace: Duration,
) -> Result<(), ClientError> {
    let payload = ClientIdentity::prekey_profile_payload(
        profile.owner_instance_tag,
        &profile.shared_prekey,
        &profile.expiration,
    );
    SigningKeyPair::verify(owner_public_key, &payload, &profile.signature)?;
    if Utc::now() > profile.expiration + grace {
        return Err(ClientError::Expired("prekey profile expired".into()));
    }
    Ok(())
}

struct StoredPrekey {
    ecdh: EcdhKeyPair,
    dh: DhKeyPair,
}

/// Pool of outstanding Prekey Messages the client has published but not
/// yet seen consumed (ids stay unique across the Client's lifetime).
/// Grounded in `client.h`'s
/// `otrng_stored_prekeys_s` / `store_my_prekey_message` /
/// `delete_my_prekey_message_by_id`.
#[derive(Default)]
pub struct PrekeyMessagePool {
    used_ids: HashSet<u32>,
    stored: HashMap<u32, StoredPrekey>,
}

impl PrekeyMessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&mut self) -> u32 {
        loop {
            let id = OsRng.next_u32();
            if id != 0 && self.used_ids.insert(id) {
                return id;
            }
        }
    }

    /// Build `count` fresh Prekey Messages, retaining the private
    /// ephemeral halves until `take` consumes them.
    pub fn generate(&mut self, count: u8, instance_tag: u32) -> Vec<PrekeyMessage> {
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = self.fresh_id();
            let ecdh = EcdhKeyPair::generate();
            let dh = DhKeyPair::generate();
            out.push(PrekeyMessage {
                id,
                instance_tag,
                ecdh_public: ecdh.public(),
                dh_public: dh.public(),
            });
            self.stored.insert(id, StoredPrekey { ecdh, dh });
        }
        out
    }

    /// Consume the stored ephemeral keypair for `id` (one-shot: stored
    /// by the originator until consumed).
    pub fn take(&mut self, id: u32) -> Option<(EcdhKeyPair, DhKeyPair)> {
        self.stored.remove(&id).map(|s| (s.ecdh, s.dh))
    }

    pub fn outstanding_count(&self) -> usize {
        self.stored.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_profile_roundtrips_verification() {
        let identity = ClientIdentity::generate(0x1000_0001);
        let profile = identity.build_client_profile(Duration::days(30));
        verify_client_profile(&profile, Duration::zero()).unwrap();
    }

    #[test]
    fn tampered_client_profile_fails_verification() {
        let identity = ClientIdentity::generate(0x1000_0001);
        let mut profile = identity.build_client_profile(Duration::days(30));
        profile.owner_instance_tag = profile.owner_instance_tag.wrapping_add(1);
        assert!(verify_client_profile(&profile, Duration::zero()).is_err());
    }

    #[test]
    fn prekey_profile_roundtrips_verification() {
        let identity = ClientIdentity::generate(0x1000_0001);
        let shared = EcdhKeyPair::generate().public();
        let profile = identity.build_prekey_profile(&shared, Duration::days(7));
        verify_prekey_profile_with_key(&profile, &identity.signing_key.public(), Duration::zero())
            .unwrap();
    }

    #[test]
    fn prekey_message_pool_ids_are_unique_and_one_shot() {
        let mut pool = PrekeyMessagePool::new();
        let messages = pool.generate(5, 0x1000_0001);
        let ids: HashSet<u32> = messages.iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 5);
        assert_eq!(pool.outstanding_count(), 5);

        let first_id = messages[0].id;
        assert!(pool.take(first_id).is_some());
        assert!(pool.take(first_id).is_none());
        assert_eq!(pool.outstanding_count(), 4);
    }
}
