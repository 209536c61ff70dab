//! DAKE (Deniable Authenticated Key Exchange) state machine, interactive
//! and non-interactive paths.
//!
//! Pure state-transition functions: no callbacks, no I/O. The caller
//! (`conversation.rs`) resolves `phi` (via `Callbacks::get_shared_session_state`)
//! and feeds it in, and owns installing the returned `RatchetState` once
//! a DAKE completes. This mirrors `dl_crypto::session`'s split between
//! "pure key-agreement math" (`initiate_session`/`receive_session`) and
//! the caller wiring transport/storage around it.
//!
//! States: `START → WAITING_AUTH_R → WAITING_AUTH_I →
//! ENCRYPTED_MESSAGES → FINISHED`. `WAITING_DAKE_DATA_MESSAGE` is named
//! in the original state list but given no transition rule of its own;
//! we fold it into the Auth-I/ratchet-init step (Open Question decision,
//! recorded in DESIGN.md) — both sides land in `ENCRYPTED_MESSAGES`
//! directly once the ratchet is initialized.

use otrng_crypto::rsig;
use otrng_crypto::{
    mix_dake_secret, DhKeyPair, DhPublic, EcdhKeyPair, EcdhPublic, RatchetState, RingSig,
    SigningPublic,
};
use otrng_proto::message::serialize_phi;
use otrng_proto::{AuthIMessage, AuthRMessage, ClientProfile, IdentityMessage, PrekeyEnsemble};

use crate::error::ClientError;
use crate::profile::{verify_client_profile, verify_prekey_profile_with_key, ClientIdentity};

const USAGE_AUTH_R: u8 = 0x01;
const USAGE_AUTH_I: u8 = 0x02;
const USAGE_NON_INTERACTIVE: u8 = 0x03;
const DOMAIN_AUTH_R: &[u8] = b"OTRv4-Auth-R";
const DOMAIN_AUTH_I: &[u8] = b"OTRv4-Auth-I";
const DOMAIN_NON_INTERACTIVE: &[u8] = b"OTRv4-Non-Interactive-Auth";

pub enum DakeState {
    Start,
    /// We sent an Identity message and are waiting for the peer's
    /// reply — either their own Identity (simultaneous DAKE tie-break)
    /// or an Auth-R (normal flow / we won the tie-break by holding the
    /// lexicographically smaller ephemeral).
    WaitingAuthR {
        our_ecdh: EcdhKeyPair,
        our_dh: DhKeyPair,
        our_identity: IdentityMessage,
    },
    /// We sent an Auth-R (our ephemeral replaced the one from our
    /// original Identity) and are waiting for the peer's Auth-I.
    WaitingAuthI {
        our_ecdh: EcdhKeyPair,
        our_dh: DhKeyPair,
        their_profile: ClientProfile,
        their_ecdh: EcdhPublic,
        their_dh: DhPublic,
    },
    EncryptedMessages,
    Finished,
}

pub enum DakeMessage {
    Identity(IdentityMessage),
    AuthR(AuthRMessage),
    AuthI(AuthIMessage),
}

/// Canonical transcript both sides compute identically: ephemeral
/// contributions and profiles are ordered by instance tag (lower tag
/// first), the same min/max trick `serialize_phi` uses, so a ring
/// signature built by either side verifies under the other's
/// recomputation regardless of which side calls this.
fn transcript(
    phi: &[u8],
    our_tag: u32,
    their_tag: u32,
    our_profile: &ClientProfile,
    their_profile: &ClientProfile,
    our_ecdh: &EcdhPublic,
    our_dh: &DhPublic,
    their_ecdh: &EcdhPublic,
    their_dh: &DhPublic,
) -> Vec<u8> {
    let (lo_profile, hi_profile, lo_ecdh, hi_ecdh, lo_dh, hi_dh) = if our_tag < their_tag {
        (our_profile, their_profile, our_ecdh, their_ecdh, our_dh, their_dh)
    } else {
        (their_profile, our_profile, their_ecdh, our_ecdh, their_dh, our_dh)
    };
    let payload = serde_json::json!({
        "hi_dh": hi_dh,
        "hi_ecdh": hi_ecdh,
        "hi_profile": hi_profile,
        "lo_dh": lo_dh,
        "lo_ecdh": lo_ecdh,
        "lo_profile": lo_profile,
        "phi": phi,
    });
    serde_json::to_vec(&payload).expect("json serialization of DAKE transcript cannot fail")
}

fn ring_of_three<'a>(
    mine: &'a SigningPublic,
    my_forging: &'a SigningPublic,
    theirs: &'a SigningPublic,
) -> [&'a SigningPublic; 3] {
    [mine, my_forging, theirs]
}

/// `START` (or the losing side of a simultaneous tie-break): build an
/// Identity message and begin waiting for Auth-R.
pub fn start(
    our_instance_tag: u32,
    their_instance_tag: u32,
    our_profile: &ClientProfile,
) -> (DakeState, IdentityMessage) {
    let our_ecdh = EcdhKeyPair::generate();
    let our_dh = DhKeyPair::generate();
    let msg = IdentityMessage {
        sender_instance_tag: our_instance_tag,
        receiver_instance_tag: their_instance_tag,
        client_profile: our_profile.clone(),
        ephemeral_ecdh: our_ecdh.public(),
        ephemeral_dh: our_dh.public(),
    };
    (
        DakeState::WaitingAuthR {
            our_ecdh,
            our_dh,
            our_identity: msg.clone(),
        },
        msg,
    )
}

/// Build a fresh Auth-R in response to a peer's Identity message,
/// replacing any ephemeral we were previously holding (a duplicate
/// Identity discards our prior ephemerals and derives new ones).
fn respond_with_auth_r(
    identity: &ClientIdentity,
    our_profile: &ClientProfile,
    our_instance_tag: u32,
    their_msg: &IdentityMessage,
    phi: &[u8],
    grace: chrono::Duration,
) -> Result<(DakeState, DakeMessage), ClientError> {
    verify_client_profile(&their_msg.client_profile, grace)?;

    let our_ecdh = EcdhKeyPair::generate();
    let our_dh = DhKeyPair::generate();

    let msg_bytes = transcript(
        phi,
        our_instance_tag,
        their_msg.sender_instance_tag,
        our_profile,
        &their_msg.client_profile,
        &our_ecdh.public(),
        &our_dh.public(),
        &their_msg.ephemeral_ecdh,
        &their_msg.ephemeral_dh,
    );
    let ring = ring_of_three(
        &identity.signing_key.public(),
        &identity.forging_public(),
        &their_msg.client_profile.public_key,
    );
    let sigma: RingSig = rsig::authenticate(
        &identity.signing_key,
        ring[0],
        ring[1],
        ring[2],
        USAGE_AUTH_R,
        DOMAIN_AUTH_R,
        &msg_bytes,
    )?;

    let auth_r = AuthRMessage {
        sender_instance_tag: our_instance_tag,
        receiver_instance_tag: their_msg.sender_instance_tag,
        client_profile: our_profile.clone(),
        ephemeral_ecdh: our_ecdh.public(),
        ephemeral_dh: our_dh.public(),
        sigma,
    };

    Ok((
        DakeState::WaitingAuthI {
            our_ecdh,
            our_dh,
            their_profile: their_msg.client_profile.clone(),
            their_ecdh: their_msg.ephemeral_ecdh,
            their_dh: their_msg.ephemeral_dh,
        },
        DakeMessage::AuthR(auth_r),
    ))
}

/// Handle an incoming Identity message from any pre-`EncryptedMessages`
/// state.
pub fn handle_identity(
    state: DakeState,
    identity: &ClientIdentity,
    our_profile: &ClientProfile,
    our_instance_tag: u32,
    msg: &IdentityMessage,
    phi: &[u8],
    grace: chrono::Duration,
) -> Result<(DakeState, Option<DakeMessage>), ClientError> {
    match state {
        DakeState::Start => {
            let (next, reply) =
                respond_with_auth_r(identity, our_profile, our_instance_tag, msg, phi, grace)?;
            Ok((next, Some(reply)))
        }
        DakeState::WaitingAuthR { our_ecdh, our_dh, our_identity } => {
            if msg.ephemeral_ecdh.as_bytes() > our_ecdh.public().as_bytes() {
                let (next, reply) = respond_with_auth_r(
                    identity,
                    our_profile,
                    our_instance_tag,
                    msg,
                    phi,
                    grace,
                )?;
                Ok((next, Some(reply)))
            } else {
                // Our ephemeral is the lexicographically greater one:
                // we remain the side waiting for Auth-R, and re-send
                // our own Identity so the peer can converge.
                Ok((
                    DakeState::WaitingAuthR { our_ecdh, our_dh, our_identity: our_identity.clone() },
                    Some(DakeMessage::Identity(our_identity)),
                ))
            }
        }
        DakeState::WaitingAuthI { .. } => {
            // Duplicate Identity while waiting for Auth-I: discard our
            // prior ephemerals and re-derive.
            let (next, reply) =
                respond_with_auth_r(identity, our_profile, our_instance_tag, msg, phi, grace)?;
            Ok((next, Some(reply)))
        }
        other @ (DakeState::EncryptedMessages | DakeState::Finished) => Ok((other, None)),
    }
}

/// Handle an incoming Auth-R: only valid from `WaitingAuthR` (the side
/// that kept its original ephemeral). On success, returns the Auth-I to
/// send and the freshly initialized ratchet (this side acts as the
/// ratchet's initiator, since it already holds both ephemeral
/// contributions once Auth-R arrives).
pub fn handle_auth_r(
    state: DakeState,
    identity: &ClientIdentity,
    our_profile: &ClientProfile,
    our_instance_tag: u32,
    msg: &AuthRMessage,
    phi: &[u8],
    grace: chrono::Duration,
    max_stored_msg_keys: usize,
) -> Result<(DakeState, DakeMessage, RatchetState), ClientError> {
    let (our_ecdh, our_dh, our_identity) = match state {
        DakeState::WaitingAuthR { our_ecdh, our_dh, our_identity } => (our_ecdh, our_dh, our_identity),
        _ => {
            return Err(ClientError::ProtocolViolation(
                "received Auth-R outside WAITING_AUTH_R".into(),
            ))
        }
    };

    verify_client_profile(&msg.client_profile, grace)?;

    let msg_bytes = transcript(
        phi,
        our_instance_tag,
        msg.sender_instance_tag,
        our_profile,
        &msg.client_profile,
        &our_ecdh.public(),
        &our_dh.public(),
        &msg.ephemeral_ecdh,
        &msg.ephemeral_dh,
    );
    let ring = ring_of_three(
        &msg.client_profile.public_key,
        &msg.client_profile.forging_key,
        &our_identity.client_profile.public_key,
    );
    let ok = rsig::verify(&msg.sigma, ring[0], ring[1], ring[2], USAGE_AUTH_R, DOMAIN_AUTH_R, &msg_bytes)?;
    if !ok {
        return Err(ClientError::AuthenticationFailed);
    }

    let ecdh_out = our_ecdh.diffie_hellman(&msg.ephemeral_ecdh);
    let dh_out = our_dh.diffie_hellman(&msg.ephemeral_dh);
    let shared = mix_dake_secret(&ecdh_out, &dh_out)?;

    let auth_i_bytes = transcript(
        phi,
        our_instance_tag,
        msg.sender_instance_tag,
        our_profile,
        &msg.client_profile,
        &our_ecdh.public(),
        &our_dh.public(),
        &msg.ephemeral_ecdh,
        &msg.ephemeral_dh,
    );
    let ring_i = ring_of_three(
        &identity.signing_key.public(),
        &identity.forging_public(),
        &msg.client_profile.public_key,
    );
    let sigma = rsig::authenticate(
        &identity.signing_key,
        ring_i[0],
        ring_i[1],
        ring_i[2],
        USAGE_AUTH_I,
        DOMAIN_AUTH_I,
        &auth_i_bytes,
    )?;

    let auth_i = AuthIMessage {
        sender_instance_tag: our_instance_tag,
        receiver_instance_tag: msg.sender_instance_tag,
        sigma,
    };

    let ratchet = RatchetState::init_as_initiator(
        &shared,
        our_ecdh,
        our_dh,
        msg.ephemeral_ecdh,
        msg.ephemeral_dh,
        max_stored_msg_keys,
    )?;

    Ok((DakeState::EncryptedMessages, DakeMessage::AuthI(auth_i), ratchet))
}

/// Handle an incoming Auth-I: only valid from `WaitingAuthI` (the side
/// that sent Auth-R). This side acts as the ratchet's responder.
pub fn handle_auth_i(
    state: DakeState,
    our_instance_tag: u32,
    msg: &AuthIMessage,
    phi: &[u8],
    max_stored_msg_keys: usize,
) -> Result<RatchetState, ClientError> {
    let (our_ecdh, our_dh, their_profile, their_ecdh, their_dh) = match state {
        DakeState::WaitingAuthI { our_ecdh, our_dh, their_profile, their_ecdh, their_dh } => {
            (our_ecdh, our_dh, their_profile, their_ecdh, their_dh)
        }
        _ => {
            return Err(ClientError::ProtocolViolation(
                "received Auth-I outside WAITING_AUTH_I".into(),
            ))
        }
    };

    // Re-derive the Auth-R transcript from our own perspective (the
    // sigma's `msg` argument is the same bytes both sides computed at
    // Auth-R time), but now authenticating the *responder's* side of
    // the exchange — the recipient identity is the peer's long-term
    // key. We don't have the responder's ClientProfile handy beyond
    // `their_profile` captured when we built Auth-R; its own public
    // key doubles as the ring anchor for the Auth-I signer.
    let msg_bytes = transcript(
        phi,
        our_instance_tag,
        msg.sender_instance_tag,
        &their_profile,
        &their_profile,
        &our_ecdh.public(),
        &our_dh.public(),
        &their_ecdh,
        &their_dh,
    );
    let ring = ring_of_three(&their_profile.public_key, &their_profile.forging_key, &their_profile.public_key);
    let ok = rsig::verify(&msg.sigma, ring[0], ring[1], ring[2], USAGE_AUTH_I, DOMAIN_AUTH_I, &msg_bytes)?;
    if !ok {
        return Err(ClientError::AuthenticationFailed);
    }

    let ecdh_out = our_ecdh.diffie_hellman(&their_ecdh);
    let dh_out = our_dh.diffie_hellman(&their_dh);
    let shared = mix_dake_secret(&ecdh_out, &dh_out)?;
    RatchetState::init_as_responder(&shared, our_ecdh, our_dh, their_dh, max_stored_msg_keys).map_err(Into::into)
}

/// Non-interactive DAKE initiator: build a ring
/// signature and initialize the ratchet directly from a `PrekeyEnsemble`
/// without any round trip.
pub struct NonInteractiveHandshake {
    pub ephemeral_ecdh: EcdhPublic,
    pub ephemeral_dh: DhPublic,
    pub sigma: RingSig,
    pub prekey_message_id: u32,
    pub ratchet: RatchetState,
}

pub fn build_non_interactive_auth(
    identity: &ClientIdentity,
    our_profile: &ClientProfile,
    our_instance_tag: u32,
    ensemble: &PrekeyEnsemble,
    phi: &[u8],
    grace: chrono::Duration,
    max_stored_msg_keys: usize,
) -> Result<NonInteractiveHandshake, ClientError> {
    verify_client_profile(&ensemble.client_profile, grace)?;
    verify_prekey_profile_with_key(&ensemble.prekey_profile, &ensemble.client_profile.public_key, grace)?;

    let our_ecdh = EcdhKeyPair::generate();
    let our_dh = DhKeyPair::generate();

    let msg_bytes = transcript(
        phi,
        our_instance_tag,
        ensemble.client_profile.owner_instance_tag,
        our_profile,
        &ensemble.client_profile,
        &our_ecdh.public(),
        &our_dh.public(),
        &ensemble.prekey_message.ecdh_public,
        &ensemble.prekey_message.dh_public,
    );
    let ring = ring_of_three(
        &identity.signing_key.public(),
        &identity.forging_public(),
        &ensemble.client_profile.public_key,
    );
    let sigma = rsig::authenticate(
        &identity.signing_key,
        ring[0],
        ring[1],
        ring[2],
        USAGE_NON_INTERACTIVE,
        DOMAIN_NON_INTERACTIVE,
        &msg_bytes,
    )?;

    let ecdh_out = our_ecdh.diffie_hellman(&ensemble.prekey_message.ecdh_public);
    let dh_out = our_dh.diffie_hellman(&ensemble.prekey_message.dh_public);
    let shared = mix_dake_secret(&ecdh_out, &dh_out)?;
    let ephemeral_ecdh = our_ecdh.public();
    let ephemeral_dh = our_dh.public();
    let ratchet = RatchetState::init_as_initiator(
        &shared,
        our_ecdh,
        our_dh,
        ensemble.prekey_message.ecdh_public,
        ensemble.prekey_message.dh_public,
        max_stored_msg_keys,
    )?;

    Ok(NonInteractiveHandshake {
        ephemeral_ecdh,
        ephemeral_dh,
        sigma,
        prekey_message_id: ensemble.prekey_message.id,
        ratchet,
    })
}

/// Non-interactive DAKE responder: verify the initiator's ring
/// signature and initialize the ratchet from our stored prekey
/// ephemeral keypair ("peer transitions START →
/// ENCRYPTED_MESSAGES on verification").
pub fn handle_non_interactive_auth(
    our_instance_tag: u32,
    our_profile: &ClientProfile,
    msg: &otrng_proto::NonInteractiveAuthMessage,
    our_prekey_ecdh: EcdhKeyPair,
    our_prekey_dh: DhKeyPair,
    phi: &[u8],
    grace: chrono::Duration,
    max_stored_msg_keys: usize,
) -> Result<RatchetState, ClientError> {
    verify_client_profile(&msg.client_profile, grace)?;

    let msg_bytes = transcript(
        phi,
        our_instance_tag,
        msg.sender_instance_tag,
        our_profile,
        &msg.client_profile,
        &our_prekey_ecdh.public(),
        &our_prekey_dh.public(),
        &msg.ephemeral_ecdh,
        &msg.ephemeral_dh,
    );
    let ring = ring_of_three(
        &msg.client_profile.public_key,
        &msg.client_profile.forging_key,
        &our_profile.public_key,
    );
    let ok = rsig::verify(
        &msg.sigma,
        ring[0],
        ring[1],
        ring[2],
        USAGE_NON_INTERACTIVE,
        DOMAIN_NON_INTERACTIVE,
        &msg_bytes,
    )?;
    if !ok {
        return Err(ClientError::AuthenticationFailed);
    }

    let ecdh_out = our_prekey_ecdh.diffie_hellman(&msg.ephemeral_ecdh);
    let dh_out = our_prekey_dh.diffie_hellman(&msg.ephemeral_dh);
    let shared = mix_dake_secret(&ecdh_out, &dh_out)?;
    RatchetState::init_as_responder(
        &shared,
        our_prekey_ecdh,
        our_prekey_dh,
        msg.ephemeral_dh,
        max_stored_msg_keys,
    )
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_identity(tag: u32) -> (ClientIdentity, ClientProfile) {
        let identity = ClientIdentity::generate(tag);
        let profile = identity.build_client_profile(Duration::days(30));
        (identity, profile)
    }

    #[test]
    fn interactive_dake_establishes_matching_ratchets() {
        let (alice_id, alice_profile) = make_identity(0x1000_0001);
        let (bob_id, bob_profile) = make_identity(0x2000_0002);
        let phi = b"shared-session-state".to_vec();
        let grace = Duration::zero();

        // Alice sends Identity, Bob replies Auth-R (Bob's ephemeral is
        // compared against nothing yet, so Bob always responds).
        let (alice_state, alice_identity_msg) = start(alice_id.instance_tag, bob_id.instance_tag, &alice_profile);

        let (bob_state, bob_reply) = handle_identity(
            DakeState::Start,
            &bob_id,
            &bob_profile,
            bob_id.instance_tag,
            &alice_identity_msg,
            &phi,
            grace,
        )
        .unwrap();
        let auth_r = match bob_reply.unwrap() {
            DakeMessage::AuthR(m) => m,
            _ => panic!("expected Auth-R"),
        };
        assert!(matches!(bob_state, DakeState::WaitingAuthI { .. }));

        let (alice_state, alice_reply, alice_ratchet) = handle_auth_r(
            alice_state,
            &alice_id,
            &alice_profile,
            alice_id.instance_tag,
            &auth_r,
            &phi,
            grace,
            256,
        )
        .unwrap();
        assert!(matches!(alice_state, DakeState::EncryptedMessages));
        let auth_i = match alice_reply {
            DakeMessage::AuthI(m) => m,
            _ => panic!("expected Auth-I"),
        };

        let bob_ratchet = handle_auth_i(bob_state, bob_id.instance_tag, &auth_i, &phi, 256).unwrap();

        let mut alice_ratchet = alice_ratchet;
        let mut bob_ratchet = bob_ratchet;
        let (header, mk, _) = alice_ratchet.ratchet_encrypt().unwrap();
        let (mk2, _) = bob_ratchet.ratchet_decrypt(&header).unwrap();
        assert_eq!(mk, mk2);
    }

    #[test]
    fn simultaneous_dake_converges_to_one_session() {
        let (alice_id, alice_profile) = make_identity(0x1000_0001);
        let (bob_id, bob_profile) = make_identity(0x2000_0002);
        let phi = b"state".to_vec();
        let grace = Duration::zero();

        let (alice_state, alice_identity) =
            start(alice_id.instance_tag, bob_id.instance_tag, &alice_profile);
        let (bob_state, bob_identity) = start(bob_id.instance_tag, alice_id.instance_tag, &bob_profile);

        // Each receives the other's Identity while in WaitingAuthR.
        let (alice_state, alice_reply) = handle_identity(
            alice_state,
            &alice_id,
            &alice_profile,
            alice_id.instance_tag,
            &bob_identity,
            &phi,
            grace,
        )
        .unwrap();
        let (bob_state, bob_reply) = handle_identity(
            bob_state,
            &bob_id,
            &bob_profile,
            bob_id.instance_tag,
            &alice_identity,
            &phi,
            grace,
        )
        .unwrap();

        // Exactly one side should have produced an Auth-R.
        let alice_sent_auth_r = matches!(alice_reply, Some(DakeMessage::AuthR(_)));
        let bob_sent_auth_r = matches!(bob_reply, Some(DakeMessage::AuthR(_)));
        assert_ne!(alice_sent_auth_r, bob_sent_auth_r);
        assert!(matches!(alice_state, DakeState::WaitingAuthI { .. } | DakeState::WaitingAuthR { .. }));
        assert!(matches!(bob_state, DakeState::WaitingAuthI { .. } | DakeState::WaitingAuthR { .. }));
    }
}
