//! Per-peer conversation entity: recipient identifier, DAKE state,
//! ratchet state, SMP state, pending fragment reassembly context,
//! last-sent timestamp, their instance tag, our instance tag.
//!
//! Grounded in `dl_crypto::session::Session`'s role as the thing that
//! owns one peer's live cryptographic state, and in `client.h`'s
//! `otrng_conversation_s` for the field list. Dispatch on receive
//! follows a fixed pipeline: fragment reassembly → format
//! discriminator → DAKE or data-message path → (data message) ratchet
//! decrypt → SMP or plaintext payload.

use chrono::{DateTime, Utc};
use serde::Serialize;

use otrng_crypto::{DhKeyPair, EcdhKeyPair, RatchetHeader, RatchetState};
use otrng_proto::fragment::FragmentReassembler;
use otrng_proto::message::{serialize_phi, PROTOCOL_VERSION};
use otrng_proto::tlv::{self, Tlv, TLV_DISCONNECT, TLV_SMP_ABORT, TLV_SMP_MESSAGE_1, TLV_SMP_MESSAGE_1Q, TLV_SMP_MESSAGE_2, TLV_SMP_MESSAGE_3, TLV_SMP_MESSAGE_4};
use otrng_proto::{wire, AuthIMessage, AuthRMessage, ClientProfile, DataMessage, IdentityMessage, NonInteractiveAuthMessage, PrekeyEnsemble};

use crate::callbacks::SmpEvent;
use crate::dake::{self, DakeMessage, DakeState};
use crate::error::ClientError;
use crate::profile::ClientIdentity;
use crate::smp::{self, SmpState};

const MSG_TYPE_IDENTITY: u8 = 0x01;
const MSG_TYPE_AUTH_R: u8 = 0x02;
const MSG_TYPE_DATA: u8 = otrng_proto::message::MSG_TYPE_DATA;
const MSG_TYPE_AUTH_I: u8 = 0x04;
const MSG_TYPE_NON_INTERACTIVE_AUTH: u8 = 0x05;

fn envelope<T: Serialize>(msg_type: u8, payload: &T) -> Result<String, ClientError> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    bytes.push(msg_type);
    bytes.extend_from_slice(&serde_json::to_vec(payload)?);
    Ok(wire::wrap(&bytes))
}

fn data_message_envelope(msg: &DataMessage) -> String {
    wire::wrap(&msg.to_bytes())
}

enum Envelope {
    Identity(IdentityMessage),
    AuthR(AuthRMessage),
    AuthI(AuthIMessage),
    Data(DataMessage),
    NonInteractiveAuth(NonInteractiveAuthMessage),
}

fn decode_envelope(bytes: &[u8]) -> Result<Envelope, ClientError> {
    if bytes.len() < 3 {
        return Err(ClientError::ProtocolViolation("message too short to carry a header".into()));
    }
    let version = u16::from_be_bytes([bytes[0], bytes[1]]);
    if version != PROTOCOL_VERSION {
        return Err(ClientError::ProtocolViolation(format!("unsupported protocol version {version}")));
    }
    let msg_type = bytes[2];
    if msg_type == MSG_TYPE_DATA {
        return Ok(Envelope::Data(DataMessage::from_bytes(bytes)?));
    }
    let payload = &bytes[3..];
    match msg_type {
        MSG_TYPE_IDENTITY => Ok(Envelope::Identity(serde_json::from_slice(payload)?)),
        MSG_TYPE_AUTH_R => Ok(Envelope::AuthR(serde_json::from_slice(payload)?)),
        MSG_TYPE_AUTH_I => Ok(Envelope::AuthI(serde_json::from_slice(payload)?)),
        MSG_TYPE_NON_INTERACTIVE_AUTH => Ok(Envelope::NonInteractiveAuth(serde_json::from_slice(payload)?)),
        other => Err(ClientError::ProtocolViolation(format!("unknown message type 0x{other:02x}"))),
    }
}

enum ConversationState {
    Plaintext,
    Dake(DakeState),
    Encrypted(RatchetState),
    Finished,
}

/// What happened as a result of feeding one inbound message (or running
/// one outbound operation) through a `Conversation`.
#[derive(Default)]
pub struct Outcome {
    /// Plaintext ready for display.
    pub display: Option<String>,
    /// Wire strings the caller must inject, in order.
    pub replies: Vec<String>,
    /// SMP progress worth surfacing via `Callbacks::smp_update`.
    pub smp_events: Vec<(SmpEvent, Option<String>)>,
    pub gone_secure: bool,
    pub gone_insecure: bool,
}

impl Outcome {
    fn reply(message: String) -> Self {
        Self { replies: vec![message], ..Default::default() }
    }
}

pub struct Conversation {
    pub recipient: String,
    pub our_instance_tag: u32,
    pub their_instance_tag: Option<u32>,
    state: ConversationState,
    fragments: FragmentReassembler,
    smp: SmpState,
    /// Our own secret, retained from `smp_start` until `handle_message2`
    /// consumes it (only the initiator needs to recall it across a
    /// round trip — the responder's secret is folded into `s_b` inside
    /// `SmpState::ExpectingMessage3` as soon as `respond` runs).
    smp_secret: Option<Vec<u8>>,
    /// A received message-1 TLV the host hasn't supplied a secret for
    /// yet (`Callbacks::smp_ask_for_secret`/`smp_ask_for_answer`).
    pending_smp_tlv: Option<Tlv>,
    pub last_sent: Option<DateTime<Utc>>,
    pub established_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(recipient: impl Into<String>, our_instance_tag: u32) -> Self {
        Self {
            recipient: recipient.into(),
            our_instance_tag,
            their_instance_tag: None,
            state: ConversationState::Plaintext,
            fragments: FragmentReassembler::new(),
            smp: SmpState::default(),
            smp_secret: None,
            pending_smp_tlv: None,
            last_sent: None,
            established_at: None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.state, ConversationState::Encrypted(_))
    }

    pub fn expire_fragments(&mut self, max_age: std::time::Duration) {
        self.fragments.expire(max_age);
    }

    pub fn fragments_in_progress(&self) -> usize {
        self.fragments.in_progress_count()
    }

    /// Begin an interactive DAKE by sending an Identity message.
    pub fn start_dake(&mut self, our_profile: &ClientProfile, their_instance_tag: u32) -> Result<String, ClientError> {
        self.their_instance_tag = Some(their_instance_tag);
        let (state, msg) = dake::start(self.our_instance_tag, their_instance_tag, our_profile);
        self.state = ConversationState::Dake(state);
        envelope(MSG_TYPE_IDENTITY, &msg)
    }

    /// Start a non-interactive DAKE against a peer's published ensemble,
    /// immediately producing an encrypted first message.
    pub fn start_non_interactive(
        &mut self,
        identity: &ClientIdentity,
        our_profile: &ClientProfile,
        ensemble: &PrekeyEnsemble,
        shared_session_state: &str,
        first_message: &str,
        grace: chrono::Duration,
        max_stored_msg_keys: usize,
    ) -> Result<String, ClientError> {
        self.their_instance_tag = Some(ensemble.client_profile.owner_instance_tag);
        let phi = serialize_phi(
            self.our_instance_tag,
            ensemble.client_profile.owner_instance_tag,
            shared_session_state,
            Some(first_message),
        );
        let handshake = dake::build_non_interactive_auth(
            identity,
            our_profile,
            self.our_instance_tag,
            ensemble,
            &phi,
            grace,
            max_stored_msg_keys,
        )?;
        let mut ratchet = handshake.ratchet;
        let (header, first) = Self::build_data_message(
            self.our_instance_tag,
            ensemble.client_profile.owner_instance_tag,
            &mut ratchet,
            Some(first_message),
            &[],
        )?;
        self.state = ConversationState::Encrypted(ratchet);
        self.established_at = Some(Utc::now());
        self.last_sent = Some(Utc::now());
        let _ = header;

        let msg = NonInteractiveAuthMessage {
            sender_instance_tag: self.our_instance_tag,
            receiver_instance_tag: ensemble.client_profile.owner_instance_tag,
            client_profile: our_profile.clone(),
            ephemeral_ecdh: handshake.ephemeral_ecdh,
            ephemeral_dh: handshake.ephemeral_dh,
            prekey_message_id: handshake.prekey_message_id,
            sigma: handshake.sigma,
            first_data_message: first,
        };
        envelope(MSG_TYPE_NON_INTERACTIVE_AUTH, &msg)
    }

    /// Free function rather than a `&self` method: every call site needs
    /// to hold a `&mut` borrow of `self.state` (to get at `ratchet`) at
    /// the same time, which a `&self` method here would conflict with.
    /// Takes the two instance tags by value instead.
    fn build_data_message(
        our_instance_tag: u32,
        their_instance_tag: u32,
        ratchet: &mut RatchetState,
        plaintext: Option<&str>,
        extra_tlvs: &[Tlv],
    ) -> Result<(RatchetHeader, DataMessage), ClientError> {
        let (header, mk, mac_key) = ratchet.ratchet_encrypt()?;
        let old_mac_keys = ratchet.drain_old_mac_keys();
        let tlv_bytes = tlv::encode_tlvs(extra_tlvs);
        let mut payload = plaintext.unwrap_or("").as_bytes().to_vec();
        payload.push(0);
        payload.extend_from_slice(&tlv_bytes);

        let ciphertext = otrng_crypto::aead::encrypt(&mk, &payload, &[])?;
        let (nonce, ct) = ciphertext.split_at(24);

        let mut framed = Vec::new();
        framed.extend_from_slice(&header.previous_chain_length.to_be_bytes());
        framed.extend_from_slice(&header.ratchet_id.to_be_bytes());
        framed.extend_from_slice(&header.message_id.to_be_bytes());
        framed.extend_from_slice(header.sender_ecdh.as_bytes());
        framed.extend_from_slice(ct);
        let auth_tag = otrng_crypto::aead::mac_tag(&mac_key, &framed);

        let data = DataMessage {
            sender_instance_tag: our_instance_tag,
            receiver_instance_tag: their_instance_tag,
            flags: 0,
            previous_chain_length: header.previous_chain_length,
            ratchet_id: header.ratchet_id,
            message_id: header.message_id,
            sender_ecdh: header.sender_ecdh,
            sender_dh: header.sender_dh,
            nonce: nonce.try_into().expect("XChaCha20-Poly1305 nonce is 24 bytes"),
            ciphertext: ct.to_vec(),
            auth_tag,
            old_mac_keys,
        };
        Ok((header, data))
    }

    /// Free function for the same borrow-checker reason as
    /// `build_data_message`.
    fn open_data_message(
        ratchet: &mut RatchetState,
        data: &DataMessage,
    ) -> Result<(Option<String>, Vec<Tlv>), ClientError> {
        let header = RatchetHeader {
            previous_chain_length: data.previous_chain_length,
            ratchet_id: data.ratchet_id,
            message_id: data.message_id,
            sender_ecdh: data.sender_ecdh,
            sender_dh: data.sender_dh,
        };
        let (mk, mac_key) = ratchet.ratchet_decrypt(&header)?;

        let mut framed = Vec::new();
        framed.extend_from_slice(&data.previous_chain_length.to_be_bytes());
        framed.extend_from_slice(&data.ratchet_id.to_be_bytes());
        framed.extend_from_slice(&data.message_id.to_be_bytes());
        framed.extend_from_slice(data.sender_ecdh.as_bytes());
        framed.extend_from_slice(&data.ciphertext);
        if !otrng_crypto::aead::verify_mac(&mac_key, &framed, &data.auth_tag) {
            return Err(ClientError::AuthenticationFailed);
        }

        let mut ciphertext = Vec::with_capacity(24 + data.ciphertext.len());
        ciphertext.extend_from_slice(&data.nonce);
        ciphertext.extend_from_slice(&data.ciphertext);
        let plaintext = otrng_crypto::aead::decrypt(&mk, &ciphertext, &[])?;

        ratchet.queue_old_mac_key(mac_key);

        let nul = plaintext.iter().position(|&b| b == 0).unwrap_or(plaintext.len());
        let text = String::from_utf8_lossy(&plaintext[..nul]).into_owned();
        let tlvs = if nul + 1 < plaintext.len() { tlv::decode_tlvs(&plaintext[nul + 1..])? } else { Vec::new() };

        Ok((if text.is_empty() { None } else { Some(text) }, tlvs))
    }

    /// Encrypt and frame `plaintext`, ready to wrap in `wire::wrap`.
    pub fn send(&mut self, plaintext: &str, padding: usize) -> Result<String, ClientError> {
        let (our_tag, their_tag) = (self.our_instance_tag, self.their_instance_tag.unwrap_or(0));
        let ratchet = match &mut self.state {
            ConversationState::Encrypted(r) => r,
            _ => return Err(ClientError::NotEncrypted),
        };
        let extra = if padding > 0 {
            vec![tlv::padding_tlv_for(plaintext.len() + 1, padding)]
        } else {
            Vec::new()
        };
        let (_header, data) = Self::build_data_message(our_tag, their_tag, ratchet, Some(plaintext), &extra)?;
        self.last_sent = Some(Utc::now());
        Ok(data_message_envelope(&data))
    }

    pub fn disconnect(&mut self) -> Result<String, ClientError> {
        let (our_tag, their_tag) = (self.our_instance_tag, self.their_instance_tag.unwrap_or(0));
        let ratchet = match &mut self.state {
            ConversationState::Encrypted(r) => r,
            _ => return Err(ClientError::NotEncrypted),
        };
        let (_header, data) =
            Self::build_data_message(our_tag, their_tag, ratchet, None, &[Tlv::new(TLV_DISCONNECT, Vec::new())])?;
        self.state = ConversationState::Finished;
        self.last_sent = Some(Utc::now());
        Ok(data_message_envelope(&data))
    }

    pub fn smp_start(&mut self, secret: &[u8], question: Option<String>) -> Result<String, ClientError> {
        if !self.is_encrypted() {
            return Err(ClientError::NotEncrypted);
        }
        let (state, tlv) = smp::start(secret, question);
        self.smp = state;
        self.smp_secret = Some(secret.to_vec());
        let (our_tag, their_tag) = (self.our_instance_tag, self.their_instance_tag.unwrap_or(0));
        let ratchet = match &mut self.state {
            ConversationState::Encrypted(r) => r,
            _ => unreachable!("checked above"),
        };
        let (_header, data) = Self::build_data_message(our_tag, their_tag, ratchet, None, &[tlv])?;
        self.last_sent = Some(Utc::now());
        Ok(data_message_envelope(&data))
    }

    pub fn smp_abort(&mut self) -> Result<String, ClientError> {
        if !self.is_encrypted() {
            return Err(ClientError::NotEncrypted);
        }
        let (state, tlv) = smp::abort();
        self.smp = state;
        let (our_tag, their_tag) = (self.our_instance_tag, self.their_instance_tag.unwrap_or(0));
        let ratchet = match &mut self.state {
            ConversationState::Encrypted(r) => r,
            _ => unreachable!("checked above"),
        };
        let (_header, data) = Self::build_data_message(our_tag, their_tag, ratchet, None, &[tlv])?;
        self.last_sent = Some(Utc::now());
        Ok(data_message_envelope(&data))
    }

    fn handle_smp_tlv(&mut self, tlv: &Tlv, secret_for_respond: Option<&[u8]>) -> Result<(Option<Tlv>, Vec<(SmpEvent, Option<String>)>), ClientError> {
        let mut events = Vec::new();
        let state = std::mem::take(&mut self.smp);
        match tlv.tlv_type {
            TLV_SMP_MESSAGE_1 | TLV_SMP_MESSAGE_1Q => {
                let question = smp::peek_message1(tlv)?;
                events.push((SmpEvent::Started, question.clone()));
                if let Some(secret) = secret_for_respond {
                    let (next, reply) = smp::respond(secret, tlv)?;
                    self.smp = next;
                    Ok((Some(reply), events))
                } else {
                    // No secret supplied yet. Stash the TLV so a later
                    // `smp_respond` call (once the host answers
                    // `smp_ask_for_secret`/`smp_ask_for_answer`) can pick
                    // up exactly where this left off.
                    self.smp = SmpState::Idle;
                    self.pending_smp_tlv = Some(tlv.clone());
                    Ok((None, events))
                }
            }
            TLV_SMP_MESSAGE_2 => {
                let secret = self
                    .smp_secret
                    .take()
                    .ok_or_else(|| ClientError::ProtocolViolation("SMP message 2 received but we are not the initiator".into()))?;
                let outcome = smp::handle_message2(state, &secret, tlv)?;
                self.smp = outcome.state;
                if let Some(result) = outcome.result {
                    events.push((if result { SmpEvent::InProgress } else { SmpEvent::Failed }, None));
                }
                Ok((outcome.reply, events))
            }
            TLV_SMP_MESSAGE_3 => {
                let outcome = smp::handle_message3(state, tlv)?;
                let succeeded = matches!(outcome.state, SmpState::Succeeded);
                self.smp = outcome.state;
                events.push((if succeeded { SmpEvent::Succeeded } else { SmpEvent::Failed }, None));
                Ok((outcome.reply, events))
            }
            TLV_SMP_MESSAGE_4 => {
                let outcome = smp::handle_message4(state, tlv)?;
                let succeeded = matches!(outcome.state, SmpState::Succeeded);
                self.smp = outcome.state;
                events.push((if succeeded { SmpEvent::Succeeded } else { SmpEvent::Failed }, None));
                Ok((None, events))
            }
            TLV_SMP_ABORT => {
                self.smp = smp::handle_abort();
                self.smp_secret = None;
                self.pending_smp_tlv = None;
                events.push((SmpEvent::Aborted, None));
                Ok((None, events))
            }
            _ => {
                self.smp = state;
                Ok((None, events))
            }
        }
    }

    /// Answer a pending SMP message 1 once the host has produced a
    /// secret (directly, or after asking the user via `smp_ask_for_secret`
    /// / `smp_ask_for_answer`).
    pub fn smp_respond(&mut self, secret: &[u8]) -> Result<String, ClientError> {
        let tlv = self
            .pending_smp_tlv
            .take()
            .ok_or_else(|| ClientError::ProtocolViolation("no pending SMP message 1 to respond to".into()))?;
        let (state, reply) = smp::respond(secret, &tlv)?;
        self.smp = state;
        let (our_tag, their_tag) = (self.our_instance_tag, self.their_instance_tag.unwrap_or(0));
        let ratchet = match &mut self.state {
            ConversationState::Encrypted(r) => r,
            _ => return Err(ClientError::NotEncrypted),
        };
        let (_header, data) = Self::build_data_message(our_tag, their_tag, ratchet, None, &[reply])?;
        self.last_sent = Some(Utc::now());
        Ok(data_message_envelope(&data))
    }

    /// Top-level receive dispatch: defragment, classify,
    /// and route to the DAKE or data-message path.
    ///
    /// `take_prekey`, when given, lets the caller (`Client`, which owns
    /// the `PrekeyMessagePool`) resolve a non-interactive Auth message's
    /// `prekey_message_id` into the stored ephemeral keypair it was
    /// published with. Without it, an incoming non-interactive Auth is a
    /// protocol violation, since this `Conversation` has no prekeys of
    /// its own to consume.
    pub fn receive(
        &mut self,
        raw: &str,
        identity: &ClientIdentity,
        our_profile: &ClientProfile,
        shared_session_state: &str,
        grace: chrono::Duration,
        max_stored_msg_keys: usize,
        smp_secret_for_respond: Option<&[u8]>,
        take_prekey: Option<&mut dyn FnMut(u32) -> Option<(EcdhKeyPair, DhKeyPair)>>,
    ) -> Result<Outcome, ClientError> {
        let joined = match self.fragments.unfragment(raw, self.our_instance_tag)? {
            Some(joined) => joined,
            None => return Ok(Outcome::default()),
        };

        match wire::classify(&joined) {
            wire::FormatDiscriminator::Otrv4 => {
                let bytes = wire::unwrap(&joined)?;
                let phi_initial = None;
                self.dispatch_envelope(
                    &bytes,
                    identity,
                    our_profile,
                    shared_session_state,
                    phi_initial,
                    grace,
                    max_stored_msg_keys,
                    smp_secret_for_respond,
                    take_prekey,
                )
            }
            wire::FormatDiscriminator::Query => {
                let reply = self.start_dake(our_profile, self.their_instance_tag.unwrap_or(0))?;
                Ok(Outcome::reply(reply))
            }
            wire::FormatDiscriminator::WhitespaceTag => {
                let reply = self.start_dake(our_profile, self.their_instance_tag.unwrap_or(0))?;
                let stripped = wire::strip_whitespace_tag(&joined);
                Ok(Outcome {
                    display: if stripped.is_empty() { None } else { Some(stripped) },
                    replies: vec![reply],
                    ..Default::default()
                })
            }
            wire::FormatDiscriminator::Error | wire::FormatDiscriminator::LegacyOrUnknown => Ok(Outcome::default()),
            wire::FormatDiscriminator::PlainText => Ok(Outcome { display: Some(joined), ..Default::default() }),
        }
    }

    fn dispatch_envelope(
        &mut self,
        bytes: &[u8],
        identity: &ClientIdentity,
        our_profile: &ClientProfile,
        shared_session_state: &str,
        initial_message: Option<&str>,
        grace: chrono::Duration,
        max_stored_msg_keys: usize,
        smp_secret_for_respond: Option<&[u8]>,
        take_prekey: Option<&mut dyn FnMut(u32) -> Option<(EcdhKeyPair, DhKeyPair)>>,
    ) -> Result<Outcome, ClientError> {
        match decode_envelope(bytes)? {
            Envelope::Identity(msg) => {
                self.their_instance_tag = Some(msg.sender_instance_tag);
                let phi = serialize_phi(self.our_instance_tag, msg.sender_instance_tag, shared_session_state, initial_message);
                let prior = std::mem::replace(&mut self.state, ConversationState::Plaintext);
                let dake_state = match prior {
                    ConversationState::Dake(s) => s,
                    _ => DakeState::Start,
                };
                let (next, reply) = dake::handle_identity(dake_state, identity, our_profile, self.our_instance_tag, &msg, &phi, grace)?;
                self.state = ConversationState::Dake(next);
                match reply {
                    Some(DakeMessage::Identity(m)) => Ok(Outcome::reply(envelope(MSG_TYPE_IDENTITY, &m)?)),
                    Some(DakeMessage::AuthR(m)) => Ok(Outcome::reply(envelope(MSG_TYPE_AUTH_R, &m)?)),
                    Some(DakeMessage::AuthI(_)) => unreachable!("handle_identity never replies with Auth-I"),
                    None => Ok(Outcome::default()),
                }
            }
            Envelope::AuthR(msg) => {
                self.their_instance_tag = Some(msg.sender_instance_tag);
                let phi = serialize_phi(self.our_instance_tag, msg.sender_instance_tag, shared_session_state, initial_message);
                let prior = std::mem::replace(&mut self.state, ConversationState::Plaintext);
                let dake_state = match prior {
                    ConversationState::Dake(s) => s,
                    _ => return Err(ClientError::ProtocolViolation("Auth-R received outside a DAKE".into())),
                };
                let (_next, reply, ratchet) =
                    dake::handle_auth_r(dake_state, identity, our_profile, self.our_instance_tag, &msg, &phi, grace, max_stored_msg_keys)?;
                self.state = ConversationState::Encrypted(ratchet);
                self.established_at = Some(Utc::now());
                tracing::info!(recipient = %self.recipient, "DAKE established (initiator side)");
                let auth_i = match reply {
                    DakeMessage::AuthI(m) => m,
                    _ => unreachable!("handle_auth_r always replies with Auth-I"),
                };
                Ok(Outcome { replies: vec![envelope(MSG_TYPE_AUTH_I, &auth_i)?], gone_secure: true, ..Default::default() })
            }
            Envelope::AuthI(msg) => {
                let phi = serialize_phi(self.our_instance_tag, msg.sender_instance_tag, shared_session_state, initial_message);
                let prior = std::mem::replace(&mut self.state, ConversationState::Plaintext);
                let dake_state = match prior {
                    ConversationState::Dake(s) => s,
                    _ => return Err(ClientError::ProtocolViolation("Auth-I received outside a DAKE".into())),
                };
                let ratchet = dake::handle_auth_i(dake_state, self.our_instance_tag, &msg, &phi, max_stored_msg_keys)?;
                self.state = ConversationState::Encrypted(ratchet);
                self.established_at = Some(Utc::now());
                tracing::info!(recipient = %self.recipient, "DAKE established (responder side)");
                Ok(Outcome { gone_secure: true, ..Default::default() })
            }
            Envelope::NonInteractiveAuth(msg) => {
                let resolver = take_prekey.ok_or_else(|| {
                    ClientError::ProtocolViolation(
                        "non-interactive Auth received but no prekey pool is available".into(),
                    )
                })?;
                let (our_prekey_ecdh, our_prekey_dh) = resolver(msg.prekey_message_id).ok_or_else(|| {
                    ClientError::ProtocolViolation(format!(
                        "no stored prekey for id {}",
                        msg.prekey_message_id
                    ))
                })?;
                self.their_instance_tag = Some(msg.sender_instance_tag);
                let phi = serialize_phi(self.our_instance_tag, msg.sender_instance_tag, shared_session_state, initial_message);
                let mut ratchet = dake::handle_non_interactive_auth(
                    self.our_instance_tag,
                    our_profile,
                    &msg,
                    our_prekey_ecdh,
                    our_prekey_dh,
                    &phi,
                    grace,
                    max_stored_msg_keys,
                )?;
                let (text, tlvs) = Self::open_data_message(&mut ratchet, &msg.first_data_message)?;
                self.state = ConversationState::Encrypted(ratchet);
                self.established_at = Some(Utc::now());
                tracing::info!(recipient = %self.recipient, "non-interactive DAKE established (responder side)");
                let mut outcome = Outcome { display: text, gone_secure: true, ..Default::default() };
                for t in &tlvs {
                    if t.tlv_type == TLV_DISCONNECT && t.value.is_empty() {
                        self.state = ConversationState::Finished;
                        outcome.gone_insecure = true;
                    }
                }
                Ok(outcome)
            }
            Envelope::Data(data) => {
                if data.receiver_instance_tag != 0 && data.receiver_instance_tag != self.our_instance_tag {
                    return Ok(Outcome::default());
                }
                let (our_tag, their_tag) = (self.our_instance_tag, self.their_instance_tag.unwrap_or(0));
                let ratchet = match &mut self.state {
                    ConversationState::Encrypted(r) => r,
                    _ => return Err(ClientError::NotEncrypted),
                };
                let (text, tlvs) = Self::open_data_message(ratchet, &data)?;
                let mut outcome = Outcome { display: text, ..Default::default() };
                for t in &tlvs {
                    if t.tlv_type == TLV_DISCONNECT && t.value.is_empty() {
                        self.state = ConversationState::Finished;
                        outcome.gone_insecure = true;
                        tracing::info!(recipient = %self.recipient, "peer sent disconnect TLV");
                        continue;
                    }
                    let (reply, events) = self.handle_smp_tlv(t, smp_secret_for_respond)?;
                    outcome.smp_events.extend(events);
                    if let Some(reply_tlv) = reply {
                        if let ConversationState::Encrypted(r) = &mut self.state {
                            let (_h, data) = Self::build_data_message(our_tag, their_tag, r, None, &[reply_tlv])?;
                            self.last_sent = Some(Utc::now());
                            outcome.replies.push(data_message_envelope(&data));
                        }
                    }
                }
                Ok(outcome)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ClientIdentity;

    fn setup() -> (ClientIdentity, ClientProfile, ClientIdentity, ClientProfile) {
        let alice_id = ClientIdentity::generate(0x1000_0001);
        let alice_profile = alice_id.build_client_profile(chrono::Duration::days(30));
        let bob_id = ClientIdentity::generate(0x2000_0002);
        let bob_profile = bob_id.build_client_profile(chrono::Duration::days(30));
        (alice_id, alice_profile, bob_id, bob_profile)
    }

    #[test]
    fn full_handshake_and_message_roundtrip() {
        let (alice_id, alice_profile, bob_id, bob_profile) = setup();
        let mut alice = Conversation::new("bob", alice_id.instance_tag);
        let mut bob = Conversation::new("alice", bob_id.instance_tag);

        let identity_wire = alice.start_dake(&alice_profile, bob_id.instance_tag).unwrap();

        let bob_outcome = bob
            .receive(&identity_wire, &bob_id, &bob_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        assert_eq!(bob_outcome.replies.len(), 1);

        let alice_outcome = alice
            .receive(&bob_outcome.replies[0], &alice_id, &alice_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        assert!(alice_outcome.gone_secure);
        assert_eq!(alice_outcome.replies.len(), 1);

        let bob_outcome2 = bob
            .receive(&alice_outcome.replies[0], &bob_id, &bob_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        assert!(bob_outcome2.gone_secure);
        assert!(alice.is_encrypted());
        assert!(bob.is_encrypted());

        let wire_msg = alice.send("hello bob", 0).unwrap();
        let received = bob
            .receive(&wire_msg, &bob_id, &bob_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        assert_eq!(received.display.as_deref(), Some("hello bob"));
    }

    /// A duplicate Identity message arriving while we're waiting for
    /// Auth-I restarts the DAKE instead of getting stuck: we discard our
    /// prior ephemerals and send a fresh Auth-R, and the handshake still
    /// converges to one encrypted session.
    #[test]
    fn duplicate_identity_while_waiting_for_auth_i_restarts_cleanly() {
        let (alice_id, alice_profile, bob_id, bob_profile) = setup();
        let mut alice = Conversation::new("bob", alice_id.instance_tag);
        let mut bob = Conversation::new("alice", bob_id.instance_tag);

        let identity_wire = alice.start_dake(&alice_profile, bob_id.instance_tag).unwrap();

        let bob_outcome_first = bob
            .receive(&identity_wire, &bob_id, &bob_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        assert_eq!(bob_outcome_first.replies.len(), 1);

        // Alice's original Identity message arrives again (e.g.
        // re-delivered by an unreliable transport).
        let bob_outcome_dup = bob
            .receive(&identity_wire, &bob_id, &bob_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        assert_eq!(bob_outcome_dup.replies.len(), 1);

        let alice_outcome = alice
            .receive(&bob_outcome_dup.replies[0], &alice_id, &alice_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        assert!(alice_outcome.gone_secure);

        let bob_outcome2 = bob
            .receive(&alice_outcome.replies[0], &bob_id, &bob_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        assert!(bob_outcome2.gone_secure);
        assert!(alice.is_encrypted());
        assert!(bob.is_encrypted());
    }

    #[test]
    fn smp_matching_secrets_succeed_on_both_sides() {
        let (alice_id, alice_profile, bob_id, bob_profile) = setup();
        let mut alice = Conversation::new("bob", alice_id.instance_tag);
        let mut bob = Conversation::new("alice", bob_id.instance_tag);

        let identity_wire = alice.start_dake(&alice_profile, bob_id.instance_tag).unwrap();
        let bob_outcome = bob
            .receive(&identity_wire, &bob_id, &bob_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        let alice_outcome = alice
            .receive(&bob_outcome.replies[0], &alice_id, &alice_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        bob.receive(&alice_outcome.replies[0], &bob_id, &bob_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();

        let secret = b"correct horse battery staple";
        let smp1_wire = alice.smp_start(secret, None).unwrap();

        let bob_smp_outcome = bob
            .receive(&smp1_wire, &bob_id, &bob_profile, "state", chrono::Duration::zero(), 256, Some(secret), None)
            .unwrap();
        assert_eq!(bob_smp_outcome.replies.len(), 1);

        let alice_smp_outcome = alice
            .receive(&bob_smp_outcome.replies[0], &alice_id, &alice_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        assert_eq!(alice_smp_outcome.replies.len(), 1);

        let bob_smp_outcome2 = bob
            .receive(&alice_smp_outcome.replies[0], &bob_id, &bob_profile, "state", chrono::Duration::zero(), 256, None, None)
            .unwrap();
        assert!(bob_smp_outcome2
            .smp_events
            .iter()
            .any(|(e, _)| matches!(e, SmpEvent::Succeeded)));
    }
}
