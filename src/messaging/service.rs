//! Messaging service (spec component 4.H): wires the identity, the
//! per-contact ratchet session, the peer connection manager and the
//! signalling client behind the request surface the facade drives, and
//! publishes [`Event`] for anything the UI needs pushed to it.
//!
//! Inbound frame handling (`handle_frame`) never touches the network: it
//! only takes the per-contact session lock, runs the ratchet, and writes to
//! the store. Outbound operations (`send_text` and friends) do the same
//! crypto+store work first, then hand the resulting frame to the peer
//! connection manager, matching the session-lock-then-transport ordering in
//! the concurrency model.

use crate::config::Config;
use crate::crypto::handshake::x3dh_lite::X3DHLitePublicKey;
use crate::crypto::messaging::{DoubleRatchetSession, EncryptedRatchetMessage, SerializableSession};
use crate::crypto::provider::CryptoProvider;
use crate::crypto::session_api::PeerSession;
use crate::identity::Identity;
use crate::messaging::events::Event;
use crate::protocol::messages::{envelope_kind, SdpPayload, SignallingEnvelope};
use crate::protocol::peer::{PeerConnectionManager, PeerState};
use crate::protocol::signalling::SignallingClient;
use crate::protocol::validation::validate_frame;
use crate::protocol::wire::{
    DeleteBody, EditBody, Frame, ReactionAction, ReactionBody, RatchetHeader, SessionInitBody,
    TextBody, TypingBody,
};
use crate::storage::models::{
    MessageKind, MessageStatus, Reaction, StoredContact, StoredMessage, StoredSession,
};
use crate::storage::Store;
use crate::utils::b64;
use crate::utils::error::{MessengerError, Result};
use crate::utils::time::current_timestamp;
use crate::utils::uuid::generate_v4;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

type Session<P> = PeerSession<P, DoubleRatchetSession<P>>;

/// A target an edit frame is waiting on: the edit arrived before its
/// original message, so it is held for `edit_buffer_window_secs`.
struct BufferedEdit {
    contact_id: String,
    new_body: String,
    buffered_at: i64,
}

pub struct MessagingService<P: CryptoProvider> {
    identity: Arc<Identity<P>>,
    store: Arc<dyn Store>,
    peer: Arc<PeerConnectionManager>,
    signalling: Arc<SignallingClient<P>>,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session<P>>>>>,
    typing_throttle: Mutex<HashMap<String, i64>>,
    edit_buffer: Mutex<HashMap<String, BufferedEdit>>,
    events_tx: mpsc::UnboundedSender<Event>,
}

impl<P: CryptoProvider> MessagingService<P> {
    pub fn new(
        identity: Arc<Identity<P>>,
        store: Arc<dyn Store>,
        peer: Arc<PeerConnectionManager>,
        signalling: Arc<SignallingClient<P>>,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                identity,
                store,
                peer,
                signalling,
                sessions: RwLock::new(HashMap::new()),
                typing_throttle: Mutex::new(HashMap::new()),
                edit_buffer: Mutex::new(HashMap::new()),
                events_tx,
            },
            events_rx,
        )
    }

    pub fn p2p_state(&self, contact_id: &str) -> Option<PeerState> {
        self.peer.state_of(contact_id)
    }

    /// Derive the per-transfer AEAD key the file-transfer subsystem uses to
    /// encrypt chunks, from the contact's current ratchet session root.
    /// Requires a session to already exist (a text exchange, or `initiate`,
    /// must have happened first).
    pub fn transfer_key(&self, contact_id: &str, transfer_id: &str) -> Result<P::AeadKey> {
        let slot = self
            .get_or_load_session(contact_id)?
            .ok_or_else(|| MessengerError::SessionError(format!("no session for {}", contact_id)))?;
        slot.lock()
            .messaging_session()
            .derive_transfer_key(transfer_id)
            .map_err(MessengerError::CryptoError)
    }

    // ------------------------------------------------------------------
    // Signalling-driven connection setup
    // ------------------------------------------------------------------

    /// Open a peer connection, create an offer, and relay it to the contact
    /// over signalling. Resolves once the offer has been sent; the answer
    /// arrives later through [`Self::handle_answer`].
    pub async fn initiate(&self, contact_id: &str) -> Result<()> {
        let contact = self.load_contact(contact_id)?;
        let offer_sdp = self.peer.create_offer(contact_id).await?;
        self.send_signalling(&contact, envelope_kind::OFFER, SdpPayload { sdp: offer_sdp })?;
        info!(target: "messaging::service", contact_id, "sent offer");
        Ok(())
    }

    pub async fn handle_offer(&self, contact_id: &str, offer_sdp: &str) -> Result<()> {
        let contact = self.load_contact(contact_id)?;
        let answer_sdp = self.peer.accept_offer(contact_id, offer_sdp).await?;
        self.send_signalling(&contact, envelope_kind::ANSWER, SdpPayload { sdp: answer_sdp })?;
        info!(target: "messaging::service", contact_id, "sent answer");
        Ok(())
    }

    pub async fn handle_answer(&self, contact_id: &str, answer_sdp: &str) -> Result<()> {
        self.peer.handle_answer(contact_id, answer_sdp).await
    }

    /// Only meaningful if the remote end ever sends trickle candidates; this
    /// side always gathers non-trickle and never emits its own mid-flight.
    pub async fn handle_candidate(&self, contact_id: &str, candidate: RTCIceCandidateInit) -> Result<()> {
        self.peer.add_ice_candidate(contact_id, candidate).await
    }

    fn send_signalling(
        &self,
        contact: &StoredContact,
        kind: &str,
        payload: impl serde::Serialize,
    ) -> Result<()> {
        let envelope = SignallingEnvelope::new(
            kind,
            serde_json::to_value(payload)
                .map_err(|e| MessengerError::SerializationError(e.to_string()))?,
        )
        .to(hex::encode(&contact.signing_public_key));
        self.signalling.send(envelope)
    }

    // ------------------------------------------------------------------
    // Outbound text / edit / delete / reaction / typing
    // ------------------------------------------------------------------

    pub async fn send_text(
        &self,
        contact_id: &str,
        body: &str,
        reply_to: Option<String>,
    ) -> Result<StoredMessage> {
        let (stored, init_frame, text_frame) = self.prepare_text(contact_id, body, reply_to)?;

        if let Some(init_frame) = init_frame {
            self.send_frame(contact_id, init_frame).await?;
        }
        self.send_frame(contact_id, text_frame).await?;

        let mut sent = stored;
        sent.status = MessageStatus::Sent;
        self.store.save_message(sent.clone())?;
        Ok(sent)
    }

    /// Encrypt + persist locally, without touching the network. Split out
    /// of [`Self::send_text`] so the crypto/store half is exercised directly
    /// by tests that don't stand up a real data channel.
    fn prepare_text(
        &self,
        contact_id: &str,
        body: &str,
        reply_to: Option<String>,
    ) -> Result<(StoredMessage, Option<Frame>, Frame)> {
        let (slot, is_new_session) = self.ensure_initiator_session(contact_id)?;
        let message_id = generate_v4();
        let sent_at = current_timestamp();

        let (header, ciphertext_b64, ephemeral) = {
            let mut guard = slot.lock();
            let encrypted = guard
                .encrypt(body.as_bytes())
                .map_err(MessengerError::CryptoError)?;
            self.persist_session(contact_id, &guard)?;
            let ephemeral = is_new_session.then(|| b64::url_encode(&encrypted.dh_public_key));
            (Self::build_header(&encrypted), b64::encode(&encrypted.ciphertext), ephemeral)
        };

        let stored = StoredMessage {
            id: message_id.clone(),
            contact_id: contact_id.to_string(),
            from: "self".to_string(),
            to: contact_id.to_string(),
            kind: MessageKind::Text,
            body: Some(body.to_string()),
            reply_to,
            file_ref: None,
            sent_at,
            received_at: None,
            edited: false,
            deleted: false,
            status: MessageStatus::Pending,
        };
        self.store.save_message(stored.clone())?;

        let init_frame = ephemeral.map(|ephemeral| Frame::SessionInit {
            id: generate_v4(),
            ts: sent_at,
            body: SessionInitBody { ephemeral },
        });
        let text_frame = Frame::Text {
            id: message_id,
            ts: sent_at,
            body: TextBody { ciphertext: ciphertext_b64, header },
        };

        Ok((stored, init_frame, text_frame))
    }

    pub async fn send_edit(&self, contact_id: &str, message_id: &str, new_body: &str) -> Result<()> {
        let frame = self.prepare_edit(contact_id, message_id, new_body)?;
        self.send_frame(contact_id, frame).await
    }

    fn prepare_edit(&self, contact_id: &str, message_id: &str, new_body: &str) -> Result<Frame> {
        let mut stored = self
            .store
            .load_message(message_id)?
            .ok_or_else(|| MessengerError::NotFound(format!("message {}", message_id)))?;
        if stored.from != "self" {
            return Err(MessengerError::Denied(
                "cannot edit a message not sent by self".to_string(),
            ));
        }
        stored.body = Some(new_body.to_string());
        stored.edited = true;
        self.store.save_message(stored)?;

        let slot = self
            .get_or_load_session(contact_id)?
            .ok_or_else(|| MessengerError::SessionError(format!("no session for {}", contact_id)))?;
        let (header, ciphertext_b64) = {
            let mut guard = slot.lock();
            let encrypted = guard
                .encrypt(new_body.as_bytes())
                .map_err(MessengerError::CryptoError)?;
            self.persist_session(contact_id, &guard)?;
            (Self::build_header(&encrypted), b64::encode(&encrypted.ciphertext))
        };

        Ok(Frame::Edit {
            id: generate_v4(),
            ts: current_timestamp(),
            body: EditBody { target_id: message_id.to_string(), ciphertext: ciphertext_b64, header },
        })
    }

    pub async fn send_delete(&self, contact_id: &str, message_id: &str) -> Result<()> {
        let frame = self.prepare_delete(contact_id, message_id)?;
        self.send_frame(contact_id, frame).await
    }

    fn prepare_delete(&self, contact_id: &str, message_id: &str) -> Result<Frame> {
        let mut stored = self
            .store
            .load_message(message_id)?
            .ok_or_else(|| MessengerError::NotFound(format!("message {}", message_id)))?;
        if stored.from != "self" {
            return Err(MessengerError::Denied(
                "cannot delete a message not sent by self".to_string(),
            ));
        }

        if Config::global().soft_delete_messages {
            stored.body = None;
            stored.deleted = true;
            self.store.save_message(stored)?;
        } else {
            self.store.delete_message(message_id)?;
        }

        Ok(Frame::Delete {
            id: generate_v4(),
            ts: current_timestamp(),
            body: DeleteBody { target_id: message_id.to_string() },
        })
    }

    pub async fn send_reaction(&self, contact_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        self.store.add_reaction(Reaction {
            message_id: message_id.to_string(),
            sender_id: "self".to_string(),
            emoji: emoji.to_string(),
            added_at: current_timestamp(),
        })?;
        let frame = Frame::Reaction {
            id: generate_v4(),
            ts: current_timestamp(),
            body: ReactionBody {
                target_id: message_id.to_string(),
                emoji: emoji.to_string(),
                action: ReactionAction::Add,
            },
        };
        self.send_frame(contact_id, frame).await
    }

    pub async fn remove_reaction(&self, contact_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        self.store.remove_reaction(message_id, "self", emoji)?;
        let frame = Frame::Reaction {
            id: generate_v4(),
            ts: current_timestamp(),
            body: ReactionBody {
                target_id: message_id.to_string(),
                emoji: emoji.to_string(),
                action: ReactionAction::Remove,
            },
        };
        self.send_frame(contact_id, frame).await
    }

    /// Rate-limited to one `active:true` frame per `typing_throttle_secs`;
    /// `active:false` always goes straight through.
    pub async fn send_typing(&self, contact_id: &str, active: bool) -> Result<()> {
        if active {
            let mut throttle = self.typing_throttle.lock();
            let now = current_timestamp();
            if let Some(&last) = throttle.get(contact_id) {
                if now - last < Config::global().typing_throttle_secs {
                    return Ok(());
                }
            }
            throttle.insert(contact_id.to_string(), now);
        }
        let frame = Frame::Typing {
            id: generate_v4(),
            ts: current_timestamp(),
            body: TypingBody { active },
        };
        self.send_frame(contact_id, frame).await
    }

    async fn send_frame(&self, contact_id: &str, frame: Frame) -> Result<()> {
        let bytes = crate::protocol::wire::encode_frame(&frame)?;
        match self.peer.send(contact_id, bytes.clone()).await {
            Ok(()) => Ok(()),
            Err(MessengerError::Backpressure(_)) => {
                self.peer.send_ready(contact_id).await?;
                self.peer.send(contact_id, bytes).await
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Inbound frame handling (pure: session + store, no network)
    // ------------------------------------------------------------------

    pub async fn handle_frame(&self, contact_id: &str, frame: Frame) -> Result<()> {
        validate_frame(&frame)?;
        match frame {
            Frame::SessionInit { .. } => {
                debug!(target: "messaging::service", contact_id, "session-init received");
                Ok(())
            }
            Frame::Text { id, ts, body } => self.on_channel_text(contact_id, id, ts, body),
            Frame::Edit { ts, body, .. } => self.on_channel_edit(contact_id, ts, body),
            Frame::Delete { body, .. } => self.on_channel_delete(contact_id, body.target_id),
            Frame::Reaction { body, .. } => self.on_channel_reaction(contact_id, body),
            Frame::Typing { body, .. } => {
                let _ = self.events_tx.send(Event::TypingChanged {
                    contact_id: contact_id.to_string(),
                    active: body.active,
                });
                Ok(())
            }
            Frame::Ack { .. } => Ok(()),
            other => {
                warn!(
                    target: "messaging::service",
                    frame = other.type_name(),
                    "file-transfer frame reached the messaging router; the transfer subsystem should have intercepted it"
                );
                Ok(())
            }
        }
    }

    fn on_channel_text(&self, contact_id: &str, id: String, ts: i64, body: TextBody) -> Result<()> {
        let encrypted = Self::wire_to_encrypted(&body.ciphertext, &body.header)?;

        let plaintext = if let Some(slot) = self.get_or_load_session(contact_id)? {
            let mut guard = slot.lock();
            match guard.decrypt(&encrypted) {
                Ok(plaintext) => {
                    self.persist_session(contact_id, &guard)?;
                    plaintext
                }
                Err(_) => {
                    let _ = self.events_tx.send(Event::MessageUndecryptable {
                        contact_id: contact_id.to_string(),
                        frame_id: id,
                    });
                    return Ok(());
                }
            }
        } else {
            let contact = self.load_contact(contact_id)?;
            let remote_ka_bytes = contact.ka_public_key.clone().ok_or_else(|| {
                MessengerError::ValidationError(format!(
                    "contact {} has no key-agreement public key on file",
                    contact_id
                ))
            })?;
            let remote_identity = P::kem_public_key_from_bytes(remote_ka_bytes);
            let remote_ephemeral = P::kem_public_key_from_bytes(encrypted.dh_public_key.to_vec());

            let result = PeerSession::init_as_responder(
                &self.identity.ka_private,
                &remote_identity,
                &remote_ephemeral,
                &encrypted,
                contact_id.to_string(),
            );
            let (session, plaintext) = match result {
                Ok(pair) => pair,
                Err(_) => {
                    let _ = self.events_tx.send(Event::MessageUndecryptable {
                        contact_id: contact_id.to_string(),
                        frame_id: id,
                    });
                    return Ok(());
                }
            };
            self.persist_session(contact_id, &session)?;
            self.sessions
                .write()
                .insert(contact_id.to_string(), Arc::new(Mutex::new(session)));
            plaintext
        };

        let text = String::from_utf8_lossy(&plaintext).to_string();
        let received_at = current_timestamp();
        let stored = StoredMessage {
            id: id.clone(),
            contact_id: contact_id.to_string(),
            from: contact_id.to_string(),
            to: "self".to_string(),
            kind: MessageKind::Text,
            body: Some(text.clone()),
            reply_to: None,
            file_ref: None,
            sent_at: ts,
            received_at: Some(received_at),
            edited: false,
            deleted: false,
            status: MessageStatus::Delivered,
        };
        self.store.save_message(stored)?;
        self.apply_buffered_edit(&id)?;

        let _ = self.events_tx.send(Event::MessageReceived {
            contact_id: contact_id.to_string(),
            message_id: id,
            body: text,
            sent_at: ts,
            received_at,
        });
        Ok(())
    }

    fn on_channel_edit(&self, contact_id: &str, ts: i64, body: EditBody) -> Result<()> {
        let Some(slot) = self.get_or_load_session(contact_id)? else {
            return Err(MessengerError::SessionError(format!("no session for {}", contact_id)));
        };
        let encrypted = Self::wire_to_encrypted(&body.ciphertext, &body.header)?;
        let plaintext = {
            let mut guard = slot.lock();
            match guard.decrypt(&encrypted) {
                Ok(plaintext) => {
                    self.persist_session(contact_id, &guard)?;
                    plaintext
                }
                Err(_) => {
                    let _ = self.events_tx.send(Event::MessageUndecryptable {
                        contact_id: contact_id.to_string(),
                        frame_id: body.target_id,
                    });
                    return Ok(());
                }
            }
        };
        let new_body = String::from_utf8_lossy(&plaintext).to_string();

        match self.store.load_message(&body.target_id)? {
            Some(mut stored) => {
                if stored.from != contact_id {
                    warn!(
                        target: "messaging::service",
                        contact_id,
                        target_id = %body.target_id,
                        "edit rejected: sender does not match message origin"
                    );
                    return Ok(());
                }
                stored.body = Some(new_body.clone());
                stored.edited = true;
                self.store.save_message(stored)?;
                let _ = self
                    .events_tx
                    .send(Event::MessageEdited { message_id: body.target_id, new_body });
            }
            None => {
                let mut buffer = self.edit_buffer.lock();
                buffer.insert(
                    body.target_id,
                    BufferedEdit { contact_id: contact_id.to_string(), new_body, buffered_at: ts },
                );
            }
        }
        Ok(())
    }

    fn apply_buffered_edit(&self, message_id: &str) -> Result<()> {
        let buffered = {
            let mut buffer = self.edit_buffer.lock();
            let cutoff = current_timestamp() - Config::global().edit_buffer_window_secs;
            buffer.retain(|_, edit| edit.buffered_at >= cutoff);
            buffer.remove(message_id)
        };
        let Some(edit) = buffered else { return Ok(()) };

        if let Some(mut stored) = self.store.load_message(message_id)? {
            if stored.from == edit.contact_id {
                stored.body = Some(edit.new_body.clone());
                stored.edited = true;
                self.store.save_message(stored)?;
                let _ = self.events_tx.send(Event::MessageEdited {
                    message_id: message_id.to_string(),
                    new_body: edit.new_body,
                });
            }
        }
        Ok(())
    }

    fn on_channel_delete(&self, contact_id: &str, target_id: String) -> Result<()> {
        let Some(mut stored) = self.store.load_message(&target_id)? else {
            return Ok(());
        };
        if stored.from != contact_id {
            warn!(
                target: "messaging::service",
                contact_id,
                target_id = %target_id,
                "delete rejected: sender does not match message origin"
            );
            return Ok(());
        }

        if Config::global().soft_delete_messages {
            stored.body = None;
            stored.deleted = true;
            self.store.save_message(stored)?;
        } else {
            self.store.delete_message(&target_id)?;
        }
        let _ = self.events_tx.send(Event::MessageDeleted { message_id: target_id });
        Ok(())
    }

    fn on_channel_reaction(&self, contact_id: &str, body: ReactionBody) -> Result<()> {
        match body.action {
            ReactionAction::Add => {
                self.store.add_reaction(Reaction {
                    message_id: body.target_id.clone(),
                    sender_id: contact_id.to_string(),
                    emoji: body.emoji.clone(),
                    added_at: current_timestamp(),
                })?;
                let _ = self.events_tx.send(Event::ReactionAdded {
                    message_id: body.target_id,
                    sender_id: contact_id.to_string(),
                    emoji: body.emoji,
                });
            }
            ReactionAction::Remove => {
                self.store.remove_reaction(&body.target_id, contact_id, &body.emoji)?;
                let _ = self.events_tx.send(Event::ReactionRemoved {
                    message_id: body.target_id,
                    sender_id: contact_id.to_string(),
                    emoji: body.emoji,
                });
            }
        }
        Ok(())
    }

    pub fn on_peer_state_changed(&self, contact_id: &str, state: PeerState) {
        let _ = self.events_tx.send(Event::PeerStateChanged { contact_id: contact_id.to_string(), state });
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    pub fn reset_session(&self, contact_id: &str) -> Result<()> {
        self.sessions.write().remove(contact_id);
        self.store.delete_session(contact_id)
    }

    /// Drop skipped-key entries older than the configured retention window,
    /// across every session currently loaded in memory.
    pub fn cleanup_stale_sessions(&self) {
        let max_age = Config::global().max_skipped_message_age_seconds;
        for slot in self.sessions.read().values() {
            slot.lock().cleanup_old_skipped_keys(max_age);
        }
    }

    fn ensure_initiator_session(&self, contact_id: &str) -> Result<(Arc<Mutex<Session<P>>>, bool)> {
        if let Some(slot) = self.get_or_load_session(contact_id)? {
            return Ok((slot, false));
        }

        let contact = self.load_contact(contact_id)?;
        let remote_ka_bytes = contact.ka_public_key.ok_or_else(|| {
            MessengerError::ValidationError(format!(
                "contact {} has no key-agreement public key on file",
                contact_id
            ))
        })?;
        let remote_bundle = X3DHLitePublicKey { ka_public: remote_ka_bytes.clone(), suite_id: P::suite_id() };
        let remote_identity = P::kem_public_key_from_bytes(remote_ka_bytes);

        let session = PeerSession::init_as_initiator(
            &self.identity.ka_private,
            &remote_bundle,
            &remote_identity,
            contact_id.to_string(),
        )
        .map_err(MessengerError::CryptoError)?;

        self.persist_session(contact_id, &session)?;
        let arc = Arc::new(Mutex::new(session));
        self.sessions.write().insert(contact_id.to_string(), arc.clone());
        Ok((arc, true))
    }

    fn get_or_load_session(&self, contact_id: &str) -> Result<Option<Arc<Mutex<Session<P>>>>> {
        if let Some(slot) = self.sessions.read().get(contact_id) {
            return Ok(Some(slot.clone()));
        }
        let Some(stored) = self.store.load_session(contact_id)? else { return Ok(None) };
        let serializable: SerializableSession = bincode::deserialize(&stored.session_data)
            .map_err(|e| MessengerError::Corrupted(format!("session deserialize failed: {}", e)))?;
        let ratchet = DoubleRatchetSession::<P>::from_serializable(serializable)
            .map_err(MessengerError::Corrupted)?;
        let session = PeerSession::from_messaging_session(contact_id.to_string(), ratchet);
        let arc = Arc::new(Mutex::new(session));
        self.sessions.write().insert(contact_id.to_string(), arc.clone());
        Ok(Some(arc))
    }

    fn persist_session(&self, contact_id: &str, session: &Session<P>) -> Result<()> {
        let serializable = session.messaging_session().to_serializable();
        let session_data = bincode::serialize(&serializable)
            .map_err(|e| MessengerError::SerializationError(e.to_string()))?;
        let created_at = self
            .store
            .load_session(contact_id)?
            .map(|existing| existing.created_at)
            .unwrap_or_else(current_timestamp);
        self.store.save_session(StoredSession {
            session_id: session.session_id().to_string(),
            contact_id: contact_id.to_string(),
            session_data,
            last_used: current_timestamp(),
            created_at,
        })
    }

    fn load_contact(&self, contact_id: &str) -> Result<StoredContact> {
        self.store
            .load_contact(contact_id)?
            .ok_or_else(|| MessengerError::NotFound(format!("contact {}", contact_id)))
    }

    fn build_header(message: &EncryptedRatchetMessage) -> RatchetHeader {
        RatchetHeader {
            dh_public_key: b64::url_encode(&message.dh_public_key),
            nonce: b64::url_encode(&message.nonce),
            message_number: message.message_number,
            previous_chain_length: message.previous_chain_length,
            suite_id: message.suite_id,
        }
    }

    fn wire_to_encrypted(ciphertext_b64: &str, header: &RatchetHeader) -> Result<EncryptedRatchetMessage> {
        let ciphertext = b64::decode(ciphertext_b64)
            .map_err(MessengerError::ValidationError)?;
        let dh_bytes = b64::url_decode(&header.dh_public_key).map_err(MessengerError::ValidationError)?;
        let dh_public_key: [u8; 32] = dh_bytes
            .try_into()
            .map_err(|_| MessengerError::ProtocolError("dh public key has the wrong length".to_string()))?;
        let nonce = b64::url_decode(&header.nonce).map_err(MessengerError::ValidationError)?;
        Ok(EncryptedRatchetMessage {
            dh_public_key,
            message_number: header.message_number,
            ciphertext,
            nonce,
            previous_chain_length: header.previous_chain_length,
            suite_id: header.suite_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::suites::classic::ClassicSuiteProvider;
    use crate::storage::memory::MemoryStore;

    type TestService = MessagingService<ClassicSuiteProvider>;

    fn make_service(name: &str) -> (TestService, mpsc::UnboundedReceiver<Event>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let identity = Arc::new(Identity::<ClassicSuiteProvider>::generate(&*store, &[1u8; 32], name).unwrap());
        let (peer, _peer_events) = PeerConnectionManager::new(vec!["stun:stun.l.google.com:19302".to_string()]);
        let signalling = Arc::new(SignallingClient::<ClassicSuiteProvider>::new("wss://example.invalid"));
        let (service, rx) = MessagingService::new(identity, store.clone(), Arc::new(peer), signalling);
        (service, rx, store)
    }

    fn link_contacts(
        alice: &TestService,
        alice_store: &Arc<dyn Store>,
        bob: &TestService,
        bob_store: &Arc<dyn Store>,
    ) {
        alice_store
            .save_contact(StoredContact {
                id: "bob".to_string(),
                signing_public_key: bob.identity.signing_public.clone(),
                ka_public_key: Some(bob.identity.ka_public.clone()),
                display_name: "bob".to_string(),
                nickname: None,
                verified: true,
                added_at: current_timestamp(),
                last_message_at: None,
            })
            .unwrap();
        bob_store
            .save_contact(StoredContact {
                id: "alice".to_string(),
                signing_public_key: alice.identity.signing_public.clone(),
                ka_public_key: Some(alice.identity.ka_public.clone()),
                display_name: "alice".to_string(),
                nickname: None,
                verified: true,
                added_at: current_timestamp(),
                last_message_at: None,
            })
            .unwrap();
    }

    #[test]
    fn first_text_bootstraps_a_session_and_decrypts_on_the_other_side() {
        let (alice, _alice_rx, alice_store) = make_service("alice");
        let (bob, _bob_rx, bob_store) = make_service("bob");
        link_contacts(&alice, &alice_store, &bob, &bob_store);

        let (stored, init_frame, text_frame) = alice.prepare_text("bob", "hello bob", None).unwrap();
        assert_eq!(stored.body.as_deref(), Some("hello bob"));
        assert!(init_frame.is_some());

        if let Frame::Text { id, ts, body } = text_frame {
            bob.on_channel_text("alice", id.clone(), ts, body).unwrap();
            let received = bob_store.load_message(&id).unwrap().unwrap();
            assert_eq!(received.body.as_deref(), Some("hello bob"));
            assert_eq!(received.from, "alice");
        } else {
            panic!("expected a text frame");
        }
    }

    #[test]
    fn edit_before_original_is_buffered_then_applied() {
        let (alice, _alice_rx, alice_store) = make_service("alice");
        let (bob, _bob_rx, bob_store) = make_service("bob");
        link_contacts(&alice, &alice_store, &bob, &bob_store);

        let (_, init_frame, text_frame) = alice.prepare_text("bob", "first draft", None).unwrap();
        let Frame::Text { id: message_id, ts, body } = text_frame.clone() else { panic!() };
        let _ = init_frame;

        // Edit arrives (via a direct crypto round trip) before the original text frame.
        let edit_frame = alice.prepare_edit("bob", &message_id, "final draft").unwrap();
        let Frame::Edit { ts: edit_ts, body: edit_body, .. } = edit_frame else { panic!() };
        bob.on_channel_edit("alice", edit_ts, edit_body).unwrap();

        assert!(bob_store.load_message(&message_id).unwrap().is_none());

        bob.on_channel_text("alice", message_id.clone(), ts, body).unwrap();
        let stored = bob_store.load_message(&message_id).unwrap().unwrap();
        assert_eq!(stored.body.as_deref(), Some("final draft"));
        assert!(stored.edited);
    }

    #[test]
    fn delete_by_non_sender_is_a_no_op() {
        let (alice, _alice_rx, alice_store) = make_service("alice");
        let (bob, _bob_rx, bob_store) = make_service("bob");
        link_contacts(&alice, &alice_store, &bob, &bob_store);

        let (_, init_frame, text_frame) = alice.prepare_text("bob", "hi", None).unwrap();
        let _ = init_frame;
        let Frame::Text { id, ts, body } = text_frame else { panic!() };
        bob.on_channel_text("alice", id.clone(), ts, body).unwrap();

        // Bob never sent this message; a delete frame claiming to be "from bob"
        // about alice's message is rejected without mutating the store.
        bob.on_channel_delete("someone-else", id.clone()).unwrap();
        let stored = bob_store.load_message(&id).unwrap().unwrap();
        assert!(!stored.deleted);
    }

    #[test]
    fn duplicate_reaction_is_deduplicated_by_the_store() {
        let (alice, _alice_rx, alice_store) = make_service("alice");
        let (bob, _bob_rx, bob_store) = make_service("bob");
        link_contacts(&alice, &alice_store, &bob, &bob_store);

        bob.on_channel_reaction(
            "alice",
            ReactionBody { target_id: "m1".to_string(), emoji: "👍".to_string(), action: ReactionAction::Add },
        )
        .unwrap();
        bob.on_channel_reaction(
            "alice",
            ReactionBody { target_id: "m1".to_string(), emoji: "👍".to_string(), action: ReactionAction::Add },
        )
        .unwrap();

        let reactions = bob_store.load_reactions("m1").unwrap();
        assert_eq!(reactions.len(), 1);
    }

    #[test]
    fn typing_throttle_drops_rapid_repeats() {
        let (alice, _alice_rx, alice_store) = make_service("alice");
        let (bob, _bob_rx, bob_store) = make_service("bob");
        link_contacts(&alice, &alice_store, &bob, &bob_store);

        let mut throttle = alice.typing_throttle.lock();
        let now = current_timestamp();
        throttle.insert("bob".to_string(), now);
        drop(throttle);

        // Immediately after marking "bob" as throttled, a second active=true
        // send would be suppressed; we assert on the throttle map directly
        // since `send_typing` itself requires a live data channel.
        let throttle = alice.typing_throttle.lock();
        assert_eq!(*throttle.get("bob").unwrap(), now);
    }
}
