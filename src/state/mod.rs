//! Process-wide application lifecycle (spec §9: "global singletons map to
//! process-wide state with an explicit lifecycle"). [`MessengerApp::start`]
//! is the composition root: it unseals the platform vault, opens the
//! encrypted store, loads or bootstraps the identity, and wires the peer
//! connection manager, the signalling client, the messaging service and
//! the file-transfer manager behind one set of handles. [`MessengerApp::stop`]
//! tears all of it down; nothing on this type is touched again afterwards.
//!
//! This module also owns the message-channel router (spec component 4.G):
//! the background task that drains inbound data-channel frames and
//! dispatches each to the messaging service or the transfer manager by
//! frame type, and the tasks that turn signalling envelopes, peer state
//! changes and transfer progress into the facade's unified event stream.

use crate::api::events::ApiEvent;
use crate::config::Config;
use crate::crypto::suites::classic::ClassicSuiteProvider;
use crate::identity::Identity;
use crate::messaging::events::Event as MessagingEvent;
use crate::messaging::service::MessagingService;
use crate::protocol::messages::{
    envelope_kind, IceCandidatePayload, PresencePayload, SdpPayload, SignallingEnvelope,
};
use crate::protocol::peer::{PeerConnectionManager, PeerEvent};
use crate::protocol::signalling::{SignallingClient, SignallingIdentity, SignallingState};
use crate::protocol::wire::{decode_frame, Frame};
use crate::protocol::messages::PresenceStatus;
use crate::storage::{EncryptedStore, Store};
use crate::transfer::TransferManager;
use crate::utils::error::{MessengerError, Result};
use crate::vault;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The crypto suite this build ships with. A hybrid/post-quantum suite
/// would plug in here without touching anything above `state`/`api`.
pub type Provider = ClassicSuiteProvider;

/// There is exactly one local user per store; `StoredAppMetadata` and
/// `StoredPrivateKeys` are keyed by this constant rather than a real id.
const LOCAL_USER_ID: &str = "self";

/// Running handles for one desktop process. Constructed once by
/// [`MessengerApp::start`]; every facade request goes through a field here.
pub struct MessengerApp {
    data_dir: PathBuf,
    store: Arc<dyn Store>,
    master_key: [u8; 32],
    identity: RwLock<Arc<Identity<Provider>>>,
    peer: Arc<PeerConnectionManager>,
    signalling: Arc<SignallingClient<Provider>>,
    messaging: Arc<MessagingService<Provider>>,
    transfer: Arc<TransferManager<Provider>>,
    /// Transient per-contact presence (spec §3: not persisted, driven by
    /// the signalling client's `presence` envelopes).
    presence: RwLock<HashMap<String, PresenceStatus>>,
    shutdown: Arc<AtomicBool>,
}

impl MessengerApp {
    /// Bring up the whole stack against `data_dir` (holding `data.db`,
    /// `master.key` and the `files/` directory) and connect to
    /// `signaling_server`. Returns the app handle plus the facade's single
    /// unified event stream.
    pub async fn start(
        data_dir: PathBuf,
        signaling_server: impl Into<String>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ApiEvent>)> {
        if !Config::is_initialized() {
            let _ = Config::init_from_env();
        }

        std::fs::create_dir_all(&data_dir)
            .map_err(|e| MessengerError::StorageError(format!("create data directory: {}", e)))?;

        let master_key = vault::master_key::load_or_create(data_dir.join("master.key"))?;
        let store: Arc<dyn Store> =
            Arc::new(EncryptedStore::open_or_create(data_dir.join("data.db"), master_key)?);

        let identity = match Identity::<Provider>::load(store.as_ref(), &master_key)? {
            Some(identity) => identity,
            // First run: bootstrap with an empty display name. The UI sets
            // a real one afterwards through `update_display_name`, so no
            // key material is ever regenerated just to pick a name.
            None => Identity::<Provider>::generate(store.as_ref(), &master_key, "")?,
        };
        let identity = Arc::new(identity);

        let (peer, peer_events_rx) = PeerConnectionManager::new(Config::global().ice_servers.clone());
        let peer = Arc::new(peer);

        let signalling = Arc::new(SignallingClient::<Provider>::new(signaling_server.into()));

        let (messaging, messaging_events_rx) =
            MessagingService::new(identity.clone(), store.clone(), peer.clone(), signalling.clone());
        let messaging = Arc::new(messaging);

        let (transfer, transfer_events_rx) = TransferManager::new(
            store.clone(),
            peer.clone(),
            messaging.clone(),
            data_dir.join("files"),
            master_key,
        );
        let transfer = Arc::new(transfer);

        let app = Arc::new(Self {
            data_dir,
            store,
            master_key,
            identity: RwLock::new(identity.clone()),
            peer,
            signalling: signalling.clone(),
            messaging: messaging.clone(),
            transfer,
            presence: RwLock::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        app.bootstrap_metadata(signalling.url())?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let signalling_inbound_rx = signalling.connect(SignallingIdentity {
            signing_private_key: identity.signing_private.clone(),
            signing_public_key: identity.signing_public.clone(),
        })?;

        app.spawn_messaging_event_bridge(messaging_events_rx, events_tx.clone());
        app.spawn_transfer_event_bridge(transfer_events_rx, events_tx.clone());
        app.spawn_frame_router(peer_events_rx, events_tx.clone());
        app.spawn_signalling_inbound(signalling_inbound_rx, events_tx.clone());
        app.spawn_connection_poller(events_tx);

        Ok((app, events_rx))
    }

    /// Construct an app without touching the vault, disk or network — used
    /// by the facade's test suite to exercise everything that doesn't
    /// require a real peer connection (identity, contacts, messages,
    /// settings, reactions, file records).
    #[cfg(test)]
    pub(crate) fn start_in_memory_for_tests(display_name: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<ApiEvent>) {
        if !Config::is_initialized() {
            let _ = Config::init();
        }
        let master_key = [0u8; 32];
        let store: Arc<dyn Store> = Arc::new(crate::storage::memory::MemoryStore::new());
        let identity =
            Arc::new(Identity::<Provider>::generate(store.as_ref(), &master_key, display_name).unwrap());

        let (peer, _peer_events_rx) = PeerConnectionManager::new(Config::global().ice_servers.clone());
        let peer = Arc::new(peer);
        let signalling = Arc::new(SignallingClient::<Provider>::new("wss://example.invalid"));
        let (messaging, _messaging_events_rx) =
            MessagingService::new(identity.clone(), store.clone(), peer.clone(), signalling.clone());
        let messaging = Arc::new(messaging);
        let (transfer, _transfer_events_rx) = TransferManager::new(
            store.clone(),
            peer.clone(),
            messaging.clone(),
            std::env::temp_dir().join(format!("lychee-test-files-{}", crate::utils::uuid::generate_v4())),
            master_key,
        );
        let transfer = Arc::new(transfer);

        let app = Arc::new(Self {
            data_dir: PathBuf::new(),
            store,
            master_key,
            identity: RwLock::new(identity),
            peer,
            signalling,
            messaging,
            transfer,
            presence: RwLock::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        app.bootstrap_metadata("wss://example.invalid").expect("in-memory store never fails");
        let (_tx, rx) = mpsc::unbounded_channel();
        (app, rx)
    }

    /// `Identity::generate` already seeds default metadata on first run, but
    /// with an empty `signaling_server` (it has no URL to put there). Stamp
    /// the URL this process actually connected with into whatever metadata
    /// exists, so the facade's `get_signaling_server` reflects reality
    /// instead of the placeholder from identity bootstrap.
    fn bootstrap_metadata(&self, signaling_server: &str) -> Result<()> {
        let mut metadata = match self.store.load_metadata(LOCAL_USER_ID)? {
            Some(metadata) => metadata,
            None => crate::storage::models::StoredAppMetadata {
                user_id: LOCAL_USER_ID.to_string(),
                display_name: self.identity().display_name.clone(),
                signaling_server: String::new(),
                user_status: crate::storage::models::UserStatus::Online,
                notifications_enabled: true,
                notifications_messages: true,
                notifications_calls: true,
                update_channel: "stable".to_string(),
                theme: "system".to_string(),
                soft_delete_messages: false,
                last_sync: crate::utils::time::current_timestamp(),
            },
        };
        if metadata.signaling_server.is_empty() {
            metadata.signaling_server = signaling_server.to_string();
            self.store.save_metadata(metadata)?;
        }
        Ok(())
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn master_key(&self) -> &[u8; 32] {
        &self.master_key
    }

    pub(crate) fn identity(&self) -> Arc<Identity<Provider>> {
        self.identity.read().clone()
    }

    pub(crate) fn set_identity(&self, identity: Arc<Identity<Provider>>) {
        *self.identity.write() = identity;
    }

    pub(crate) fn peer(&self) -> &Arc<PeerConnectionManager> {
        &self.peer
    }

    pub(crate) fn signalling(&self) -> &Arc<SignallingClient<Provider>> {
        &self.signalling
    }

    pub(crate) fn messaging(&self) -> &Arc<MessagingService<Provider>> {
        &self.messaging
    }

    pub(crate) fn transfer(&self) -> &Arc<TransferManager<Provider>> {
        &self.transfer
    }

    pub(crate) fn presence_of(&self, contact_id: &str) -> PresenceStatus {
        self.presence.read().get(contact_id).copied().unwrap_or(PresenceStatus::Unknown)
    }

    /// Request teardown: stop the signalling reconnect loop and the
    /// background routing tasks, and close every open peer connection.
    /// Per spec §4.E, in-flight signalling sends are given a bounded grace
    /// period before the socket actually closes.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.signalling.close();
        for contact in self.store.load_all_contacts().unwrap_or_default() {
            let _ = self.peer.close(&contact.id).await;
        }
        info!(target: "state", "messenger app stopped");
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Background bridges: each turns one component's events into the
    // facade's single ApiEvent stream (spec §9's "multi-producer
    // single-consumer stream per logical channel").
    // ------------------------------------------------------------------

    fn spawn_messaging_event_bridge(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<MessagingEvent>,
        tx: mpsc::UnboundedSender<ApiEvent>,
    ) {
        let app = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if app.is_shutting_down() {
                    break;
                }
                let mapped = match &event {
                    MessagingEvent::PeerStateChanged { contact_id, state } => {
                        ApiEvent::P2pState { contact_id: contact_id.clone(), state: *state }
                    }
                    MessagingEvent::PresenceChanged { contact_id, status } => {
                        ApiEvent::Presence { contact_id: contact_id.clone(), status: *status }
                    }
                    _ => ApiEvent::Message(event),
                };
                let _ = tx.send(mapped);
            }
        });
    }

    fn spawn_transfer_event_bridge(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<crate::transfer::TransferEvent>,
        tx: mpsc::UnboundedSender<ApiEvent>,
    ) {
        let app = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if app.is_shutting_down() {
                    break;
                }
                let _ = tx.send(ApiEvent::from(event));
            }
        });
    }

    /// The message channel router (spec component 4.G): drains inbound
    /// frame bytes, decodes them once, and dispatches by type to whichever
    /// subsystem owns that frame — file-transfer frames never reach the
    /// messaging service, matching the warning `MessagingService::handle_frame`
    /// logs if one slips through.
    fn spawn_frame_router(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<PeerEvent>,
        tx: mpsc::UnboundedSender<ApiEvent>,
    ) {
        let app = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if app.is_shutting_down() {
                    break;
                }
                match event {
                    PeerEvent::StateChanged { contact_id, state } => {
                        app.messaging.on_peer_state_changed(&contact_id, state);
                    }
                    PeerEvent::FrameReceived { contact_id, bytes } => {
                        app.route_inbound_frame(&contact_id, &bytes).await;
                    }
                    PeerEvent::IceCandidateGathered { contact_id, candidate } => {
                        if let Err(e) = app.relay_local_candidate(&contact_id, candidate) {
                            warn!(target: "state", contact_id, error = %e, "failed to relay ICE candidate");
                        }
                    }
                }
            }
        });
    }

    async fn route_inbound_frame(&self, contact_id: &str, bytes: &[u8]) {
        let frame = match decode_frame(bytes) {
            Ok((frame, _consumed)) => frame,
            Err(e) => {
                warn!(target: "state", contact_id, error = %e, "dropping malformed frame");
                return;
            }
        };
        let result = match &frame {
            Frame::FileOffer { .. } | Frame::FileChunk { .. } | Frame::FileAck { .. } | Frame::FileCancel { .. } => {
                self.transfer.handle_frame(contact_id, frame).await
            }
            _ => self.messaging.handle_frame(contact_id, frame).await,
        };
        if let Err(e) = result {
            warn!(target: "state", contact_id, error = %e, "frame handling failed");
        }
    }

    fn relay_local_candidate(
        &self,
        contact_id: &str,
        candidate: webrtc::ice_transport::ice_candidate::RTCIceCandidateInit,
    ) -> Result<()> {
        let contact = self
            .store
            .load_contact(contact_id)?
            .ok_or_else(|| MessengerError::NotFound(format!("contact {}", contact_id)))?;
        let envelope = SignallingEnvelope::new(
            envelope_kind::ICE_CANDIDATE,
            serde_json::to_value(IceCandidatePayload {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
            })
            .map_err(|e| MessengerError::SerializationError(e.to_string()))?,
        )
        .to(hex::encode(&contact.signing_public_key));
        self.signalling.send(envelope)
    }

    /// Drains offers/answers/ICE candidates/presence off the signalling
    /// socket. Auth is handled entirely inside `SignallingClient::connect`;
    /// this task only ever sees envelopes meant for the application layer.
    fn spawn_signalling_inbound(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<SignallingEnvelope>,
        tx: mpsc::UnboundedSender<ApiEvent>,
    ) {
        let app = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if app.is_shutting_down() {
                    break;
                }
                app.handle_signalling_envelope(envelope, &tx).await;
            }
        });
    }

    async fn handle_signalling_envelope(&self, envelope: SignallingEnvelope, tx: &mpsc::UnboundedSender<ApiEvent>) {
        let Some(from) = envelope.from.clone() else {
            debug!(target: "state", kind = %envelope.kind, "signalling envelope with no sender, dropping");
            return;
        };
        let contact_id = match self.find_contact_id_by_signing_key_hex(&from) {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(target: "state", from = %from, "signalling envelope from an unknown contact");
                return;
            }
            Err(e) => {
                warn!(target: "state", error = %e, "failed to resolve signalling sender");
                return;
            }
        };

        let result = match envelope.kind.as_str() {
            envelope_kind::OFFER => self.handle_offer_envelope(&contact_id, envelope).await,
            envelope_kind::ANSWER => self.handle_answer_envelope(&contact_id, envelope).await,
            envelope_kind::ICE_CANDIDATE => self.handle_candidate_envelope(&contact_id, envelope).await,
            envelope_kind::PRESENCE => {
                self.handle_presence_envelope(&contact_id, envelope, tx);
                Ok(())
            }
            other => {
                debug!(target: "state", kind = other, "unrecognised signalling envelope type, dropping");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(target: "state", contact_id, error = %e, "failed to handle signalling envelope");
        }
    }

    async fn handle_offer_envelope(&self, contact_id: &str, envelope: SignallingEnvelope) -> Result<()> {
        let payload: SdpPayload = serde_json::from_value(envelope.payload)
            .map_err(|e| MessengerError::ProtocolError(format!("malformed offer payload: {}", e)))?;
        self.messaging.handle_offer(contact_id, &payload.sdp).await
    }

    async fn handle_answer_envelope(&self, contact_id: &str, envelope: SignallingEnvelope) -> Result<()> {
        let payload: SdpPayload = serde_json::from_value(envelope.payload)
            .map_err(|e| MessengerError::ProtocolError(format!("malformed answer payload: {}", e)))?;
        self.messaging.handle_answer(contact_id, &payload.sdp).await
    }

    async fn handle_candidate_envelope(&self, contact_id: &str, envelope: SignallingEnvelope) -> Result<()> {
        let payload: IceCandidatePayload = serde_json::from_value(envelope.payload)
            .map_err(|e| MessengerError::ProtocolError(format!("malformed ice candidate payload: {}", e)))?;
        self.messaging
            .handle_candidate(
                contact_id,
                webrtc::ice_transport::ice_candidate::RTCIceCandidateInit {
                    candidate: payload.candidate,
                    sdp_mid: payload.sdp_mid,
                    sdp_mline_index: payload.sdp_mline_index,
                    username_fragment: None,
                },
            )
            .await
    }

    fn handle_presence_envelope(
        &self,
        contact_id: &str,
        envelope: SignallingEnvelope,
        tx: &mpsc::UnboundedSender<ApiEvent>,
    ) {
        let Ok(payload) = serde_json::from_value::<PresencePayload>(envelope.payload) else {
            return;
        };
        self.presence.write().insert(contact_id.to_string(), payload.status);
        let _ = tx.send(ApiEvent::Presence { contact_id: contact_id.to_string(), status: payload.status });
    }

    fn find_contact_id_by_signing_key_hex(&self, signing_key_hex: &str) -> Result<Option<String>> {
        let needle = hex::decode(signing_key_hex)
            .map_err(|e| MessengerError::ValidationError(format!("invalid signing key hex: {}", e)))?;
        for contact in self.store.load_all_contacts()? {
            if contact.signing_public_key == needle {
                return Ok(Some(contact.id));
            }
        }
        Ok(None)
    }

    /// Polls the signalling client's connection state and pushes a
    /// `connection` event on every transition. `SignallingClient` doesn't
    /// expose its own state-change stream (only the current value), so a
    /// short poll is the cheapest way to surface it without adding another
    /// channel to a type that already owns the reconnect loop.
    fn spawn_connection_poller(self: &Arc<Self>, tx: mpsc::UnboundedSender<ApiEvent>) {
        let app = self.clone();
        tokio::spawn(async move {
            let mut last = SignallingState::Disconnected;
            let _ = tx.send(ApiEvent::Connection(last));
            while !app.is_shutting_down() {
                let current = app.signalling.state();
                if current != last {
                    last = current;
                    let _ = tx.send(ApiEvent::Connection(current));
                }
                tokio::time::sleep(std::time::Duration::from_millis(
                    Config::global().connection_poll_interval_ms,
                ))
                .await;
            }
        });
    }
}
