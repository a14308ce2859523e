//! Peer connection manager (spec component 4.F): one ICE/DTLS/SCTP
//! `RTCPeerConnection` per contact, each carrying a single reliable-ordered
//! data channel named `messages`. ICE is non-trickle: callers wait for
//! gathering to finish before handing the local description to signalling.

use crate::config::Config;
use crate::utils::error::{MessengerError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

const DATA_CHANNEL_LABEL: &str = "messages";

fn wire_drain_notify(channel: &Arc<RTCDataChannel>, drained: Arc<Notify>) {
    channel.on_buffered_amount_low(Box::new(move || {
        drained.notify_waiters();
        Box::pin(async {})
    }));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    New = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    Failed = 4,
    Closed = 5,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerState::New,
            1 => PeerState::Connecting,
            2 => PeerState::Connected,
            3 => PeerState::Disconnected,
            4 => PeerState::Failed,
            _ => PeerState::Closed,
        }
    }
}

/// What a peer connection reports back to the messaging service: inbound
/// frame bytes off the data channel, and state transitions for the facade's
/// `p2p_state` event.
pub enum PeerEvent {
    StateChanged { contact_id: String, state: PeerState },
    FrameReceived { contact_id: String, bytes: Vec<u8> },
    IceCandidateGathered { contact_id: String, candidate: RTCIceCandidateInit },
}

struct PeerEntry {
    connection: Arc<RTCPeerConnection>,
    data_channel: RwLock<Option<Arc<RTCDataChannel>>>,
    state: Arc<AtomicU8>,
    /// Notified whenever the data channel's buffered amount drops back to
    /// the low watermark, so `send_ready` doesn't have to busy-poll.
    drained: Arc<Notify>,
}

/// Owns one `RTCPeerConnection` per contact behind a single lock over the
/// table, matching the manager-wide-lock concurrency model: callers don't
/// hold the table lock across awaits, only to look up or insert an entry.
pub struct PeerConnectionManager {
    connections: RwLock<HashMap<String, Arc<PeerEntry>>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    ice_servers: Vec<RTCIceServer>,
}

impl PeerConnectionManager {
    pub fn new(ice_servers: Vec<String>) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let servers = ice_servers
            .into_iter()
            .map(|url| RTCIceServer {
                urls: vec![url],
                ..Default::default()
            })
            .collect();
        (
            Self {
                connections: RwLock::new(HashMap::new()),
                events_tx,
                ice_servers: servers,
            },
            events_rx,
        )
    }

    pub fn state_of(&self, contact_id: &str) -> Option<PeerState> {
        self.connections
            .read()
            .get(contact_id)
            .map(|entry| PeerState::from_u8(entry.state.load(Ordering::Relaxed)))
    }

    async fn build_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MessengerError::NetworkError(format!("media engine setup failed: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MessengerError::NetworkError(format!("interceptor setup failed: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let connection = api
            .new_peer_connection(config)
            .await
            .map_err(|e| MessengerError::NetworkError(format!("peer connection setup failed: {}", e)))?;

        Ok(Arc::new(connection))
    }

    fn wire_connection_callbacks(
        &self,
        contact_id: &str,
        connection: &Arc<RTCPeerConnection>,
        state: Arc<AtomicU8>,
    ) {
        let events_tx = self.events_tx.clone();
        let cid = contact_id.to_string();
        connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events_tx = events_tx.clone();
            let cid = cid.clone();
            let state = state.clone();
            Box::pin(async move {
                let mapped = match s {
                    RTCPeerConnectionState::New => PeerState::New,
                    RTCPeerConnectionState::Connecting => PeerState::Connecting,
                    RTCPeerConnectionState::Connected => PeerState::Connected,
                    RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                    RTCPeerConnectionState::Failed => PeerState::Failed,
                    RTCPeerConnectionState::Closed => PeerState::Closed,
                    _ => return,
                };
                state.store(mapped as u8, Ordering::Relaxed);
                let _ = events_tx.send(PeerEvent::StateChanged { contact_id: cid, state: mapped });
            })
        }));

        let events_tx = self.events_tx.clone();
        let cid = contact_id.to_string();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events_tx = events_tx.clone();
            let cid = cid.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                if let Ok(init) = candidate.to_json() {
                    let _ = events_tx.send(PeerEvent::IceCandidateGathered { contact_id: cid, candidate: init });
                }
            })
        }));
    }

    fn wire_data_channel(&self, contact_id: &str, entry: Arc<PeerEntry>, channel: Arc<RTCDataChannel>) {
        let events_tx = self.events_tx.clone();
        let cid = contact_id.to_string();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let events_tx = events_tx.clone();
            let cid = cid.clone();
            Box::pin(async move {
                let _ = events_tx.send(PeerEvent::FrameReceived { contact_id: cid, bytes: msg.data.to_vec() });
            })
        }));

        let low = Config::global().backpressure_low_watermark as u64;
        channel.set_buffered_amount_low_threshold(low);
        wire_drain_notify(&channel, entry.drained.clone());

        *entry.data_channel.write() = Some(channel);
    }

    /// Create the offerer side: a fresh connection, the `messages` data
    /// channel, and a local offer. ICE is non-trickle, so the returned SDP
    /// already has all candidates gathered (the `IceCandidateGathered`
    /// events are still emitted per-candidate for callers that want them
    /// sooner, but signalling only needs the final SDP blob).
    pub async fn create_offer(&self, contact_id: &str) -> Result<String> {
        let connection = self.build_connection().await?;
        let state = Arc::new(AtomicU8::new(PeerState::New as u8));
        self.wire_connection_callbacks(contact_id, &connection, state.clone());

        let entry = Arc::new(PeerEntry {
            connection: connection.clone(),
            data_channel: RwLock::new(None),
            state,
            drained: Arc::new(Notify::new()),
        });

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = connection
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await
            .map_err(|e| MessengerError::NetworkError(format!("data channel create failed: {}", e)))?;
        self.wire_data_channel(contact_id, entry.clone(), channel);

        let offer = connection
            .create_offer(None)
            .await
            .map_err(|e| MessengerError::NetworkError(format!("offer creation failed: {}", e)))?;
        let mut gather_complete = connection.gathering_complete_promise().await;
        connection
            .set_local_description(offer)
            .await
            .map_err(|e| MessengerError::NetworkError(format!("set local description failed: {}", e)))?;
        let _ = gather_complete.recv().await;

        self.connections.write().insert(contact_id.to_string(), entry);

        let local_desc = connection
            .local_description()
            .await
            .ok_or_else(|| MessengerError::NetworkError("no local description after gathering".to_string()))?;
        Ok(local_desc.sdp)
    }

    /// Create the answerer side from a received offer SDP, non-trickle:
    /// waits for gathering to complete before returning the answer.
    pub async fn accept_offer(&self, contact_id: &str, offer_sdp: &str) -> Result<String> {
        let connection = self.build_connection().await?;
        let state = Arc::new(AtomicU8::new(PeerState::New as u8));
        self.wire_connection_callbacks(contact_id, &connection, state.clone());

        let entry = Arc::new(PeerEntry {
            connection: connection.clone(),
            data_channel: RwLock::new(None),
            state,
            drained: Arc::new(Notify::new()),
        });

        let events_tx = self.events_tx.clone();
        let cid = contact_id.to_string();
        let entry_for_dc = entry.clone();
        let manager_channel_label = DATA_CHANNEL_LABEL;
        connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events_tx = events_tx.clone();
            let cid = cid.clone();
            let entry_for_dc = entry_for_dc.clone();
            Box::pin(async move {
                if channel.label() != manager_channel_label {
                    return;
                }
                let low = Config::global().backpressure_low_watermark as u64;
                channel.set_buffered_amount_low_threshold(low);
                wire_drain_notify(&channel, entry_for_dc.drained.clone());
                let events_tx2 = events_tx.clone();
                let cid2 = cid.clone();
                channel.on_message(Box::new(move |msg: DataChannelMessage| {
                    let events_tx2 = events_tx2.clone();
                    let cid2 = cid2.clone();
                    Box::pin(async move {
                        let _ = events_tx2.send(PeerEvent::FrameReceived { contact_id: cid2, bytes: msg.data.to_vec() });
                    })
                }));
                *entry_for_dc.data_channel.write() = Some(channel);
            })
        }));

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| MessengerError::ProtocolError(format!("invalid offer sdp: {}", e)))?;
        connection
            .set_remote_description(offer)
            .await
            .map_err(|e| MessengerError::NetworkError(format!("set remote description failed: {}", e)))?;

        let answer = connection
            .create_answer(None)
            .await
            .map_err(|e| MessengerError::NetworkError(format!("answer creation failed: {}", e)))?;
        let mut gather_complete = connection.gathering_complete_promise().await;
        connection
            .set_local_description(answer)
            .await
            .map_err(|e| MessengerError::NetworkError(format!("set local description failed: {}", e)))?;
        let _ = gather_complete.recv().await;

        self.connections.write().insert(contact_id.to_string(), entry);

        let local_desc = connection
            .local_description()
            .await
            .ok_or_else(|| MessengerError::NetworkError("no local description after gathering".to_string()))?;
        Ok(local_desc.sdp)
    }

    /// Apply a received answer to the offerer's connection.
    pub async fn handle_answer(&self, contact_id: &str, answer_sdp: &str) -> Result<()> {
        let entry = self.lookup(contact_id)?;
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| MessengerError::ProtocolError(format!("invalid answer sdp: {}", e)))?;
        entry
            .connection
            .set_remote_description(answer)
            .await
            .map_err(|e| MessengerError::NetworkError(format!("set remote description failed: {}", e)))
    }

    /// Only meaningful when trickle ICE is used by the remote end; accepted
    /// defensively even though this side gathers non-trickle.
    pub async fn add_ice_candidate(&self, contact_id: &str, candidate: RTCIceCandidateInit) -> Result<()> {
        let entry = self.lookup(contact_id)?;
        entry
            .connection
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| MessengerError::NetworkError(format!("add ice candidate failed: {}", e)))
    }

    /// Send one frame's encoded bytes over the data channel. Callers should
    /// await `send_ready` first if the channel was reported over the high
    /// watermark.
    pub async fn send(&self, contact_id: &str, bytes: Vec<u8>) -> Result<()> {
        let entry = self.lookup(contact_id)?;
        let channel = entry
            .data_channel
            .read()
            .clone()
            .ok_or_else(|| MessengerError::NetworkError("data channel not yet open".to_string()))?;

        let buffered = channel.buffered_amount().await;
        if buffered > Config::global().backpressure_high_watermark {
            return Err(MessengerError::Backpressure(format!(
                "data channel buffered_amount {} exceeds high watermark",
                buffered
            )));
        }

        channel
            .send(&Bytes::from(bytes))
            .await
            .map_err(|e| MessengerError::NetworkError(format!("data channel send failed: {}", e)))?;
        Ok(())
    }

    pub async fn close(&self, contact_id: &str) -> Result<()> {
        let entry = self.connections.write().remove(contact_id);
        if let Some(entry) = entry {
            entry.state.store(PeerState::Closed as u8, Ordering::Relaxed);
            entry
                .connection
                .close()
                .await
                .map_err(|e| MessengerError::NetworkError(format!("close failed: {}", e)))?;
            info!(target: "protocol::peer", contact_id, "peer connection closed");
        }
        Ok(())
    }

    /// Resolve once the data channel's buffered amount has drained back to
    /// the low watermark, or once `backpressure_wait_timeout_ms` elapses.
    /// Callers that received `Backpressure` from `send` should await this
    /// before retrying instead of spinning.
    pub async fn send_ready(&self, contact_id: &str) -> Result<()> {
        let entry = self.lookup(contact_id)?;
        let channel = entry
            .data_channel
            .read()
            .clone()
            .ok_or_else(|| MessengerError::NetworkError("data channel not yet open".to_string()))?;

        let low = Config::global().backpressure_low_watermark as u64;
        let timeout = std::time::Duration::from_millis(Config::global().backpressure_wait_timeout_ms);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if channel.buffered_amount().await <= low {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(MessengerError::Timeout(format!(
                    "data channel to {} did not drain below low watermark",
                    contact_id
                )));
            }
            if tokio::time::timeout(remaining, entry.drained.notified()).await.is_err() {
                return Err(MessengerError::Timeout(format!(
                    "data channel to {} did not drain below low watermark",
                    contact_id
                )));
            }
        }
    }

    fn lookup(&self, contact_id: &str) -> Result<Arc<PeerEntry>> {
        self.connections
            .read()
            .get(contact_id)
            .cloned()
            .ok_or_else(|| MessengerError::NotFound(format!("no peer connection for {}", contact_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_manager_has_no_connections() {
        let (manager, _rx) = PeerConnectionManager::new(vec!["stun:stun.l.google.com:19302".to_string()]);
        assert!(manager.state_of("nobody").is_none());
    }
}
