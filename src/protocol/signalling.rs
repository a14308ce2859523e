//! Signalling client (spec component 4.E): one persistent WebSocket to a
//! relay that forwards envelopes addressed to a public key and broadcasts
//! presence. Runs on the caller's tokio runtime; callers drive it with
//! `connect()`/`send()`/`close()` and read inbound envelopes from the
//! channel returned by `connect()`.

use crate::config::Config;
use crate::crypto::provider::CryptoProvider;
use crate::protocol::messages::{
    auth_signature_message, envelope_kind, AuthChallengePayload, AuthResponsePayload,
    SignallingEnvelope,
};
use crate::utils::error::{MessengerError, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignallingState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

/// Signing identity the client authenticates with: `"sig-auth-v1" ‖
/// challenge ‖ server_timestamp` signed under the long-term signing key.
pub struct SignallingIdentity<P: CryptoProvider> {
    pub signing_private_key: P::SignaturePrivateKey,
    pub signing_public_key: P::SignaturePublicKey,
}

pub struct SignallingClient<P: CryptoProvider> {
    url: String,
    state: Arc<RwLock<SignallingState>>,
    outbound_tx: mpsc::UnboundedSender<SignallingEnvelope>,
    outbound_rx: RwLock<Option<mpsc::UnboundedReceiver<SignallingEnvelope>>>,
    shutdown: Arc<AtomicBool>,
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> SignallingClient<P> {
    pub fn new(url: impl Into<String>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            state: Arc::new(RwLock::new(SignallingState::Disconnected)),
            outbound_tx,
            outbound_rx: RwLock::new(Some(outbound_rx)),
            shutdown: Arc::new(AtomicBool::new(false)),
            _phantom: PhantomData,
        }
    }

    pub fn state(&self) -> SignallingState {
        *self.state.read()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queue an envelope for the outbound sender task. Never blocks; backed
    /// by an unbounded channel because `send_typing`/presence traffic is
    /// small and bursty, not a backpressure source worth modelling here
    /// (unlike the data channel in `peer`).
    pub fn send(&self, envelope: SignallingEnvelope) -> Result<()> {
        self.outbound_tx
            .send(envelope)
            .map_err(|_| MessengerError::TransportClosed("signalling sender task stopped".to_string()))
    }

    /// Connect and authenticate, spawning the reconnect-with-backoff loop.
    /// Returns a channel of inbound envelopes the caller should drain
    /// (offers, answers, ICE candidates, presence).
    pub fn connect(
        &self,
        identity: SignallingIdentity<P>,
    ) -> Result<mpsc::UnboundedReceiver<SignallingEnvelope>> {
        let mut outbound_rx = self
            .outbound_rx
            .write()
            .take()
            .ok_or_else(|| MessengerError::AlreadyExists("signalling client already connected".to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let url = self.url.clone();
        let state = self.state.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut backoff_ms = Config::global().websocket_retry_initial_ms;
            let max_backoff_ms = Config::global().websocket_retry_max_ms;

            while !shutdown.load(Ordering::Relaxed) {
                *state.write() = SignallingState::Connecting;
                debug!(target: "protocol::signalling", url = %url, "connecting");

                match run_connection::<P>(&url, &identity, &state, &mut outbound_rx, &inbound_tx, &shutdown)
                    .await
                {
                    Ok(()) => {
                        info!(target: "protocol::signalling", "connection closed cleanly");
                    }
                    Err(e) => {
                        warn!(target: "protocol::signalling", error = %e, "connection failed");
                    }
                }

                *state.write() = SignallingState::Disconnected;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                let jitter = rand::thread_rng().gen_range(0..=(backoff_ms / 4).max(1));
                tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
                backoff_ms = (backoff_ms * 2).min(max_backoff_ms);
            }
        });

        Ok(inbound_rx)
    }

    /// Request teardown. In-flight sends are given up to
    /// `signalling_send_grace_ms` to complete before the socket closes.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

async fn run_connection<P: CryptoProvider>(
    url: &str,
    identity: &SignallingIdentity<P>,
    state: &Arc<RwLock<SignallingState>>,
    outbound_rx: &mut mpsc::UnboundedReceiver<SignallingEnvelope>,
    inbound_tx: &mpsc::UnboundedSender<SignallingEnvelope>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| MessengerError::NetworkError(format!("websocket connect failed: {}", e)))?;
    let (mut write, mut read) = ws_stream.split();

    *state.write() = SignallingState::Authenticating;

    // Wait for the server's auth challenge before doing anything else.
    let challenge = loop {
        match read.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let envelope: SignallingEnvelope = serde_json::from_str(&text)
                    .map_err(|e| MessengerError::ProtocolError(format!("bad envelope: {}", e)))?;
                if envelope.kind == envelope_kind::AUTH_CHALLENGE {
                    let payload: AuthChallengePayload = serde_json::from_value(envelope.payload)
                        .map_err(|e| MessengerError::ProtocolError(format!("bad auth-challenge: {}", e)))?;
                    break payload;
                }
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(MessengerError::NetworkError(e.to_string())),
            None => return Err(MessengerError::TransportClosed("socket closed before auth".to_string())),
        }
    };

    let message = auth_signature_message(&challenge.challenge, challenge.server_timestamp);
    let signature = P::sign(&identity.signing_private_key, &message)?;

    let response = SignallingEnvelope::new(
        envelope_kind::AUTH_RESPONSE,
        serde_json::to_value(AuthResponsePayload {
            signing_public_key: hex::encode(identity.signing_public_key.as_ref()),
            signature: hex::encode(signature),
        })
        .unwrap(),
    );
    write
        .send(WsMessage::Text(serde_json::to_string(&response).unwrap()))
        .await
        .map_err(|e| MessengerError::NetworkError(e.to_string()))?;

    *state.write() = SignallingState::Connected;
    info!(target: "protocol::signalling", "authenticated");

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(envelope) => {
                        let json = serde_json::to_string(&envelope)
                            .map_err(|e| MessengerError::SerializationError(e.to_string()))?;
                        write.send(WsMessage::Text(json)).await
                            .map_err(|e| MessengerError::NetworkError(e.to_string()))?;
                    }
                    None => return Ok(()),
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<SignallingEnvelope>(&text) {
                            Ok(envelope) => { let _ = inbound_tx.send(envelope); }
                            Err(e) => warn!(target: "protocol::signalling", error = %e, "dropping malformed envelope"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(MessengerError::NetworkError(e.to_string())),
                }
            }
        }

        if shutdown.load(Ordering::Relaxed) {
            let grace = Duration::from_millis(Config::global().signalling_send_grace_ms);
            tokio::time::timeout(grace, write.close()).await.ok();
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::suites::classic::ClassicSuiteProvider;

    #[test]
    fn fresh_client_starts_disconnected() {
        let client = SignallingClient::<ClassicSuiteProvider>::new("wss://example.invalid");
        assert_eq!(client.state(), SignallingState::Disconnected);
    }

    #[test]
    fn send_before_connect_is_queued_not_rejected() {
        let client = SignallingClient::<ClassicSuiteProvider>::new("wss://example.invalid");
        let envelope = SignallingEnvelope::new(envelope_kind::PRESENCE, serde_json::json!({}));
        assert!(client.send(envelope).is_ok());
    }
}
