// Signalling envelope types (spec §4.E / §6). The signalling server only
// ever sees these; it forwards `payload` opaquely for every type except the
// auth handshake it must itself verify.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Presence shown by a contact, driven by the signalling client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Invisible,
    Offline,
    Unknown,
}

/// `{type, to?, from?, payload}` carried over the signalling WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignallingEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub payload: Value,
}

impl SignallingEnvelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            to: None,
            from: None,
            payload,
        }
    }

    pub fn to(mut self, public_key_hex: impl Into<String>) -> Self {
        self.to = Some(public_key_hex.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthChallengePayload {
    pub challenge: String,
    pub server_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponsePayload {
    pub signing_public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePayload {
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

pub mod envelope_kind {
    pub const AUTH_CHALLENGE: &str = "auth-challenge";
    pub const AUTH_RESPONSE: &str = "auth-response";
    pub const PRESENCE: &str = "presence";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "ice-candidate";
}

/// Domain-separation prefix for the signalling auth signature:
/// `sign("sig-auth-v1" ‖ challenge ‖ server_timestamp)`.
pub const AUTH_SIGNATURE_DOMAIN: &[u8] = b"sig-auth-v1";

pub fn auth_signature_message(challenge: &str, server_timestamp: i64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(AUTH_SIGNATURE_DOMAIN.len() + challenge.len() + 20);
    msg.extend_from_slice(AUTH_SIGNATURE_DOMAIN);
    msg.extend_from_slice(challenge.as_bytes());
    msg.extend_from_slice(server_timestamp.to_string().as_bytes());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = SignallingEnvelope::new(
            envelope_kind::OFFER,
            serde_json::to_value(SdpPayload { sdp: "v=0".to_string() }).unwrap(),
        )
        .to("deadbeef");

        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: SignallingEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, "offer");
        assert_eq!(parsed.to.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn auth_signature_message_is_domain_separated() {
        let msg = auth_signature_message("abc123", 1_700_000_000);
        assert!(msg.starts_with(AUTH_SIGNATURE_DOMAIN));
    }
}
