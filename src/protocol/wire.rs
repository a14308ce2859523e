// Data-channel wire format (spec §4.G): length-prefixed UTF-8 JSON, one
// frame per message. `Frame` is the tagged union the router dispatches on;
// the JSON shape is a serialisation detail, not the interface.

use crate::utils::error::{MessengerError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInitBody {
    /// Base64url (no padding) X3DH-lite ephemeral key-agreement public key.
    pub ephemeral: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBody {
    pub ciphertext: String,
    pub header: RatchetHeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditBody {
    pub target_id: String,
    pub ciphertext: String,
    pub header: RatchetHeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteBody {
    pub target_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionBody {
    pub target_id: String,
    pub emoji: String,
    pub action: ReactionAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingBody {
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckBody {
    pub target_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOfferBody {
    pub transfer_id: String,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    pub chunk_size: u32,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunkBody {
    pub transfer_id: String,
    pub index: u64,
    /// Base64url (no padding) AEAD ciphertext for this chunk.
    pub ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAckBody {
    pub transfer_id: String,
    pub index: u64,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCancelBody {
    pub transfer_id: String,
    pub reason: String,
}

/// The Double Ratchet header carried on every encrypted frame: enough for
/// the receiver to run the DH ratchet and locate the right message key
/// without out-of-band state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Base64url (no padding) sender DH ratchet public key.
    pub dh_public_key: String,
    /// Base64url (no padding) AEAD nonce for this message's ciphertext.
    pub nonce: String,
    pub message_number: u32,
    pub previous_chain_length: u32,
    pub suite_id: u16,
}

/// Every frame on the data channel. Recipients dispatch on `type`
/// (`#[serde(tag = "type")]`); `id`/`ts` travel on every variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    SessionInit {
        id: String,
        ts: i64,
        #[serde(flatten)]
        body: SessionInitBody,
    },
    Text {
        id: String,
        ts: i64,
        #[serde(flatten)]
        body: TextBody,
    },
    Edit {
        id: String,
        ts: i64,
        #[serde(flatten)]
        body: EditBody,
    },
    Delete {
        id: String,
        ts: i64,
        #[serde(flatten)]
        body: DeleteBody,
    },
    Reaction {
        id: String,
        ts: i64,
        #[serde(flatten)]
        body: ReactionBody,
    },
    Typing {
        id: String,
        ts: i64,
        #[serde(flatten)]
        body: TypingBody,
    },
    Ack {
        id: String,
        ts: i64,
        #[serde(flatten)]
        body: AckBody,
    },
    FileOffer {
        id: String,
        ts: i64,
        #[serde(flatten)]
        body: FileOfferBody,
    },
    FileChunk {
        id: String,
        ts: i64,
        #[serde(flatten)]
        body: FileChunkBody,
    },
    FileAck {
        id: String,
        ts: i64,
        #[serde(flatten)]
        body: FileAckBody,
    },
    FileCancel {
        id: String,
        ts: i64,
        #[serde(flatten)]
        body: FileCancelBody,
    },
}

impl Frame {
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::SessionInit { .. } => "session-init",
            Frame::Text { .. } => "text",
            Frame::Edit { .. } => "edit",
            Frame::Delete { .. } => "delete",
            Frame::Reaction { .. } => "reaction",
            Frame::Typing { .. } => "typing",
            Frame::Ack { .. } => "ack",
            Frame::FileOffer { .. } => "file-offer",
            Frame::FileChunk { .. } => "file-chunk",
            Frame::FileAck { .. } => "file-ack",
            Frame::FileCancel { .. } => "file-cancel",
        }
    }
}

/// Encode a frame as a single length-prefixed JSON message: a 4-byte
/// big-endian length followed by the UTF-8 JSON body. The data channel
/// itself is message-oriented, so the prefix guards against any transport
/// that coalesces buffers rather than preserving message boundaries.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(frame)
        .map_err(|e| MessengerError::SerializationError(format!("frame encode error: {}", e)))?;
    if json.len() > u32::MAX as usize {
        return Err(MessengerError::ProtocolError("frame too large".to_string()));
    }
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decode a single length-prefixed frame, returning the frame and the
/// number of bytes consumed so callers can process a buffer containing
/// more than one frame.
pub fn decode_frame(buf: &[u8]) -> Result<(Frame, usize)> {
    if buf.len() < 4 {
        return Err(MessengerError::ProtocolError("frame too short for length prefix".to_string()));
    }
    let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    if buf.len() < 4 + len {
        return Err(MessengerError::ProtocolError("incomplete frame".to_string()));
    }
    let frame: Frame = serde_json::from_slice(&buf[4..4 + len])
        .map_err(|e| MessengerError::ProtocolError(format!("malformed frame: {}", e)))?;
    Ok((frame, 4 + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text_frame() -> Frame {
        Frame::Text {
            id: "f1".to_string(),
            ts: 1700,
            body: TextBody {
                ciphertext: "AQID".to_string(),
                header: RatchetHeader {
                    dh_public_key: "deadbeef".to_string(),
                    nonce: "deadbeef".to_string(),
                    message_number: 0,
                    previous_chain_length: 0,
                    suite_id: 1,
                },
            },
        }
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let frame = sample_text_frame();
        let encoded = encode_frame(&frame).unwrap();
        let (decoded, consumed) = decode_frame(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.type_name(), "text");
    }

    #[test]
    fn decode_rejects_incomplete_buffer() {
        let frame = sample_text_frame();
        let encoded = encode_frame(&frame).unwrap();
        let result = decode_frame(&encoded[..encoded.len() - 1]);
        assert!(matches!(result, Err(MessengerError::ProtocolError(_))));
    }

    #[test]
    fn two_frames_back_to_back_decode_independently() {
        let frame = sample_text_frame();
        let mut buf = encode_frame(&frame).unwrap();
        buf.extend_from_slice(&encode_frame(&frame).unwrap());

        let (_first, consumed) = decode_frame(&buf).unwrap();
        let (_second, consumed2) = decode_frame(&buf[consumed..]).unwrap();
        assert_eq!(consumed + consumed2, buf.len());
    }

    #[test]
    fn unknown_type_tag_is_a_protocol_error_not_a_panic() {
        let raw = br#"{"type":"carrier-pigeon","id":"x","ts":1}"#;
        let mut buf = Vec::new();
        buf.extend_from_slice(&(raw.len() as u32).to_be_bytes());
        buf.extend_from_slice(raw);
        assert!(matches!(decode_frame(&buf), Err(MessengerError::ProtocolError(_))));
    }
}
