// Validation for inbound frames and display names before they reach the
// messaging service or store.

use crate::config::Config;
use crate::protocol::wire::Frame;
use crate::utils::error::{MessengerError, Result};
use base64::{engine::general_purpose, Engine as _};

pub fn validate_base64(encoded: &str) -> Result<()> {
    general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| MessengerError::ValidationError("invalid base64 string".to_string()))?;
    Ok(())
}

pub fn validate_base64url_nopad(encoded: &str) -> Result<Vec<u8>> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| MessengerError::ValidationError("invalid base64url string".to_string()))
}

pub fn validate_display_name(name: &str) -> Result<()> {
    let cfg = Config::global();
    if name.is_empty() || name.chars().count() > cfg.username_max_length {
        return Err(MessengerError::ValidationError(format!(
            "display name must be 1-{} characters",
            cfg.username_max_length
        )));
    }
    Ok(())
}

pub fn validate_uuid_like(value: &str) -> Result<()> {
    let cfg = Config::global();
    if value.len() != cfg.uuid_length {
        return Err(MessengerError::ValidationError(
            "identifier has the wrong length for a UUID".to_string(),
        ));
    }
    Ok(())
}

/// Structural validation a frame must pass before the router hands it to a
/// subscriber. This is intentionally shallow: it rejects malformed
/// identifiers and out-of-range sizes, not cryptographic validity, which is
/// the ratchet's job.
pub fn validate_frame(frame: &Frame) -> Result<()> {
    let cfg = Config::global();

    match frame {
        Frame::SessionInit { body, .. } => {
            validate_base64url_nopad(&body.ephemeral)?;
        }
        Frame::Text { body, .. } => {
            validate_base64(&body.ciphertext)?;
            validate_base64url_nopad(&body.header.dh_public_key)?;
            validate_base64url_nopad(&body.header.nonce)?;
        }
        Frame::Edit { body, .. } => {
            validate_uuid_like(&body.target_id)?;
            validate_base64(&body.ciphertext)?;
            validate_base64url_nopad(&body.header.dh_public_key)?;
            validate_base64url_nopad(&body.header.nonce)?;
        }
        Frame::Delete { body, .. } => {
            validate_uuid_like(&body.target_id)?;
        }
        Frame::Reaction { body, .. } => {
            validate_uuid_like(&body.target_id)?;
            if body.emoji.is_empty() {
                return Err(MessengerError::ValidationError("empty reaction emoji".to_string()));
            }
        }
        Frame::Typing { .. } => {}
        Frame::Ack { body, .. } => {
            validate_uuid_like(&body.target_id)?;
        }
        Frame::FileOffer { body, .. } => {
            if body.filename.is_empty() {
                return Err(MessengerError::ValidationError("empty filename".to_string()));
            }
            if body.chunk_size as usize != cfg.file_chunk_size {
                return Err(MessengerError::ValidationError(
                    "unexpected chunk size in file-offer".to_string(),
                ));
            }
            if body.sha256.len() != 64 || !body.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(MessengerError::ValidationError("malformed sha256 hex".to_string()));
            }
        }
        Frame::FileChunk { body, .. } => {
            validate_base64(&body.ciphertext)?;
        }
        Frame::FileAck { .. } => {}
        Frame::FileCancel { body, .. } => {
            if body.transfer_id.is_empty() {
                return Err(MessengerError::ValidationError("empty transfer id".to_string()));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::{RatchetHeader, TextBody};

    #[test]
    fn valid_text_frame_passes() {
        let frame = Frame::Text {
            id: "f1".to_string(),
            ts: 1,
            body: TextBody {
                ciphertext: "AQID".to_string(),
                header: RatchetHeader {
                    dh_public_key: "AQID".to_string(),
                    nonce: "AQID".to_string(),
                    message_number: 0,
                    previous_chain_length: 0,
                    suite_id: 1,
                },
            },
        };
        assert!(validate_frame(&frame).is_ok());
    }

    #[test]
    fn text_frame_with_bad_ciphertext_is_rejected() {
        let frame = Frame::Text {
            id: "f1".to_string(),
            ts: 1,
            body: TextBody {
                ciphertext: "not base64!!".to_string(),
                header: RatchetHeader {
                    dh_public_key: "AQID".to_string(),
                    nonce: "AQID".to_string(),
                    message_number: 0,
                    previous_chain_length: 0,
                    suite_id: 1,
                },
            },
        };
        assert!(validate_frame(&frame).is_err());
    }

    #[test]
    fn display_name_length_is_enforced() {
        assert!(validate_display_name("").is_err());
        assert!(validate_display_name("alice").is_ok());
    }
}
