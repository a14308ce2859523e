// Base64 утилиты

use base64::{engine::general_purpose, Engine};

pub fn encode(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

pub fn decode(data: &str) -> Result<Vec<u8>, String> {
    general_purpose::STANDARD
        .decode(data)
        .map_err(|e| format!("Base64 decode failed: {}", e))
}

/// Base64url, no padding — used for the ratchet/ephemeral public-key fields
/// on the wire (spec §4.G/§6), kept distinct from the standard-alphabet
/// `encode`/`decode` above which carries ciphertext payloads.
pub fn url_encode(data: &[u8]) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(data)
}

pub fn url_decode(data: &str) -> Result<Vec<u8>, String> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|e| format!("Base64url decode failed: {}", e))
}
