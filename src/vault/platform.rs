// OS-bound sealing primitive (spec component 4.A). The wrapping key itself
// never leaves the OS credential store; only `seal`/`unseal` cross this
// module's boundary.

use crate::utils::error::{MessengerError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use keyring::Entry;
use rand::RngCore;

const SERVICE_NAME: &str = "lychee-messenger";
const WRAPPING_KEY_USERNAME: &str = "vault-wrapping-key";

fn wrapping_key_entry() -> Result<Entry> {
    Entry::new(SERVICE_NAME, WRAPPING_KEY_USERNAME)
        .map_err(|e| MessengerError::Denied(format!("keyring unavailable: {}", e)))
}

/// Load this installation's wrapping key from the OS keyring, generating
/// and storing one on first run. Binds implicitly to the OS user principal:
/// a different user (or a copy of the sealed blob on another machine)
/// cannot retrieve the same entry.
fn load_or_create_wrapping_key() -> Result<[u8; 32]> {
    let entry = wrapping_key_entry()?;

    match entry.get_password() {
        Ok(encoded) => {
            let bytes = data_encoding::BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| MessengerError::Corrupted(format!("wrapping key corrupt: {}", e)))?;
            bytes
                .try_into()
                .map_err(|_| MessengerError::Corrupted("wrapping key has wrong length".to_string()))
        }
        Err(keyring::Error::NoEntry) => {
            let mut key = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key);
            entry
                .set_password(&data_encoding::BASE64.encode(&key))
                .map_err(|e| MessengerError::Denied(format!("store wrapping key: {}", e)))?;
            Ok(key)
        }
        Err(e) => Err(MessengerError::Denied(format!("load wrapping key: {}", e))),
    }
}

/// Seal `plaintext` under the OS-bound wrapping key. The result carries its
/// own nonce and is safe to write to disk.
pub fn seal(plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = load_or_create_wrapping_key()?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| MessengerError::CryptoError(format!("vault seal failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(12 + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Reverse of [`seal`]. Fails with `Denied` if the wrapping key cannot be
/// retrieved (different OS principal, keyring unavailable) or the blob
/// doesn't authenticate under it.
pub fn unseal(sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < 12 {
        return Err(MessengerError::Corrupted("sealed blob too short".to_string()));
    }
    let key = load_or_create_wrapping_key()?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    let (nonce_bytes, ciphertext) = sealed.split_at(12);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| MessengerError::Denied("vault unseal failed for this principal".to_string()))
}

/// Remove the wrapping key from the OS keyring. Any sealed blob becomes
/// permanently unreadable afterwards; used only by an explicit identity
/// reset.
pub fn forget_wrapping_key() -> Result<()> {
    let entry = wrapping_key_entry()?;
    match entry.delete_password() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(MessengerError::Denied(format!("delete wrapping key: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests touch the real OS keyring; they're representative of the
    // seal/unseal contract but may be skipped in sandboxes without a
    // credential store (the keyring crate surfaces that as an error, not a
    // panic).

    #[test]
    fn seal_then_unseal_round_trips() {
        if let Ok(sealed) = seal(b"db master key material") {
            let plaintext = unseal(&sealed).expect("unseal should succeed for the same principal");
            assert_eq!(plaintext, b"db master key material");
        }
    }

    #[test]
    fn corrupted_blob_is_rejected() {
        if seal(b"probe").is_ok() {
            let result = unseal(b"too-short");
            assert!(matches!(result, Err(MessengerError::Corrupted(_))));
        }
    }
}
