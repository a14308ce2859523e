// Password-protected identity backup: Argon2id key derivation, versioned
// envelope, XChaCha20-Poly1305 payload.

use crate::config::Config;
use crate::crypto::constants::CONST_AEAD_V1;
use crate::utils::error::{MessengerError, Result};
use argon2::{Argon2, Algorithm, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Current backup envelope format version. Import must succeed on any
/// supported prior version; the KDF parameters travel with the envelope so
/// future upgrades never invalidate old backups.
pub const BACKUP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub alg: String,
    pub salt: Vec<u8>,
    pub memory_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

/// The on-disk/export envelope. `aead_ciphertext` decrypts to a
/// bincode-serialized [`BackupPayload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEnvelope {
    pub version: u32,
    pub kdf: KdfParams,
    pub nonce: Vec<u8>,
    pub aead_ciphertext: Vec<u8>,
}

/// The plaintext identity contents sealed inside an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPayload {
    pub signing_secret: Vec<u8>,
    pub signing_public: Vec<u8>,
    pub ka_secret: Vec<u8>,
    pub ka_public: Vec<u8>,
    pub display_name: String,
}

fn derive_envelope_key(password: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    if password.is_empty() {
        return Err(MessengerError::ValidationError(
            "Backup password cannot be empty".to_string(),
        ));
    }

    let params = Params::new(kdf.memory_kib, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| MessengerError::CryptoError(format!("Invalid Argon2id parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut argon_output = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), &kdf.salt, &mut argon_output)
        .map_err(|e| MessengerError::CryptoError(format!("Argon2id derivation failed: {}", e)))?;

    // Domain-separate the raw KDF output from the AEAD key actually used,
    // so a future second use of the Argon2id output (if any) can't collide.
    let hkdf = Hkdf::<Sha256>::new(None, &argon_output);
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(CONST_AEAD_V1, &mut *key)
        .map_err(|e| MessengerError::CryptoError(format!("Key derivation failed: {}", e)))?;

    Ok(key)
}

/// Seal an identity into a password-protected envelope (§4.C export).
pub fn export_backup(password: &str, payload: &BackupPayload) -> Result<BackupEnvelope> {
    let config = Config::global();

    let mut salt = vec![0u8; config.salt_length];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let kdf = KdfParams {
        alg: "argon2id".to_string(),
        salt,
        memory_kib: config.argon2_memory_cost_kib,
        time_cost: config.argon2_time_cost,
        parallelism: config.argon2_parallelism,
    };

    let key = derive_envelope_key(password, &kdf)?;
    let cipher = XChaCha20Poly1305::new((&*key).into());

    let mut nonce_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let plaintext = bincode::serialize(payload)
        .map_err(|e| MessengerError::SerializationError(e.to_string()))?;

    let aead_ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|e| MessengerError::CryptoError(format!("Backup encryption failed: {}", e)))?;

    Ok(BackupEnvelope {
        version: BACKUP_FORMAT_VERSION,
        kdf,
        nonce: nonce_bytes.to_vec(),
        aead_ciphertext,
    })
}

/// Open a previously exported envelope (§4.C import). Wrong password
/// surfaces as `Authentication` rather than a generic crypto error, so the
/// facade can show a neutral "wrong password" message.
pub fn import_backup(password: &str, envelope: &BackupEnvelope) -> Result<BackupPayload> {
    if envelope.version > BACKUP_FORMAT_VERSION {
        return Err(MessengerError::VersionMismatch(format!(
            "Backup format version {} is newer than supported version {}",
            envelope.version, BACKUP_FORMAT_VERSION
        )));
    }

    if envelope.nonce.len() != 24 {
        return Err(MessengerError::ValidationError(
            "Invalid backup nonce length".to_string(),
        ));
    }

    let key = derive_envelope_key(password, &envelope.kdf)?;
    let cipher = XChaCha20Poly1305::new((&*key).into());
    let nonce = XNonce::from_slice(&envelope.nonce);

    let plaintext = cipher
        .decrypt(nonce, envelope.aead_ciphertext.as_ref())
        .map_err(|_| MessengerError::Authentication("Wrong backup password".to_string()))?;

    bincode::deserialize(&plaintext).map_err(|e| MessengerError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> BackupPayload {
        BackupPayload {
            signing_secret: vec![1u8; 32],
            signing_public: vec![2u8; 32],
            ka_secret: vec![3u8; 32],
            ka_public: vec![4u8; 32],
            display_name: "alice".to_string(),
        }
    }

    #[test]
    fn export_then_import_round_trips() {
        let payload = sample_payload();
        let envelope = export_backup("correct horse battery staple", &payload).unwrap();
        let restored = import_backup("correct horse battery staple", &envelope).unwrap();

        assert_eq!(restored.signing_secret, payload.signing_secret);
        assert_eq!(restored.ka_secret, payload.ka_secret);
        assert_eq!(restored.display_name, payload.display_name);
    }

    #[test]
    fn wrong_password_is_rejected_as_authentication_failure() {
        let payload = sample_payload();
        let envelope = export_backup("right-password", &payload).unwrap();

        let result = import_backup("wrong-password", &envelope);
        assert!(matches!(result, Err(MessengerError::Authentication(_))));
    }

    #[test]
    fn future_version_is_rejected_as_version_mismatch() {
        let payload = sample_payload();
        let mut envelope = export_backup("pw", &payload).unwrap();
        envelope.version = BACKUP_FORMAT_VERSION + 1;

        let result = import_backup("pw", &envelope);
        assert!(matches!(result, Err(MessengerError::VersionMismatch(_))));
    }
}
