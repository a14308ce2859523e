//! Cryptographic identity (spec component 4.C): one signing keypair and one
//! key-agreement keypair per installation, generated on first run and
//! persisted encrypted-at-rest under the vault-sealed master key. The
//! signing key is the user-visible identifier; the key-agreement key is
//! only ever handed to a contact directly (never through the signalling
//! server) as part of a fingerprint-verified contact add.

use crate::config::Config;
use crate::crypto::backup::{self, BackupEnvelope, BackupPayload};
use crate::crypto::constants::CONST_AEAD_V1;
use crate::crypto::provider::CryptoProvider;
use crate::storage::models::{StoredAppMetadata, StoredPrivateKeys, UserStatus};
use crate::storage::Store;
use crate::utils::error::{MessengerError, Result};
use crate::utils::time::current_timestamp;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use data_encoding::BASE32_NOPAD;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::marker::PhantomData;

const LOCAL_USER_ID: &str = "self";
const SIGNING_KEY_INFO: &[u8] = b"lychee-identity-signing-v1";
const KA_KEY_INFO: &[u8] = b"lychee-identity-ka-v1";

/// This installation's long-term keys, held in process memory for the
/// lifetime of the app. Private key material never leaves this type except
/// through `export_backup`.
pub struct Identity<P: CryptoProvider> {
    pub signing_private: P::SignaturePrivateKey,
    pub signing_public: P::SignaturePublicKey,
    pub ka_private: P::KemPrivateKey,
    pub ka_public: P::KemPublicKey,
    pub display_name: String,
    pub created_at: i64,
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> Clone for Identity<P> {
    fn clone(&self) -> Self {
        Self {
            signing_private: self.signing_private.clone(),
            signing_public: self.signing_public.clone(),
            ka_private: self.ka_private.clone(),
            ka_public: self.ka_public.clone(),
            display_name: self.display_name.clone(),
            created_at: self.created_at,
            _phantom: PhantomData,
        }
    }
}

impl<P: CryptoProvider> Identity<P> {
    /// Stable, human-comparable digest of the signing public key: base32
    /// (RFC4648, no padding) of its SHA-256 hash, grouped into 5-character
    /// blocks for manual safety-number comparison.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(self.signing_public.as_ref())
    }

    /// The shareable public identity a contact adds you by: the signing
    /// key (the user-visible identifier) and the key-agreement key
    /// concatenated and hex-encoded. The spec's `add_contact` takes this
    /// as its "public signing key" argument — out-of-band exchange (QR
    /// code, clipboard) is the only channel that ever carries the
    /// key-agreement half, since it is never relayed by the signalling
    /// server (spec §4.C).
    pub fn public_identity_bundle(&self) -> String {
        encode_public_identity_bundle(self.signing_public.as_ref(), self.ka_public.as_ref())
    }

    /// Generate a fresh identity and persist it, sealed under `master_key`.
    /// Called once, on first run.
    pub fn generate(
        store: &dyn Store,
        master_key: &[u8; 32],
        display_name: impl Into<String>,
    ) -> Result<Self> {
        let (signing_private, signing_public) =
            P::generate_signature_keys().map_err(|e| MessengerError::CryptoError(e.to_string()))?;
        let (ka_private, ka_public) =
            P::generate_kem_keys().map_err(|e| MessengerError::CryptoError(e.to_string()))?;
        let display_name = display_name.into();
        let created_at = current_timestamp();

        let identity = Self {
            signing_private,
            signing_public,
            ka_private,
            ka_public,
            display_name,
            created_at,
            _phantom: PhantomData,
        };
        identity.persist(store, master_key)?;
        Ok(identity)
    }

    /// Load the previously generated identity, or `None` if this is the
    /// first run and nothing has been persisted yet.
    pub fn load(store: &dyn Store, master_key: &[u8; 32]) -> Result<Option<Self>> {
        let Some(keys) = store.load_private_keys(LOCAL_USER_ID)? else {
            return Ok(None);
        };
        let metadata = store.load_metadata(LOCAL_USER_ID)?;
        let display_name = metadata.map(|m| m.display_name).unwrap_or_default();

        let signing_sk_bytes = unseal_field(master_key, SIGNING_KEY_INFO, &keys.nonce, &keys.encrypted_signing_key)?;
        let ka_sk_bytes = unseal_field(master_key, KA_KEY_INFO, &keys.nonce, &keys.encrypted_ka_key)?;

        let signing_private = P::signature_private_key_from_bytes(signing_sk_bytes);
        let signing_public = P::from_signature_private_to_public(&signing_private)
            .map_err(|e| MessengerError::CryptoError(e.to_string()))?;
        let ka_private = P::kem_private_key_from_bytes(ka_sk_bytes);
        let ka_public = P::from_private_key_to_public_key(&ka_private)
            .map_err(|e| MessengerError::CryptoError(e.to_string()))?;

        Ok(Some(Self {
            signing_private,
            signing_public,
            ka_private,
            ka_public,
            display_name,
            created_at: keys.created_at,
            _phantom: PhantomData,
        }))
    }

    /// Rename in place and persist the new display name (keys are
    /// untouched; only `storage::models::StoredAppMetadata` changes).
    pub fn rename(&mut self, store: &dyn Store, new_name: impl Into<String>) -> Result<()> {
        let new_name = new_name.into();
        let mut metadata = store.load_metadata(LOCAL_USER_ID)?.unwrap_or_else(|| default_metadata(&new_name));
        metadata.display_name = new_name.clone();
        store.save_metadata(metadata)?;
        self.display_name = new_name;
        Ok(())
    }

    fn persist(&self, store: &dyn Store, master_key: &[u8; 32]) -> Result<()> {
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let encrypted_signing_key = seal_field(master_key, SIGNING_KEY_INFO, &nonce_bytes, self.signing_private.as_ref())?;
        let encrypted_ka_key = seal_field(master_key, KA_KEY_INFO, &nonce_bytes, self.ka_private.as_ref())?;

        store.save_private_keys(StoredPrivateKeys {
            user_id: LOCAL_USER_ID.to_string(),
            encrypted_signing_key,
            encrypted_ka_key,
            nonce: nonce_bytes.to_vec(),
            created_at: self.created_at,
        })?;

        if store.load_metadata(LOCAL_USER_ID)?.is_none() {
            store.save_metadata(default_metadata(&self.display_name))?;
        }
        Ok(())
    }

    /// Export this identity as a password-protected backup envelope (§4.C).
    pub fn export_backup(&self, password: &str) -> Result<BackupEnvelope> {
        backup::export_backup(
            password,
            &BackupPayload {
                signing_secret: self.signing_private.as_ref().to_vec(),
                signing_public: self.signing_public.as_ref().to_vec(),
                ka_secret: self.ka_private.as_ref().to_vec(),
                ka_public: self.ka_public.as_ref().to_vec(),
                display_name: self.display_name.clone(),
            },
        )
    }

    /// Import a backup envelope, overwriting whatever identity is currently
    /// persisted (the facade's `import_backup` is a destructive replace,
    /// matching the spec's recovery-beyond-loss semantics).
    pub fn import_backup(
        store: &dyn Store,
        master_key: &[u8; 32],
        password: &str,
        envelope: &BackupEnvelope,
    ) -> Result<Self> {
        let payload = backup::import_backup(password, envelope)?;

        let signing_private = P::signature_private_key_from_bytes(payload.signing_secret);
        let signing_public = P::signature_public_key_from_bytes(payload.signing_public);
        let ka_private = P::kem_private_key_from_bytes(payload.ka_secret);
        let ka_public = P::kem_public_key_from_bytes(payload.ka_public);

        let identity = Self {
            signing_private,
            signing_public,
            ka_private,
            ka_public,
            display_name: payload.display_name,
            created_at: current_timestamp(),
            _phantom: PhantomData,
        };
        identity.persist(store, master_key)?;
        Ok(identity)
    }
}

fn default_metadata(display_name: &str) -> StoredAppMetadata {
    let cfg = Config::global();
    StoredAppMetadata {
        user_id: LOCAL_USER_ID.to_string(),
        display_name: display_name.to_string(),
        signaling_server: String::new(),
        user_status: UserStatus::Online,
        notifications_enabled: true,
        notifications_messages: true,
        notifications_calls: true,
        update_channel: "stable".to_string(),
        theme: "system".to_string(),
        soft_delete_messages: cfg.soft_delete_messages,
        last_sync: current_timestamp(),
    }
}

/// Fingerprint of a raw signing public key, usable before an `Identity` is
/// constructed (e.g. to render a contact's fingerprint from its stored
/// public key alone).
pub fn fingerprint_of(signing_public_key: &[u8]) -> String {
    let digest = Sha256::digest(signing_public_key);
    let encoded = BASE32_NOPAD.encode(&digest);
    encoded
        .as_bytes()
        .chunks(5)
        .map(|chunk| std::str::from_utf8(chunk).unwrap())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex-encode `signing_public ‖ ka_public` as the out-of-band identity
/// string a contact is added by.
pub fn encode_public_identity_bundle(signing_public: &[u8], ka_public: &[u8]) -> String {
    let mut bundle = Vec::with_capacity(signing_public.len() + ka_public.len());
    bundle.extend_from_slice(signing_public);
    bundle.extend_from_slice(ka_public);
    hex::encode(bundle)
}

/// Reverse of [`encode_public_identity_bundle`]. Both halves are 32 bytes
/// under the classic suite; the bundle must decode to exactly 64 bytes.
pub fn decode_public_identity_bundle(bundle: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let bytes = hex::decode(bundle)
        .map_err(|e| MessengerError::ValidationError(format!("invalid public identity: {}", e)))?;
    if bytes.len() != 64 {
        return Err(MessengerError::ValidationError(
            "public identity must encode exactly a signing key and a key-agreement key".to_string(),
        ));
    }
    let (signing, ka) = bytes.split_at(32);
    Ok((signing.to_vec(), ka.to_vec()))
}

/// Derive a per-field AEAD key from the master key via HKDF (domain
/// separated by `info`) and seal `plaintext` under `nonce`. Two fields can
/// safely share one nonce because each uses its own derived key.
fn seal_field(master_key: &[u8; 32], info: &[u8], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = derive_field_key(master_key, info)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| MessengerError::CryptoError(format!("identity seal failed: {}", e)))
}

fn unseal_field(master_key: &[u8; 32], info: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != 12 {
        return Err(MessengerError::Corrupted("identity nonce has the wrong length".to_string()));
    }
    let key = derive_field_key(master_key, info)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| MessengerError::Corrupted("identity keys failed to decrypt".to_string()))
}

fn derive_field_key(master_key: &[u8; 32], info: &[u8]) -> Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, master_key);
    let mut out = [0u8; 32];
    hkdf.expand(&[CONST_AEAD_V1, info].concat(), &mut out)
        .map_err(|e| MessengerError::CryptoError(format!("identity key derivation failed: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::suites::classic::ClassicSuiteProvider;
    use crate::storage::memory::MemoryStore;

    type TestIdentity = Identity<ClassicSuiteProvider>;

    #[test]
    fn generate_then_load_round_trips() {
        let store = MemoryStore::new();
        let master_key = [7u8; 32];

        let generated = TestIdentity::generate(&store, &master_key, "alice").unwrap();
        let loaded = TestIdentity::load(&store, &master_key).unwrap().unwrap();

        assert_eq!(loaded.display_name, "alice");
        assert_eq!(loaded.signing_public.as_ref(), generated.signing_public.as_ref());
        assert_eq!(loaded.ka_public.as_ref(), generated.ka_public.as_ref());
        assert_eq!(loaded.fingerprint(), generated.fingerprint());
    }

    #[test]
    fn load_with_no_identity_yet_is_none() {
        let store = MemoryStore::new();
        assert!(TestIdentity::load(&store, &[1u8; 32]).unwrap().is_none());
    }

    #[test]
    fn wrong_master_key_fails_to_decrypt() {
        let store = MemoryStore::new();
        TestIdentity::generate(&store, &[1u8; 32], "alice").unwrap();
        let result = TestIdentity::load(&store, &[2u8; 32]);
        assert!(matches!(result, Err(MessengerError::Corrupted(_))));
    }

    #[test]
    fn fingerprint_is_stable_and_grouped() {
        let store = MemoryStore::new();
        let identity = TestIdentity::generate(&store, &[3u8; 32], "bob").unwrap();
        let fp = identity.fingerprint();
        assert!(fp.contains(' '));
        assert_eq!(fp, identity.fingerprint());
    }

    #[test]
    fn public_identity_bundle_round_trips() {
        let store = MemoryStore::new();
        let identity = TestIdentity::generate(&store, &[4u8; 32], "dave").unwrap();

        let bundle = identity.public_identity_bundle();
        let (signing, ka) = decode_public_identity_bundle(&bundle).unwrap();

        assert_eq!(signing, identity.signing_public.as_ref());
        assert_eq!(ka, identity.ka_public.as_ref());
    }

    #[test]
    fn malformed_public_identity_bundle_is_rejected() {
        assert!(decode_public_identity_bundle("not-hex").is_err());
        assert!(decode_public_identity_bundle("aabbcc").is_err());
    }

    #[test]
    fn export_then_import_backup_round_trips() {
        let store = MemoryStore::new();
        let identity = TestIdentity::generate(&store, &[9u8; 32], "carol").unwrap();
        let envelope = identity.export_backup("hunter2").unwrap();

        let other_store = MemoryStore::new();
        let restored = TestIdentity::import_backup(&other_store, &[9u8; 32], "hunter2", &envelope).unwrap();

        assert_eq!(restored.display_name, "carol");
        assert_eq!(restored.signing_public.as_ref(), identity.signing_public.as_ref());
        assert_eq!(restored.ka_public.as_ref(), identity.ka_public.as_ref());
    }
}
