// Encrypted on-disk store: a single-file header-plus-ciphertext layout
// (same shape as the platform vault in `vault::master_key`), CRUD over every
// entity, atomic write-then-rename so a crash mid-save can't leave a
// half-written file.

use crate::storage::models::*;
use crate::storage::Store;
use crate::utils::error::{MessengerError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const STORE_MAGIC: &[u8; 8] = b"LYCHDB01";
const CURRENT_SCHEMA_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 24;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StorePayload {
    schema_version: u32,
    private_keys: HashMap<String, StoredPrivateKeys>,
    sessions: HashMap<String, StoredSession>,
    contacts: HashMap<String, StoredContact>,
    messages: Vec<StoredMessage>,
    reactions: Vec<Reaction>,
    metadata: HashMap<String, StoredAppMetadata>,
    files: HashMap<String, FileRecord>,
    transfers: HashMap<String, TransferState>,
    conversations: HashMap<String, Conversation>,
}

/// The desktop `data.db` described in the persisted-state layout: opened
/// once at startup with the master key unsealed from the platform vault,
/// then mutated in place for the lifetime of the process.
pub struct EncryptedStore {
    path: PathBuf,
    key: [u8; 32],
    payload: RwLock<StorePayload>,
}

impl EncryptedStore {
    /// Open an existing store, or create an empty one at `path` if none
    /// exists yet. `master_key` is the 32-byte secret unsealed from the
    /// platform vault; it never touches disk itself.
    pub fn open_or_create<P: AsRef<Path>>(path: P, master_key: [u8; 32]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            Self::open(path, master_key)
        } else {
            let store = Self {
                path,
                key: master_key,
                payload: RwLock::new(StorePayload {
                    schema_version: CURRENT_SCHEMA_VERSION,
                    ..Default::default()
                }),
            };
            store.persist()?;
            Ok(store)
        }
    }

    fn open(path: PathBuf, master_key: [u8; 32]) -> Result<Self> {
        let bytes = fs::read(&path)
            .map_err(|e| MessengerError::StorageError(format!("read store: {}", e)))?;
        if bytes.len() < HEADER_LEN {
            return Err(MessengerError::Corrupted("store file truncated".to_string()));
        }

        let (header, ciphertext) = bytes.split_at(HEADER_LEN);
        if &header[0..8] != STORE_MAGIC {
            return Err(MessengerError::Corrupted("bad store magic".to_string()));
        }
        let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
        if version > CURRENT_SCHEMA_VERSION {
            return Err(MessengerError::VersionMismatch(format!(
                "store schema version {} is newer than supported version {}",
                version, CURRENT_SCHEMA_VERSION
            )));
        }
        let nonce = XNonce::from_slice(&header[12..36]);

        let cipher = XChaCha20Poly1305::new((&master_key).into());
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| MessengerError::Authentication("store decryption failed".to_string()))?;

        let mut payload: StorePayload = bincode::deserialize(&plaintext)
            .map_err(|e| MessengerError::Corrupted(format!("store payload corrupt: {}", e)))?;
        payload.schema_version = CURRENT_SCHEMA_VERSION;

        Ok(Self {
            path,
            key: master_key,
            payload: RwLock::new(payload),
        })
    }

    /// Serialise, encrypt under a fresh nonce and write atomically
    /// (temp file + rename) so a crash mid-write leaves either the old file
    /// or nothing, never a half-written one.
    fn persist(&self) -> Result<()> {
        let plaintext = {
            let payload = self.payload.read();
            bincode::serialize(&*payload)
                .map_err(|e| MessengerError::SerializationError(e.to_string()))?
        };

        let mut nonce_bytes = [0u8; 24];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|e| MessengerError::CryptoError(format!("store encryption failed: {}", e)))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        buf.extend_from_slice(STORE_MAGIC);
        buf.extend_from_slice(&CURRENT_SCHEMA_VERSION.to_le_bytes());
        buf.extend_from_slice(&nonce_bytes);
        buf.extend_from_slice(&ciphertext);

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)
                .map_err(|e| MessengerError::StorageError(format!("create temp store file: {}", e)))?;
            tmp.write_all(&buf)
                .map_err(|e| MessengerError::StorageError(format!("write store: {}", e)))?;
            tmp.flush()
                .map_err(|e| MessengerError::StorageError(format!("flush store: {}", e)))?;
        }
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| MessengerError::StorageError(format!("rename store into place: {}", e)))?;
        Ok(())
    }
}

impl Store for EncryptedStore {
    fn save_private_keys(&self, keys: StoredPrivateKeys) -> Result<()> {
        self.payload.write().private_keys.insert(keys.user_id.clone(), keys);
        self.persist()
    }

    fn load_private_keys(&self, user_id: &str) -> Result<Option<StoredPrivateKeys>> {
        Ok(self.payload.read().private_keys.get(user_id).cloned())
    }

    fn save_session(&self, session: StoredSession) -> Result<()> {
        self.payload
            .write()
            .sessions
            .insert(session.contact_id.clone(), session);
        self.persist()
    }

    fn load_session(&self, contact_id: &str) -> Result<Option<StoredSession>> {
        Ok(self.payload.read().sessions.get(contact_id).cloned())
    }

    fn load_all_sessions(&self) -> Result<Vec<StoredSession>> {
        Ok(self.payload.read().sessions.values().cloned().collect())
    }

    fn delete_session(&self, contact_id: &str) -> Result<()> {
        self.payload.write().sessions.remove(contact_id);
        self.persist()
    }

    fn save_contact(&self, contact: StoredContact) -> Result<()> {
        self.payload.write().contacts.insert(contact.id.clone(), contact);
        self.persist()
    }

    fn load_contact(&self, contact_id: &str) -> Result<Option<StoredContact>> {
        Ok(self.payload.read().contacts.get(contact_id).cloned())
    }

    fn load_all_contacts(&self) -> Result<Vec<StoredContact>> {
        Ok(self.payload.read().contacts.values().cloned().collect())
    }

    fn delete_contact(&self, contact_id: &str) -> Result<()> {
        self.payload.write().contacts.remove(contact_id);
        self.persist()
    }

    fn save_message(&self, message: StoredMessage) -> Result<()> {
        let mut payload = self.payload.write();
        if let Some(existing) = payload.messages.iter_mut().find(|m| m.id == message.id) {
            *existing = message;
        } else {
            payload.messages.push(message);
        }
        drop(payload);
        self.persist()
    }

    fn load_message(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        Ok(self
            .payload
            .read()
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned())
    }

    fn load_messages(
        &self,
        contact_id: &str,
        limit: usize,
        before_ts: Option<i64>,
    ) -> Result<Vec<StoredMessage>> {
        let payload = self.payload.read();
        let mut messages: Vec<StoredMessage> = payload
            .messages
            .iter()
            .filter(|m| m.contact_id == contact_id)
            .filter(|m| before_ts.map_or(true, |ts| m.sent_at < ts))
            .cloned()
            .collect();

        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
        messages.truncate(limit);
        Ok(messages)
    }

    fn delete_message(&self, message_id: &str) -> Result<()> {
        self.payload.write().messages.retain(|m| m.id != message_id);
        self.persist()
    }

    fn add_reaction(&self, reaction: Reaction) -> Result<()> {
        let mut payload = self.payload.write();
        let duplicate = payload.reactions.iter().any(|r| {
            r.message_id == reaction.message_id
                && r.sender_id == reaction.sender_id
                && r.emoji == reaction.emoji
        });
        if !duplicate {
            payload.reactions.push(reaction);
        }
        drop(payload);
        self.persist()
    }

    fn remove_reaction(&self, message_id: &str, sender_id: &str, emoji: &str) -> Result<()> {
        self.payload.write().reactions.retain(|r| {
            !(r.message_id == message_id && r.sender_id == sender_id && r.emoji == emoji)
        });
        self.persist()
    }

    fn load_reactions(&self, message_id: &str) -> Result<Vec<Reaction>> {
        Ok(self
            .payload
            .read()
            .reactions
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect())
    }

    fn save_metadata(&self, metadata: StoredAppMetadata) -> Result<()> {
        self.payload
            .write()
            .metadata
            .insert(metadata.user_id.clone(), metadata);
        self.persist()
    }

    fn load_metadata(&self, user_id: &str) -> Result<Option<StoredAppMetadata>> {
        Ok(self.payload.read().metadata.get(user_id).cloned())
    }

    fn save_file_record(&self, file: FileRecord) -> Result<()> {
        self.payload.write().files.insert(file.id.clone(), file);
        self.persist()
    }

    fn load_file_record(&self, file_id: &str) -> Result<Option<FileRecord>> {
        Ok(self.payload.read().files.get(file_id).cloned())
    }

    fn delete_file_record(&self, file_id: &str) -> Result<()> {
        self.payload.write().files.remove(file_id);
        self.persist()
    }

    fn save_transfer(&self, transfer: TransferState) -> Result<()> {
        self.payload
            .write()
            .transfers
            .insert(transfer.transfer_id.clone(), transfer);
        self.persist()
    }

    fn load_transfer(&self, transfer_id: &str) -> Result<Option<TransferState>> {
        Ok(self.payload.read().transfers.get(transfer_id).cloned())
    }

    fn load_transfers(&self, contact_id: &str) -> Result<Vec<TransferState>> {
        Ok(self
            .payload
            .read()
            .transfers
            .values()
            .filter(|t| t.contact_id == contact_id)
            .cloned()
            .collect())
    }

    fn delete_transfer(&self, transfer_id: &str) -> Result<()> {
        self.payload.write().transfers.remove(transfer_id);
        self.persist()
    }

    fn complete_file_transfer(&self, file: FileRecord, transfer: TransferState) -> Result<()> {
        {
            let mut payload = self.payload.write();
            payload.files.insert(file.id.clone(), file);
            payload.transfers.insert(transfer.transfer_id.clone(), transfer);
        }
        self.persist()
    }

    fn save_conversation(&self, conversation: Conversation) -> Result<()> {
        self.payload
            .write()
            .conversations
            .insert(conversation.contact_id.clone(), conversation);
        self.persist()
    }

    fn load_conversation(&self, contact_id: &str) -> Result<Option<Conversation>> {
        Ok(self.payload.read().conversations.get(contact_id).cloned())
    }

    fn load_all_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.payload.read().conversations.values().cloned().collect())
    }

    fn clear_all(&self) -> Result<()> {
        *self.payload.write() = StorePayload {
            schema_version: CURRENT_SCHEMA_VERSION,
            ..Default::default()
        };
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_contact(id: &str) -> StoredContact {
        StoredContact {
            id: id.to_string(),
            signing_public_key: vec![1, 2, 3],
            ka_public_key: None,
            display_name: "Bob".to_string(),
            nickname: None,
            verified: false,
            added_at: 1,
            last_message_at: None,
        }
    }

    #[test]
    fn create_persists_and_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let key = [7u8; 32];

        {
            let store = EncryptedStore::open_or_create(&path, key).unwrap();
            store.save_contact(sample_contact("c1")).unwrap();
        }

        let reopened = EncryptedStore::open_or_create(&path, key).unwrap();
        assert!(reopened.load_contact("c1").unwrap().is_some());
    }

    #[test]
    fn wrong_key_fails_with_authentication_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        EncryptedStore::open_or_create(&path, [1u8; 32]).unwrap();

        let result = EncryptedStore::open_or_create(&path, [2u8; 32]);
        assert!(matches!(result, Err(MessengerError::Authentication(_))));
    }

    #[test]
    fn truncated_file_is_corrupted_not_a_panic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        fs::write(&path, b"short").unwrap();

        let result = EncryptedStore::open_or_create(&path, [1u8; 32]);
        assert!(matches!(result, Err(MessengerError::Corrupted(_))));
    }

    #[test]
    fn messages_and_reactions_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let store = EncryptedStore::open_or_create(&path, [3u8; 32]).unwrap();

        let message = StoredMessage {
            id: "m1".to_string(),
            contact_id: "c1".to_string(),
            from: "self".to_string(),
            to: "c1".to_string(),
            kind: MessageKind::Text,
            body: Some("hi".to_string()),
            reply_to: None,
            file_ref: None,
            sent_at: 10,
            received_at: None,
            edited: false,
            deleted: false,
            status: MessageStatus::Sent,
        };
        store.save_message(message).unwrap();

        let reaction = Reaction {
            message_id: "m1".to_string(),
            sender_id: "c1".to_string(),
            emoji: "👍".to_string(),
            added_at: 11,
        };
        store.add_reaction(reaction.clone()).unwrap();
        store.add_reaction(reaction).unwrap();

        assert_eq!(store.load_messages("c1", 10, None).unwrap().len(), 1);
        assert_eq!(store.load_reactions("m1").unwrap().len(), 1);
    }
}
