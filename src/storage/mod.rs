// Encrypted on-disk store plus the in-memory backend used by tests and by
// any caller that hasn't unsealed a vault yet.

pub mod memory;
pub mod models;
pub mod store;

pub use memory::MemoryStore;
pub use store::EncryptedStore;

use crate::storage::models::*;
use crate::utils::error::Result;

/// Everything above the store talks to this trait, not to a concrete
/// backend, so the messaging service and facade work unmodified against
/// either [`MemoryStore`] (tests) or [`EncryptedStore`] (desktop).
///
/// All CRUD here corresponds to an entity in the data model; pagination for
/// messages is by `(timestamp, message_id)` per the component design.
pub trait Store: Send + Sync {
    fn save_private_keys(&self, keys: StoredPrivateKeys) -> Result<()>;
    fn load_private_keys(&self, user_id: &str) -> Result<Option<StoredPrivateKeys>>;

    fn save_session(&self, session: StoredSession) -> Result<()>;
    fn load_session(&self, contact_id: &str) -> Result<Option<StoredSession>>;
    fn load_all_sessions(&self) -> Result<Vec<StoredSession>>;
    fn delete_session(&self, contact_id: &str) -> Result<()>;

    fn save_contact(&self, contact: StoredContact) -> Result<()>;
    fn load_contact(&self, contact_id: &str) -> Result<Option<StoredContact>>;
    fn load_all_contacts(&self) -> Result<Vec<StoredContact>>;
    fn delete_contact(&self, contact_id: &str) -> Result<()>;

    fn save_message(&self, message: StoredMessage) -> Result<()>;
    fn load_message(&self, message_id: &str) -> Result<Option<StoredMessage>>;
    /// Ascending by `(sent_at, id)`, optionally bounded above by `before_ts`.
    fn load_messages(
        &self,
        contact_id: &str,
        limit: usize,
        before_ts: Option<i64>,
    ) -> Result<Vec<StoredMessage>>;
    fn delete_message(&self, message_id: &str) -> Result<()>;

    fn add_reaction(&self, reaction: Reaction) -> Result<()>;
    fn remove_reaction(&self, message_id: &str, sender_id: &str, emoji: &str) -> Result<()>;
    fn load_reactions(&self, message_id: &str) -> Result<Vec<Reaction>>;

    fn save_metadata(&self, metadata: StoredAppMetadata) -> Result<()>;
    fn load_metadata(&self, user_id: &str) -> Result<Option<StoredAppMetadata>>;

    fn save_file_record(&self, file: FileRecord) -> Result<()>;
    fn load_file_record(&self, file_id: &str) -> Result<Option<FileRecord>>;
    fn delete_file_record(&self, file_id: &str) -> Result<()>;

    fn save_transfer(&self, transfer: TransferState) -> Result<()>;
    fn load_transfer(&self, transfer_id: &str) -> Result<Option<TransferState>>;
    fn load_transfers(&self, contact_id: &str) -> Result<Vec<TransferState>>;
    fn delete_transfer(&self, transfer_id: &str) -> Result<()>;
    /// Persist a finished [`FileRecord`] together with the [`TransferState`]
    /// that produced it under one write, so a crash between the two can
    /// never leave the file saved with its transfer still non-terminal.
    fn complete_file_transfer(&self, file: FileRecord, transfer: TransferState) -> Result<()>;

    fn save_conversation(&self, conversation: Conversation) -> Result<()>;
    fn load_conversation(&self, contact_id: &str) -> Result<Option<Conversation>>;
    fn load_all_conversations(&self) -> Result<Vec<Conversation>>;

    fn clear_all(&self) -> Result<()>;
}
