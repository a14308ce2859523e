// Data models persisted in the encrypted store.

use serde::{Deserialize, Serialize};

/// Delivery status of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

/// What a stored message actually carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    File,
    System,
}

/// A message in the store, text or a pointer to a file transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub contact_id: String,
    pub from: String,
    pub to: String,
    pub kind: MessageKind,
    /// Plaintext body; `None` once soft-deleted.
    pub body: Option<String>,
    pub reply_to: Option<String>,
    pub file_ref: Option<String>,
    pub sent_at: i64,
    pub received_at: Option<i64>,
    pub edited: bool,
    pub deleted: bool,
    pub status: MessageStatus,
}

/// Presence/verification state of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Away,
    Offline,
}

/// A contact in the store, keyed by their long-term signing public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredContact {
    pub id: String,
    pub signing_public_key: Vec<u8>,
    pub ka_public_key: Option<Vec<u8>>,
    pub display_name: String,
    pub nickname: Option<String>,
    pub verified: bool,
    pub added_at: i64,
    pub last_message_at: Option<i64>,
}

/// A reaction attached to a message. `(message_id, sender_id, emoji)` is
/// unique so a duplicate add is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: String,
    pub sender_id: String,
    pub emoji: String,
    pub added_at: i64,
}

/// Encrypted long-term keypairs, sealed at rest by the platform vault key
/// rather than by the backup password (see `crypto::backup` for the
/// separate, password-protected export format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPrivateKeys {
    pub user_id: String,
    pub encrypted_signing_key: Vec<u8>,
    pub encrypted_ka_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub created_at: i64,
}

/// A Double Ratchet session, serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub session_id: String,
    pub contact_id: String,
    pub session_data: Vec<u8>,
    pub last_used: i64,
    pub created_at: i64,
}

/// Application-wide settings, as listed in the facade's recognised
/// settings keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAppMetadata {
    pub user_id: String,
    pub display_name: String,
    pub signaling_server: String,
    pub user_status: UserStatus,
    pub notifications_enabled: bool,
    pub notifications_messages: bool,
    pub notifications_calls: bool,
    pub update_channel: String,
    pub theme: String,
    pub soft_delete_messages: bool,
    pub last_sync: i64,
}

/// A finished or in-progress file record. Files at or below
/// `Config::global().file_inline_threshold` are kept inline as an
/// encrypted BLOB; larger files live at `path` on disk, also encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub contact_id: String,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    pub sha256: String,
    pub inline_blob: Option<Vec<u8>>,
    pub path: Option<String>,
    pub thumbnail: Option<Vec<u8>>,
    pub created_at: i64,
}

/// Transfer state, terminal (`Completed`/`Cancelled`/`Failed`) states are
/// final: a new `transfer_id` is required to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Negotiating,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Persisted resumable file-transfer progress, saved every
/// `Config::global().transfer_persist_every_n_chunks` chunks and on every
/// state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferState {
    pub transfer_id: String,
    pub contact_id: String,
    pub direction: TransferDirection,
    pub file_id: Option<String>,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    pub chunk_size: u32,
    pub next_chunk_index: u64,
    pub bytes_transferred: u64,
    pub sha256_expected: String,
    pub status: TransferStatus,
    pub failure_reason: Option<String>,
    pub updated_at: i64,
}

/// A conversation summary row, kept for fast contact-list ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub contact_id: String,
    pub last_message_id: Option<String>,
    pub last_message_timestamp: Option<i64>,
    pub unread_count: u32,
}
