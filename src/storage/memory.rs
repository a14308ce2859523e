// In-memory backend: used by the test suite and by any component exercised
// before a vault/master key is available.

use crate::storage::models::*;
use crate::storage::Store;
use crate::utils::error::Result;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
pub struct MemoryStore {
    private_keys: RwLock<HashMap<String, StoredPrivateKeys>>,
    sessions: RwLock<HashMap<String, StoredSession>>,
    contacts: RwLock<HashMap<String, StoredContact>>,
    messages: RwLock<Vec<StoredMessage>>,
    reactions: RwLock<Vec<Reaction>>,
    metadata: RwLock<HashMap<String, StoredAppMetadata>>,
    files: RwLock<HashMap<String, FileRecord>>,
    transfers: RwLock<HashMap<String, TransferState>>,
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn save_private_keys(&self, keys: StoredPrivateKeys) -> Result<()> {
        self.private_keys.write().insert(keys.user_id.clone(), keys);
        Ok(())
    }

    fn load_private_keys(&self, user_id: &str) -> Result<Option<StoredPrivateKeys>> {
        Ok(self.private_keys.read().get(user_id).cloned())
    }

    fn save_session(&self, session: StoredSession) -> Result<()> {
        self.sessions.write().insert(session.contact_id.clone(), session);
        Ok(())
    }

    fn load_session(&self, contact_id: &str) -> Result<Option<StoredSession>> {
        Ok(self.sessions.read().get(contact_id).cloned())
    }

    fn load_all_sessions(&self) -> Result<Vec<StoredSession>> {
        Ok(self.sessions.read().values().cloned().collect())
    }

    fn delete_session(&self, contact_id: &str) -> Result<()> {
        self.sessions.write().remove(contact_id);
        Ok(())
    }

    fn save_contact(&self, contact: StoredContact) -> Result<()> {
        self.contacts.write().insert(contact.id.clone(), contact);
        Ok(())
    }

    fn load_contact(&self, contact_id: &str) -> Result<Option<StoredContact>> {
        Ok(self.contacts.read().get(contact_id).cloned())
    }

    fn load_all_contacts(&self) -> Result<Vec<StoredContact>> {
        Ok(self.contacts.read().values().cloned().collect())
    }

    fn delete_contact(&self, contact_id: &str) -> Result<()> {
        self.contacts.write().remove(contact_id);
        Ok(())
    }

    fn save_message(&self, message: StoredMessage) -> Result<()> {
        let mut messages = self.messages.write();
        if let Some(existing) = messages.iter_mut().find(|m| m.id == message.id) {
            *existing = message;
        } else {
            messages.push(message);
        }
        Ok(())
    }

    fn load_message(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        Ok(self
            .messages
            .read()
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
        let mut messages: Vec<StoredMessage> = self
            .messages
            .read()
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
        self.messages.write().retain(|m| m.id != message_id);
        Ok(())
    }

    fn add_reaction(&self, reaction: Reaction) -> Result<()> {
        let mut reactions = self.reactions.write();
        let duplicate = reactions.iter().any(|r| {
            r.message_id == reaction.message_id
                && r.sender_id == reaction.sender_id
                && r.emoji == reaction.emoji
        });
        if !duplicate {
            reactions.push(reaction);
        }
        Ok(())
    }

    fn remove_reaction(&self, message_id: &str, sender_id: &str, emoji: &str) -> Result<()> {
        self.reactions.write().retain(|r| {
            !(r.message_id == message_id && r.sender_id == sender_id && r.emoji == emoji)
        });
        Ok(())
    }

    fn load_reactions(&self, message_id: &str) -> Result<Vec<Reaction>> {
        Ok(self
            .reactions
            .read()
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect())
    }

    fn save_metadata(&self, metadata: StoredAppMetadata) -> Result<()> {
        self.metadata.write().insert(metadata.user_id.clone(), metadata);
        Ok(())
    }

    fn load_metadata(&self, user_id: &str) -> Result<Option<StoredAppMetadata>> {
        Ok(self.metadata.read().get(user_id).cloned())
    }

    fn save_file_record(&self, file: FileRecord) -> Result<()> {
        self.files.write().insert(file.id.clone(), file);
        Ok(())
    }

    fn load_file_record(&self, file_id: &str) -> Result<Option<FileRecord>> {
        Ok(self.files.read().get(file_id).cloned())
    }

    fn delete_file_record(&self, file_id: &str) -> Result<()> {
        self.files.write().remove(file_id);
        Ok(())
    }

    fn save_transfer(&self, transfer: TransferState) -> Result<()> {
        self.transfers.write().insert(transfer.transfer_id.clone(), transfer);
        Ok(())
    }

    fn load_transfer(&self, transfer_id: &str) -> Result<Option<TransferState>> {
        Ok(self.transfers.read().get(transfer_id).cloned())
    }

    fn load_transfers(&self, contact_id: &str) -> Result<Vec<TransferState>> {
        Ok(self
            .transfers
            .read()
            .values()
            .filter(|t| t.contact_id == contact_id)
            .cloned()
            .collect())
    }

    fn delete_transfer(&self, transfer_id: &str) -> Result<()> {
        self.transfers.write().remove(transfer_id);
        Ok(())
    }

    fn complete_file_transfer(&self, file: FileRecord, transfer: TransferState) -> Result<()> {
        self.files.write().insert(file.id.clone(), file);
        self.transfers
            .write()
            .insert(transfer.transfer_id.clone(), transfer);
        Ok(())
    }

    fn save_conversation(&self, conversation: Conversation) -> Result<()> {
        self.conversations
            .write()
            .insert(conversation.contact_id.clone(), conversation);
        Ok(())
    }

    fn load_conversation(&self, contact_id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().get(contact_id).cloned())
    }

    fn load_all_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.conversations.read().values().cloned().collect())
    }

    fn clear_all(&self) -> Result<()> {
        self.private_keys.write().clear();
        self.sessions.write().clear();
        self.contacts.write().clear();
        self.messages.write().clear();
        self.reactions.write().clear();
        self.metadata.write().clear();
        self.files.write().clear();
        self.transfers.write().clear();
        self.conversations.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn sample_message(id: &str, contact_id: &str, sent_at: i64) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            contact_id: contact_id.to_string(),
            from: "self".to_string(),
            to: contact_id.to_string(),
            kind: MessageKind::Text,
            body: Some("hello".to_string()),
            reply_to: None,
            file_ref: None,
            sent_at,
            received_at: None,
            edited: false,
            deleted: false,
            status: MessageStatus::Sent,
        }
    }

    #[test]
    fn contacts_round_trip() {
        let store = MemoryStore::new();
        store.save_contact(sample_contact("c1")).unwrap();
        assert!(store.load_contact("c1").unwrap().is_some());
        assert_eq!(store.load_all_contacts().unwrap().len(), 1);
        store.delete_contact("c1").unwrap();
        assert!(store.load_contact("c1").unwrap().is_none());
    }

    #[test]
    fn messages_paginate_ascending_by_sent_at() {
        let store = MemoryStore::new();
        store.save_message(sample_message("m2", "c1", 200)).unwrap();
        store.save_message(sample_message("m1", "c1", 100)).unwrap();
        store.save_message(sample_message("m3", "c1", 300)).unwrap();

        let page = store.load_messages("c1", 10, None).unwrap();
        assert_eq!(
            page.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2", "m3"]
        );

        let before = store.load_messages("c1", 10, Some(300)).unwrap();
        assert_eq!(before.len(), 2);
    }

    #[test]
    fn reactions_are_deduplicated() {
        let store = MemoryStore::new();
        let reaction = Reaction {
            message_id: "m1".to_string(),
            sender_id: "self".to_string(),
            emoji: "👍".to_string(),
            added_at: 1,
        };
        store.add_reaction(reaction.clone()).unwrap();
        store.add_reaction(reaction).unwrap();
        assert_eq!(store.load_reactions("m1").unwrap().len(), 1);
    }

    #[test]
    fn remove_reaction_on_missing_entry_is_a_no_op() {
        let store = MemoryStore::new();
        store.remove_reaction("m1", "self", "👍").unwrap();
        assert!(store.load_reactions("m1").unwrap().is_empty());
    }

    #[test]
    fn transfers_filter_by_contact() {
        let store = MemoryStore::new();
        let transfer = TransferState {
            transfer_id: "t1".to_string(),
            contact_id: "c1".to_string(),
            direction: TransferDirection::Send,
            file_id: None,
            filename: "a.bin".to_string(),
            mime: "application/octet-stream".to_string(),
            size: 100,
            chunk_size: 16 * 1024,
            next_chunk_index: 0,
            bytes_transferred: 0,
            sha256_expected: "deadbeef".to_string(),
            status: TransferStatus::Negotiating,
            failure_reason: None,
            updated_at: 1,
        };
        store.save_transfer(transfer).unwrap();
        assert_eq!(store.load_transfers("c1").unwrap().len(), 1);
        assert_eq!(store.load_transfers("c2").unwrap().len(), 0);
    }

    #[test]
    fn clear_all_empties_every_table() {
        let store = MemoryStore::new();
        store.save_contact(sample_contact("c1")).unwrap();
        store.save_message(sample_message("m1", "c1", 1)).unwrap();
        store.clear_all().unwrap();
        assert!(store.load_all_contacts().unwrap().is_empty());
        assert!(store.load_messages("c1", 10, None).unwrap().is_empty());
    }
}
