//! Facade (spec component 4.J): the single callable surface the UI
//! consumes. Every method here is request/response; anything push-shaped
//! (messages, presence, progress, connection/peer state) arrives on the
//! [`events::ApiEvent`] stream returned by [`MessengerAPI::start`] instead.

pub mod events;

pub use events::ApiEvent;

use crate::crypto::backup::BackupEnvelope;
use crate::identity::{decode_public_identity_bundle, fingerprint_of, Identity};
use crate::protocol::peer::PeerState;
use crate::protocol::signalling::SignallingState;
use crate::state::{MessengerApp, Provider};
use crate::storage::models::{
    Reaction, StoredAppMetadata, StoredContact, StoredMessage, TransferDirection, TransferState,
    UserStatus,
};
use crate::utils::error::{MessengerError, Result};
use crate::utils::time::current_timestamp;
use crate::utils::uuid::generate_v4;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

const LOCAL_USER_ID: &str = "self";

/// The identity a caller can see: never the private keys, only what a
/// contact needs to add this installation and what the UI shows for it.
#[derive(Debug, Clone)]
pub struct IdentityInfo {
    pub display_name: String,
    pub fingerprint: String,
    /// Hex bundle a contact hands to [`MessengerAPI::add_contact`].
    pub public_identity: String,
    pub created_at: i64,
}

impl IdentityInfo {
    fn from_identity(identity: &Identity<Provider>) -> Self {
        Self {
            display_name: identity.display_name.clone(),
            fingerprint: identity.fingerprint(),
            public_identity: identity.public_identity_bundle(),
            created_at: identity.created_at,
        }
    }
}

/// A contact row plus its transient presence, joined at read time since
/// presence itself is never persisted (spec §3).
#[derive(Debug, Clone)]
pub struct ContactInfo {
    pub id: String,
    pub display_name: String,
    pub nickname: Option<String>,
    pub verified: bool,
    pub fingerprint: String,
    pub presence: crate::protocol::messages::PresenceStatus,
    pub added_at: i64,
    pub last_message_at: Option<i64>,
}

/// The recognised settings bundle (spec §6).
#[derive(Debug, Clone)]
pub struct SettingsSnapshot {
    pub signaling_server: String,
    pub user_status: UserStatus,
    pub notifications_enabled: bool,
    pub notifications_messages: bool,
    pub notifications_calls: bool,
    pub update_channel: String,
    pub theme: String,
}

/// The UI-facing facade. Cheap to clone (an `Arc` to the running app);
/// every method borrows `&self` so multiple UI surfaces (main window,
/// notification handler) can hold their own handle.
#[derive(Clone)]
pub struct MessengerAPI {
    app: Arc<MessengerApp>,
}

impl MessengerAPI {
    /// Bring up the whole stack and return the facade plus its event
    /// stream. There is exactly one of these per process.
    pub async fn start(
        data_dir: PathBuf,
        signaling_server: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ApiEvent>)> {
        let (app, events) = MessengerApp::start(data_dir, signaling_server).await?;
        Ok((Self { app }, events))
    }

    /// Stop every background task and close open peer connections. The
    /// facade itself is still valid to drop afterwards; no method is safe
    /// to call once this returns.
    pub async fn stop(&self) {
        self.app.stop().await
    }

    #[cfg(test)]
    fn start_in_memory_for_tests(display_name: &str) -> (Self, mpsc::UnboundedReceiver<ApiEvent>) {
        let (app, events) = MessengerApp::start_in_memory_for_tests(display_name);
        (Self { app }, events)
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn get_identity(&self) -> Result<IdentityInfo> {
        Ok(IdentityInfo::from_identity(&self.app.identity()))
    }

    /// Renames the current identity. Implemented as clone-then-rename
    /// rather than a fresh keypair: the peer connection manager, signalling
    /// client and messaging service all capture this installation's key
    /// material at construction time in [`MessengerApp::start`], so a real
    /// key rotation here would leave them holding stale keys until the next
    /// restart. Display-name changes carry none of that risk.
    pub fn generate_identity(&self, display_name: &str) -> Result<IdentityInfo> {
        self.update_display_name(display_name)
    }

    pub fn update_display_name(&self, display_name: &str) -> Result<IdentityInfo> {
        let mut identity = (*self.app.identity()).clone();
        identity.rename(self.app.store().as_ref(), display_name)?;
        let info = IdentityInfo::from_identity(&identity);
        self.app.set_identity(Arc::new(identity));
        Ok(info)
    }

    pub fn export_backup(&self, password: &str) -> Result<String> {
        let envelope = self.app.identity().export_backup(password)?;
        serde_json::to_string(&envelope).map_err(|e| MessengerError::SerializationError(e.to_string()))
    }

    /// Replaces the current identity's keys from a backup. The signalling
    /// client and messaging service were wired up against the old keys at
    /// startup, so callers must restart the process (re-invoke
    /// [`MessengerAPI::start`]) for network-facing components to pick up
    /// the restored identity; store contents (contacts, messages) are
    /// unaffected either way.
    pub fn import_backup(&self, envelope_json: &str, password: &str) -> Result<IdentityInfo> {
        let envelope: BackupEnvelope = serde_json::from_str(envelope_json)
            .map_err(|e| MessengerError::SerializationError(e.to_string()))?;
        let identity = Identity::<Provider>::import_backup(
            self.app.store().as_ref(),
            self.app.master_key(),
            password,
            &envelope,
        )?;
        let info = IdentityInfo::from_identity(&identity);
        self.app.set_identity(Arc::new(identity));
        Ok(info)
    }

    // ------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------

    pub fn get_contacts(&self) -> Result<Vec<ContactInfo>> {
        Ok(self
            .app
            .store()
            .load_all_contacts()?
            .into_iter()
            .map(|contact| self.to_contact_info(contact))
            .collect())
    }

    /// `public_identity` is the hex bundle from [`IdentityInfo::public_identity`]
    /// (signing key plus key-agreement key): the signalling server never
    /// carries the key-agreement half, so it has to travel out-of-band, and
    /// the bundle is the only form a contact can hand over that this side
    /// can act on immediately (spec §4.C).
    pub fn add_contact(&self, public_identity: &str, display_name: &str) -> Result<ContactInfo> {
        let (signing_public_key, ka_public) = decode_public_identity_bundle(public_identity)?;
        if self
            .app
            .store()
            .load_all_contacts()?
            .iter()
            .any(|c| c.signing_public_key == signing_public_key)
        {
            return Err(MessengerError::AlreadyExists(
                "a contact with this public key already exists".to_string(),
            ));
        }

        let contact = StoredContact {
            id: generate_v4(),
            signing_public_key,
            ka_public_key: Some(ka_public),
            display_name: display_name.to_string(),
            nickname: None,
            verified: false,
            added_at: current_timestamp(),
            last_message_at: None,
        };
        self.app.store().save_contact(contact.clone())?;
        Ok(self.to_contact_info(contact))
    }

    pub async fn remove_contact(&self, contact_id: &str) -> Result<()> {
        let _ = self.app.messaging().reset_session(contact_id);
        self.app.peer().close(contact_id).await?;
        self.app.store().delete_contact(contact_id)
    }

    pub fn set_contact_verified(&self, contact_id: &str, verified: bool) -> Result<()> {
        let mut contact = self.load_contact(contact_id)?;
        contact.verified = verified;
        self.app.store().save_contact(contact)
    }

    pub fn set_contact_nickname(&self, contact_id: &str, nickname: Option<String>) -> Result<()> {
        let mut contact = self.load_contact(contact_id)?;
        contact.nickname = nickname;
        self.app.store().save_contact(contact)
    }

    fn load_contact(&self, contact_id: &str) -> Result<StoredContact> {
        self.app
            .store()
            .load_contact(contact_id)?
            .ok_or_else(|| MessengerError::NotFound(format!("contact {}", contact_id)))
    }

    fn to_contact_info(&self, contact: StoredContact) -> ContactInfo {
        let presence = self.app.presence_of(&contact.id);
        ContactInfo {
            fingerprint: fingerprint_of(&contact.signing_public_key),
            id: contact.id,
            display_name: contact.display_name,
            nickname: contact.nickname,
            verified: contact.verified,
            presence,
            added_at: contact.added_at,
            last_message_at: contact.last_message_at,
        }
    }

    // ------------------------------------------------------------------
    // Network
    // ------------------------------------------------------------------

    pub fn get_connection_state(&self) -> SignallingState {
        self.app.signalling().state()
    }

    pub fn get_signaling_server(&self) -> Result<String> {
        Ok(self.load_metadata()?.signaling_server)
    }

    /// Persists the new signalling URL; the running `SignallingClient`
    /// keeps talking to the URL it was constructed with until the next
    /// [`MessengerAPI::start`] (spec §5: the socket is a single
    /// sender-serialising queue, not something torn down mid-session).
    pub fn set_signaling_server(&self, url: &str) -> Result<()> {
        let mut metadata = self.load_metadata()?;
        metadata.signaling_server = url.to_string();
        self.app.store().save_metadata(metadata)
    }

    pub fn get_user_status(&self) -> Result<UserStatus> {
        Ok(self.load_metadata()?.user_status)
    }

    pub fn set_user_status(&self, status: UserStatus) -> Result<()> {
        let mut metadata = self.load_metadata()?;
        metadata.user_status = status;
        self.app.store().save_metadata(metadata)
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    pub async fn initiate_p2p(&self, contact_id: &str) -> Result<()> {
        self.app.messaging().initiate(contact_id).await
    }

    pub async fn send_message(
        &self,
        contact_id: &str,
        body: &str,
        reply_to: Option<String>,
    ) -> Result<StoredMessage> {
        self.app.messaging().send_text(contact_id, body, reply_to).await
    }

    pub fn get_messages(
        &self,
        contact_id: &str,
        limit: usize,
        before_ts: Option<i64>,
    ) -> Result<Vec<StoredMessage>> {
        self.app.store().load_messages(contact_id, limit, before_ts)
    }

    pub async fn send_typing(&self, contact_id: &str, active: bool) -> Result<()> {
        self.app.messaging().send_typing(contact_id, active).await
    }

    pub async fn edit_message(&self, contact_id: &str, message_id: &str, new_body: &str) -> Result<()> {
        self.app.messaging().send_edit(contact_id, message_id, new_body).await
    }

    pub async fn delete_message(&self, contact_id: &str, message_id: &str) -> Result<()> {
        self.app.messaging().send_delete(contact_id, message_id).await
    }

    pub async fn add_reaction(&self, contact_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        self.app.messaging().send_reaction(contact_id, message_id, emoji).await
    }

    pub async fn remove_reaction(&self, contact_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        self.app.messaging().remove_reaction(contact_id, message_id, emoji).await
    }

    pub fn get_reactions(&self, message_id: &str) -> Result<Vec<Reaction>> {
        self.app.store().load_reactions(message_id)
    }

    pub fn get_p2p_state(&self, contact_id: &str) -> Option<PeerState> {
        self.app.messaging().p2p_state(contact_id)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub async fn send_file(&self, contact_id: &str, local_path: &Path) -> Result<String> {
        self.app.transfer().send_file(contact_id, local_path).await
    }

    /// `direction`, when given, is checked against the transfer's recorded
    /// direction and rejected on mismatch; it is accepted for parity with
    /// the external interface but isn't required to find the transfer,
    /// since `transfer_id` alone is already unique.
    pub async fn cancel_transfer(
        &self,
        contact_id: &str,
        transfer_id: &str,
        direction: Option<TransferDirection>,
    ) -> Result<()> {
        if let Some(transfer) = self.app.store().load_transfer(transfer_id)? {
            if transfer.contact_id != contact_id {
                return Err(MessengerError::ValidationError(
                    "transfer does not belong to this contact".to_string(),
                ));
            }
            if let Some(direction) = direction {
                if transfer.direction != direction {
                    return Err(MessengerError::ValidationError(
                        "transfer direction does not match the recorded transfer".to_string(),
                    ));
                }
            }
        }
        self.app.transfer().cancel(transfer_id, "cancelled by user").await
    }

    pub async fn resume_transfer(&self, contact_id: &str, transfer_id: &str, local_path: &Path) -> Result<()> {
        if let Some(transfer) = self.app.store().load_transfer(transfer_id)? {
            if transfer.contact_id != contact_id {
                return Err(MessengerError::ValidationError(
                    "transfer does not belong to this contact".to_string(),
                ));
            }
        }
        self.app.transfer().resume_send(transfer_id, local_path).await
    }

    pub fn get_transfers(&self, contact_id: &str) -> Result<Vec<TransferState>> {
        self.app.store().load_transfers(contact_id)
    }

    pub fn get_file(&self, file_id: &str) -> Result<Vec<u8>> {
        self.app.transfer().read_file(file_id)
    }

    pub fn get_file_preview(&self, file_id: &str) -> Result<Option<Vec<u8>>> {
        let record = self
            .app
            .store()
            .load_file_record(file_id)?
            .ok_or_else(|| MessengerError::NotFound(format!("file {}", file_id)))?;
        Ok(record.thumbnail)
    }

    /// Native file pickers are a UI-layer concern (spec §1 places the view
    /// layer out of scope for this crate); always `Unsupported`.
    pub fn open_file_dialog(&self) -> Result<PathBuf> {
        Err(MessengerError::Unsupported(
            "native file dialogs are provided by the UI layer, not the core".to_string(),
        ))
    }

    // ------------------------------------------------------------------
    // System
    // ------------------------------------------------------------------

    pub fn ping(&self) -> Result<String> {
        Ok("pong".to_string())
    }

    pub fn get_settings(&self) -> Result<SettingsSnapshot> {
        let metadata = self.load_metadata()?;
        Ok(SettingsSnapshot {
            signaling_server: metadata.signaling_server,
            user_status: metadata.user_status,
            notifications_enabled: metadata.notifications_enabled,
            notifications_messages: metadata.notifications_messages,
            notifications_calls: metadata.notifications_calls,
            update_channel: metadata.update_channel,
            theme: metadata.theme,
        })
    }

    pub fn set_notifications_enabled(&self, enabled: bool) -> Result<()> {
        let mut metadata = self.load_metadata()?;
        metadata.notifications_enabled = enabled;
        self.app.store().save_metadata(metadata)
    }

    pub fn set_notifications_messages(&self, enabled: bool) -> Result<()> {
        let mut metadata = self.load_metadata()?;
        metadata.notifications_messages = enabled;
        self.app.store().save_metadata(metadata)
    }

    pub fn set_notifications_calls(&self, enabled: bool) -> Result<()> {
        let mut metadata = self.load_metadata()?;
        metadata.notifications_calls = enabled;
        self.app.store().save_metadata(metadata)
    }

    pub fn set_update_channel(&self, channel: &str) -> Result<()> {
        let mut metadata = self.load_metadata()?;
        metadata.update_channel = channel.to_string();
        self.app.store().save_metadata(metadata)
    }

    pub fn set_theme(&self, theme: &str) -> Result<()> {
        let mut metadata = self.load_metadata()?;
        metadata.theme = theme.to_string();
        self.app.store().save_metadata(metadata)
    }

    fn load_metadata(&self) -> Result<StoredAppMetadata> {
        self.app
            .store()
            .load_metadata(LOCAL_USER_ID)?
            .ok_or_else(|| MessengerError::InternalError("identity metadata missing".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_app_has_a_bootstrapped_identity() {
        let (api, _events) = MessengerAPI::start_in_memory_for_tests("alice");
        let identity = api.get_identity().unwrap();
        assert_eq!(identity.display_name, "alice");
        assert!(!identity.fingerprint.is_empty());
    }

    #[test]
    fn update_display_name_changes_identity_without_touching_keys() {
        let (api, _events) = MessengerAPI::start_in_memory_for_tests("alice");
        let before = api.get_identity().unwrap();
        let after = api.update_display_name("alicia").unwrap();
        assert_eq!(after.display_name, "alicia");
        assert_eq!(after.public_identity, before.public_identity);
    }

    #[test]
    fn add_contact_round_trips_through_get_contacts() {
        let (alice, _alice_events) = MessengerAPI::start_in_memory_for_tests("alice");
        let (bob, _bob_events) = MessengerAPI::start_in_memory_for_tests("bob");
        let bob_identity = bob.get_identity().unwrap();

        let contact = alice.add_contact(&bob_identity.public_identity, "bob").unwrap();
        assert_eq!(contact.display_name, "bob");
        assert_eq!(contact.fingerprint, bob_identity.fingerprint);

        let contacts = alice.get_contacts().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].id, contact.id);
    }

    #[test]
    fn adding_the_same_public_identity_twice_is_rejected() {
        let (alice, _alice_events) = MessengerAPI::start_in_memory_for_tests("alice");
        let (bob, _bob_events) = MessengerAPI::start_in_memory_for_tests("bob");
        let bob_identity = bob.get_identity().unwrap();

        alice.add_contact(&bob_identity.public_identity, "bob").unwrap();
        let result = alice.add_contact(&bob_identity.public_identity, "bob again");
        assert!(matches!(result, Err(MessengerError::AlreadyExists(_))));
    }

    #[test]
    fn malformed_public_identity_is_rejected_before_touching_the_store() {
        let (alice, _alice_events) = MessengerAPI::start_in_memory_for_tests("alice");
        assert!(alice.add_contact("not-a-valid-bundle", "mallory").is_err());
        assert!(alice.get_contacts().unwrap().is_empty());
    }

    #[test]
    fn set_contact_nickname_and_verified_persist() {
        let (alice, _alice_events) = MessengerAPI::start_in_memory_for_tests("alice");
        let (bob, _bob_events) = MessengerAPI::start_in_memory_for_tests("bob");
        let bob_identity = bob.get_identity().unwrap();
        let contact = alice.add_contact(&bob_identity.public_identity, "bob").unwrap();

        alice.set_contact_nickname(&contact.id, Some("bobby".to_string())).unwrap();
        alice.set_contact_verified(&contact.id, true).unwrap();

        let reloaded = &alice.get_contacts().unwrap()[0];
        assert_eq!(reloaded.nickname.as_deref(), Some("bobby"));
        assert!(reloaded.verified);
    }

    #[test]
    fn open_file_dialog_is_unsupported() {
        let (api, _events) = MessengerAPI::start_in_memory_for_tests("alice");
        assert!(matches!(api.open_file_dialog(), Err(MessengerError::Unsupported(_))));
    }

    #[test]
    fn settings_round_trip_through_the_store() {
        let (api, _events) = MessengerAPI::start_in_memory_for_tests("alice");
        api.set_signaling_server("wss://relay.example").unwrap();
        api.set_theme("dark").unwrap();
        api.set_notifications_messages(false).unwrap();

        let settings = api.get_settings().unwrap();
        assert_eq!(settings.signaling_server, "wss://relay.example");
        assert_eq!(settings.theme, "dark");
        assert!(!settings.notifications_messages);
    }

    #[test]
    fn ping_always_succeeds() {
        let (api, _events) = MessengerAPI::start_in_memory_for_tests("alice");
        assert_eq!(api.ping().unwrap(), "pong");
    }

    #[test]
    fn get_messages_on_unknown_contact_is_an_empty_page() {
        let (api, _events) = MessengerAPI::start_in_memory_for_tests("alice");
        assert!(api.get_messages("nobody", 10, None).unwrap().is_empty());
    }
}
