//! Events the messaging service publishes toward the facade's event bus
//! (spec §6: `message`, `presence`, `p2p_state`).

use crate::protocol::messages::PresenceStatus;
use crate::protocol::peer::PeerState;
use crate::storage::models::MessageStatus;

#[derive(Debug, Clone)]
pub enum Event {
    MessageReceived {
        contact_id: String,
        message_id: String,
        body: String,
        sent_at: i64,
        received_at: i64,
    },
    /// A single inbound frame's ciphertext failed to authenticate; the
    /// conversation is otherwise unaffected (spec §7's "message unreadable").
    MessageUndecryptable {
        contact_id: String,
        frame_id: String,
    },
    MessageStatusChanged {
        message_id: String,
        status: MessageStatus,
    },
    MessageEdited {
        message_id: String,
        new_body: String,
    },
    MessageDeleted {
        message_id: String,
    },
    ReactionAdded {
        message_id: String,
        sender_id: String,
        emoji: String,
    },
    ReactionRemoved {
        message_id: String,
        sender_id: String,
        emoji: String,
    },
    TypingChanged {
        contact_id: String,
        active: bool,
    },
    PresenceChanged {
        contact_id: String,
        status: PresenceStatus,
    },
    PeerStateChanged {
        contact_id: String,
        state: PeerState,
    },
}
