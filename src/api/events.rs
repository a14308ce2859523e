//! The facade's unified event stream (spec §6): every background task in
//! [`crate::state::MessengerApp`] feeds one shared sender, and the caller
//! drains a single receiver instead of juggling one channel per concern.

use crate::messaging::events::Event as MessagingEvent;
use crate::protocol::messages::PresenceStatus;
use crate::protocol::peer::PeerState;
use crate::protocol::signalling::SignallingState;
use crate::transfer::TransferEvent;

/// One push notification toward the UI layer. Variant names follow the
/// eight event kinds the facade promises: `connection`, `presence`,
/// `message`, `p2p_state`, `file_progress`, `file_received`,
/// `transfer_complete`, `transfer_error`.
#[derive(Debug, Clone)]
pub enum ApiEvent {
    /// The signalling socket's connection state changed.
    Connection(SignallingState),
    /// A contact's presence changed, driven by the signalling client.
    Presence {
        contact_id: String,
        status: PresenceStatus,
    },
    /// Anything about a conversation: a new/edited/deleted message, a
    /// reaction, a typing indicator, or an undecryptable frame. Carries the
    /// messaging service's own event type rather than flattening it, since
    /// the UI needs to distinguish these sub-kinds anyway.
    Message(MessagingEvent),
    /// A contact's peer-to-peer connection state changed.
    P2pState {
        contact_id: String,
        state: PeerState,
    },
    FileProgress {
        transfer_id: String,
        contact_id: String,
        bytes_transferred: u64,
        total: u64,
        speed_bps: f64,
        eta_secs: Option<f64>,
    },
    FileReceived {
        transfer_id: String,
        contact_id: String,
        file_id: String,
        filename: String,
    },
    TransferComplete {
        transfer_id: String,
        contact_id: String,
    },
    TransferError {
        transfer_id: String,
        contact_id: String,
        reason: String,
    },
}

impl From<TransferEvent> for ApiEvent {
    fn from(event: TransferEvent) -> Self {
        match event {
            TransferEvent::Progress { transfer_id, contact_id, bytes_transferred, total, speed_bps, eta_secs } => {
                ApiEvent::FileProgress { transfer_id, contact_id, bytes_transferred, total, speed_bps, eta_secs }
            }
            TransferEvent::Received { transfer_id, contact_id, file_id, filename } => {
                ApiEvent::FileReceived { transfer_id, contact_id, file_id, filename }
            }
            TransferEvent::Completed { transfer_id, contact_id } => {
                ApiEvent::TransferComplete { transfer_id, contact_id }
            }
            TransferEvent::Failed { transfer_id, contact_id, reason } => {
                ApiEvent::TransferError { transfer_id, contact_id, reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_progress_maps_to_file_progress() {
        let event = TransferEvent::Progress {
            transfer_id: "t1".to_string(),
            contact_id: "bob".to_string(),
            bytes_transferred: 10,
            total: 100,
            speed_bps: 5.0,
            eta_secs: Some(18.0),
        };
        match ApiEvent::from(event) {
            ApiEvent::FileProgress { transfer_id, total, .. } => {
                assert_eq!(transfer_id, "t1");
                assert_eq!(total, 100);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn transfer_failure_maps_to_transfer_error() {
        let event = TransferEvent::Failed {
            transfer_id: "t2".to_string(),
            contact_id: "bob".to_string(),
            reason: "peer closed".to_string(),
        };
        assert!(matches!(ApiEvent::from(event), ApiEvent::TransferError { .. }));
    }
}
