//! Everything between the messaging service and the network: signalling
//! envelopes (4.E), the ICE/DTLS/SCTP peer connection (4.F), and the
//! data-channel wire format (4.G).

pub mod messages;
pub mod peer;
pub mod signalling;
pub mod validation;
pub mod wire;

pub use messages::SignallingEnvelope;
pub use peer::{PeerConnectionManager, PeerState};
pub use signalling::{SignallingClient, SignallingState};
pub use wire::Frame;
