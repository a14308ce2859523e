//! Messaging service (spec component 4.H): orchestrates identity, ratchet
//! sessions, the peer connection manager and the signalling client behind
//! one request surface, and publishes [`Event`] for the facade to forward.

pub mod events;
pub mod service;

pub use events::Event;
pub use service::MessagingService;
