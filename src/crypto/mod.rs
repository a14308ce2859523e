//! Cryptography layer (spec components 4.C/4.D): a crypto-agile provider
//! trait, the X3DH-lite handshake, the Double Ratchet, the per-contact
//! session wrapper, and the password-encrypted identity backup envelope.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  messaging::service                      │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              session_api::PeerSession                    │
//! │  one per contact: handshake + ratchet behind one handle  │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!              ┌─────────────┴─────────────┐
//!              ▼                           ▼
//! ┌───────────────────────────┐  ┌──────────────────────────┐
//! │ handshake::x3dh_lite       │  │ messaging::double_ratchet │
//! │  2-DH handshake, no        │  │  forward-secret,          │
//! │  signed prekey             │  │  out-of-order tolerant    │
//! └───────────────────────────┘  └──────────────────────────┘
//!              │                           │
//!              └─────────────┬─────────────┘
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  provider::CryptoProvider                │
//! │  KEM · signatures · AEAD · HKDF, one concrete suite       │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod provider;
pub mod handshake;
pub mod messaging;
pub mod suites;

/// Frozen HKDF domain-separation labels shared across the handshake,
/// ratchet, backup envelope and file transfer.
pub mod constants;

/// High-level per-contact session, combining handshake + ratchet.
pub mod session_api;

pub mod backup;

pub use provider::CryptoProvider;

pub type SuiteID = u16;

/// Suite ID for the classic suite
pub const CLASSIC_SUITE_ID: SuiteID = 1;
