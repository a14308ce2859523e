//! Key agreement (spec component 4.D's handshake half): establishes a
//! shared secret between two parties with no prior contact, used once per
//! session to seed the Double Ratchet root chain.
//!
//! The only implementation carried forward is X3DH-lite
//! ([`x3dh_lite`]) — a 2-DH handshake with no signed prekey, appropriate
//! for a synchronous direct peer-to-peer handshake where both contacts
//! already hold each other's long-term key-agreement public key.

use crate::crypto::provider::CryptoProvider;

/// State the initiator carries out of the handshake and into the Double
/// Ratchet: the ephemeral key-agreement private key becomes the first DH
/// ratchet key, so it must not be regenerated.
#[derive(Debug, Clone)]
pub struct InitiatorState<P: CryptoProvider> {
    pub ephemeral_private: P::KemPrivateKey,
}

pub mod x3dh_lite;

pub use x3dh_lite::{X3DHLiteProtocol, X3DHLitePublicKey};
