//! X3DH-lite: a 2-DH key agreement used to seed the Double Ratchet root
//! chain for a direct peer-to-peer session.
//!
//! Unlike the full X3DH in [`super::x3dh`], there is no signed prekey and
//! no server-held registration bundle: contacts exchange a single
//! long-term key-agreement public key out of band (verified by fingerprint),
//! and the handshake itself runs over exactly two Diffie-Hellman operations
//! carried on the first ratchet message.
//!
//! ```text
//! Alice (initiator)                              Bob (responder)
//! ==================                             ================
//! generate ephemeral E
//! DH1 = DH(E_priv, Bob_KA_pub)
//! DH2 = DH(Alice_KA_priv, Bob_KA_pub)
//! shared_secret = HKDF(DH1 ‖ DH2, info=CONST_X3DH_V1)
//! send {ephemeral_public: E_pub} with the first ciphertext →
//!                                                 DH1' = DH(Bob_KA_priv, E_pub)
//!                                                 DH2' = DH(Bob_KA_priv, Alice_KA_pub)
//!                                                 shared_secret = HKDF(DH1' ‖ DH2', info=CONST_X3DH_V1)
//! ```
//!
//! DH commutativity (`DH(a, B) = DH(b, A)`) makes `DH1 = DH1'` and
//! `DH2 = DH2'`, so both sides land on the same shared secret without ever
//! exchanging it.

use crate::crypto::constants::CONST_X3DH_V1;
use crate::crypto::handshake::InitiatorState;
use crate::crypto::provider::CryptoProvider;
use crate::crypto::SuiteID;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// A contact's long-term key-agreement public key, exchanged out of band
/// (e.g. via fingerprint verification) rather than fetched from a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X3DHLitePublicKey {
    pub ka_public: Vec<u8>,
    pub suite_id: SuiteID,
}

/// Stateless X3DH-lite implementation; all data is passed through method
/// parameters rather than held on the type.
pub struct X3DHLiteProtocol<P: CryptoProvider> {
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> X3DHLiteProtocol<P> {
    /// Generate the long-term key-agreement keypair a contact publishes
    /// (handed out directly, e.g. as part of a fingerprint-verified contact
    /// add, not submitted to any server).
    pub fn generate_identity_keys() -> Result<(P::KemPrivateKey, X3DHLitePublicKey), String> {
        let (private_key, public_key) = P::generate_kem_keys().map_err(|e| e.to_string())?;
        Ok((
            private_key,
            X3DHLitePublicKey {
                ka_public: public_key.as_ref().to_vec(),
                suite_id: P::suite_id(),
            },
        ))
    }

    /// Run the handshake as the session initiator.
    pub fn perform_as_initiator(
        local_identity: &P::KemPrivateKey,
        remote: &X3DHLitePublicKey,
    ) -> Result<(Vec<u8>, InitiatorState<P>), String> {
        use tracing::{debug, trace};

        debug!(target: "crypto::x3dh_lite", "Starting X3DH-lite as initiator");

        let (ephemeral_private, ephemeral_public) =
            P::generate_kem_keys().map_err(|e| format!("Failed to generate ephemeral key: {}", e))?;
        trace!(
            target: "crypto::x3dh_lite",
            ephemeral_public_len = %ephemeral_public.as_ref().len(),
            "Ephemeral key generated"
        );

        let remote_ka_public = P::kem_public_key_from_bytes(remote.ka_public.clone());

        let dh1 = P::kem_decapsulate(&ephemeral_private, remote_ka_public.as_ref())
            .map_err(|e| format!("DH1 failed: {}", e))?;
        let dh2 = P::kem_decapsulate(local_identity, remote_ka_public.as_ref())
            .map_err(|e| format!("DH2 failed: {}", e))?;

        let mut combined = Vec::with_capacity(dh1.len() + dh2.len());
        combined.extend_from_slice(&dh1);
        combined.extend_from_slice(&dh2);

        let shared_secret = P::hkdf_derive_key(b"", &combined, CONST_X3DH_V1, 32)
            .map_err(|e| format!("HKDF derivation failed: {}", e))?;

        debug!(target: "crypto::x3dh_lite", "X3DH-lite completed as initiator");

        Ok((shared_secret, InitiatorState { ephemeral_private }))
    }

    /// Run the handshake as the session responder, given the initiator's
    /// long-term key-agreement public key and the ephemeral public key
    /// carried on the first ratchet message.
    pub fn perform_as_responder(
        local_identity: &P::KemPrivateKey,
        remote_identity: &P::KemPublicKey,
        remote_ephemeral: &P::KemPublicKey,
    ) -> Result<Vec<u8>, String> {
        use tracing::debug;

        debug!(target: "crypto::x3dh_lite", "Starting X3DH-lite as responder");

        let dh1 = P::kem_decapsulate(local_identity, remote_ephemeral.as_ref())
            .map_err(|e| format!("DH1 failed: {}", e))?;
        let dh2 = P::kem_decapsulate(local_identity, remote_identity.as_ref())
            .map_err(|e| format!("DH2 failed: {}", e))?;

        let mut combined = Vec::with_capacity(dh1.len() + dh2.len());
        combined.extend_from_slice(&dh1);
        combined.extend_from_slice(&dh2);

        let shared_secret = P::hkdf_derive_key(b"", &combined, CONST_X3DH_V1, 32)
            .map_err(|e| format!("HKDF derivation failed: {}", e))?;

        debug!(target: "crypto::x3dh_lite", "X3DH-lite completed as responder");

        Ok(shared_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::suites::classic::ClassicSuiteProvider;

    #[test]
    fn alice_and_bob_agree_on_the_same_secret() {
        let (alice_priv, alice_pub) =
            X3DHLiteProtocol::<ClassicSuiteProvider>::generate_identity_keys().unwrap();
        let (bob_priv, bob_pub) =
            X3DHLiteProtocol::<ClassicSuiteProvider>::generate_identity_keys().unwrap();

        let (alice_secret, initiator_state) =
            X3DHLiteProtocol::<ClassicSuiteProvider>::perform_as_initiator(&alice_priv, &bob_pub)
                .unwrap();

        let alice_ephemeral_pub =
            ClassicSuiteProvider::from_private_key_to_public_key(&initiator_state.ephemeral_private)
                .unwrap();
        let alice_identity_pub = ClassicSuiteProvider::kem_public_key_from_bytes(alice_pub.ka_public);

        let bob_secret = X3DHLiteProtocol::<ClassicSuiteProvider>::perform_as_responder(
            &bob_priv,
            &alice_identity_pub,
            &alice_ephemeral_pub,
        )
        .unwrap();

        assert_eq!(alice_secret, bob_secret);
        assert_eq!(alice_secret.len(), 32);
    }
}
