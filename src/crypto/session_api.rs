//! Session API — the high-level handle the messaging service holds per
//! contact, combining the X3DH-lite handshake with a Double Ratchet
//! messaging session behind one type.
//!
//! ## Responsibility
//!
//! - Coordinate handshake + messaging for one contact.
//! - Simplify the API surface the messaging service drives.
//!
//! ## Not responsible for
//!
//! - Managing multiple sessions (the messaging service's session table).
//! - Key storage (the store / identity module).
//! - Network transport (the peer connection manager).

use crate::crypto::messaging::SecureMessaging;
use crate::crypto::provider::CryptoProvider;
use std::marker::PhantomData;

/// A direct peer-to-peer session seeded by X3DH-lite.
///
/// Not generic over a handshake trait: X3DH-lite has no signed prekey, so
/// its handshake methods don't fit a responder signature built around one.
/// This type calls
/// [`X3DHLiteProtocol`](crate::crypto::handshake::x3dh_lite::X3DHLiteProtocol)
/// directly instead.
pub struct PeerSession<P: CryptoProvider, M: SecureMessaging<P>> {
    contact_id: String,
    messaging_session: M,
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider, M: SecureMessaging<P>> PeerSession<P, M> {
    /// Wrap an already-constructed messaging session, e.g. one just
    /// deserialised from the store on restart.
    pub fn from_messaging_session(contact_id: String, messaging_session: M) -> Self {
        Self {
            contact_id,
            messaging_session,
            _phantom: PhantomData,
        }
    }

    /// Start a session as the contact who sent the first `session-init` frame.
    pub fn init_as_initiator(
        local_identity: &P::KemPrivateKey,
        remote: &crate::crypto::handshake::x3dh_lite::X3DHLitePublicKey,
        remote_identity: &P::KemPublicKey,
        contact_id: String,
    ) -> Result<Self, String> {
        use crate::crypto::handshake::x3dh_lite::X3DHLiteProtocol;
        use tracing::info;

        let (root_key, initiator_state) =
            X3DHLiteProtocol::<P>::perform_as_initiator(local_identity, remote)?;

        let messaging_session = M::new_initiator_session(
            root_key.as_ref(),
            initiator_state,
            remote_identity,
            contact_id.clone(),
        )?;

        info!(
            target: "crypto::session",
            session_id = %messaging_session.session_id(),
            "Peer session initialized as initiator"
        );

        Ok(Self {
            contact_id,
            messaging_session,
            _phantom: PhantomData,
        })
    }

    /// Start a session upon receiving the first `session-init` frame, and
    /// decrypt the first ratchet message it carried.
    pub fn init_as_responder(
        local_identity: &P::KemPrivateKey,
        remote_identity: &P::KemPublicKey,
        remote_ephemeral: &P::KemPublicKey,
        first_message: &M::EncryptedMessage,
        contact_id: String,
    ) -> Result<(Self, Vec<u8>), String> {
        use crate::crypto::handshake::x3dh_lite::X3DHLiteProtocol;
        use tracing::info;

        let root_key = X3DHLiteProtocol::<P>::perform_as_responder(
            local_identity,
            remote_identity,
            remote_ephemeral,
        )?;

        let (messaging_session, plaintext) = M::new_responder_session(
            root_key.as_ref(),
            local_identity,
            first_message,
            contact_id.clone(),
        )?;

        info!(
            target: "crypto::session",
            session_id = %messaging_session.session_id(),
            "Peer session initialized as responder"
        );

        let session = Self {
            contact_id,
            messaging_session,
            _phantom: PhantomData,
        };

        Ok((session, plaintext))
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<M::EncryptedMessage, String> {
        self.messaging_session.encrypt(plaintext)
    }

    pub fn decrypt(&mut self, message: &M::EncryptedMessage) -> Result<Vec<u8>, String> {
        self.messaging_session.decrypt(message)
    }

    pub fn session_id(&self) -> &str {
        self.messaging_session.session_id()
    }

    pub fn contact_id(&self) -> &str {
        &self.contact_id
    }

    pub fn cleanup_old_skipped_keys(&mut self, max_age_seconds: i64) {
        self.messaging_session
            .cleanup_old_skipped_keys(max_age_seconds);
    }

    pub fn messaging_session_mut(&mut self) -> &mut M {
        &mut self.messaging_session
    }

    pub fn messaging_session(&self) -> &M {
        &self.messaging_session
    }
}

/// Convenience type alias for X3DH-lite + Double Ratchet with the classic suite.
pub type ClassicPeerSession<P> =
    PeerSession<P, crate::crypto::messaging::double_ratchet::DoubleRatchetSession<P>>;

#[cfg(test)]
mod peer_session_tests {
    use super::*;
    use crate::crypto::handshake::x3dh_lite::X3DHLiteProtocol;
    use crate::crypto::messaging::double_ratchet::DoubleRatchetSession;
    use crate::crypto::suites::classic::ClassicSuiteProvider;

    type TestPeerSession = PeerSession<ClassicSuiteProvider, DoubleRatchetSession<ClassicSuiteProvider>>;

    #[test]
    fn full_exchange_over_x3dh_lite() {
        let (alice_priv, alice_pub) =
            X3DHLiteProtocol::<ClassicSuiteProvider>::generate_identity_keys().unwrap();
        let (bob_priv, bob_pub) =
            X3DHLiteProtocol::<ClassicSuiteProvider>::generate_identity_keys().unwrap();

        let alice_identity_pub =
            ClassicSuiteProvider::kem_public_key_from_bytes(alice_pub.ka_public.clone());
        let bob_identity_pub =
            ClassicSuiteProvider::kem_public_key_from_bytes(bob_pub.ka_public.clone());

        let mut alice_session = TestPeerSession::init_as_initiator(
            &alice_priv,
            &bob_pub,
            &bob_identity_pub,
            "bob".to_string(),
        )
        .unwrap();

        let plaintext1 = b"Hello Bob! This is Alice.";
        let encrypted1 = alice_session.encrypt(plaintext1).unwrap();

        let alice_ephemeral_pub =
            ClassicSuiteProvider::kem_public_key_from_bytes(encrypted1.dh_public_key.to_vec());

        let (mut bob_session, decrypted1) = TestPeerSession::init_as_responder(
            &bob_priv,
            &alice_identity_pub,
            &alice_ephemeral_pub,
            &encrypted1,
            "alice".to_string(),
        )
        .unwrap();

        assert_eq!(decrypted1, plaintext1);

        let plaintext2 = b"Hi Alice! This is Bob.";
        let encrypted2 = bob_session.encrypt(plaintext2).unwrap();
        let decrypted2 = alice_session.decrypt(&encrypted2).unwrap();
        assert_eq!(decrypted2, plaintext2);

        assert_eq!(alice_session.contact_id(), "bob");
        assert_eq!(bob_session.contact_id(), "alice");
    }

    #[test]
    fn out_of_order_delivery_still_decrypts() {
        let (alice_priv, alice_pub) =
            X3DHLiteProtocol::<ClassicSuiteProvider>::generate_identity_keys().unwrap();
        let (bob_priv, bob_pub) =
            X3DHLiteProtocol::<ClassicSuiteProvider>::generate_identity_keys().unwrap();
        let alice_identity_pub = ClassicSuiteProvider::kem_public_key_from_bytes(alice_pub.ka_public.clone());
        let bob_identity_pub = ClassicSuiteProvider::kem_public_key_from_bytes(bob_pub.ka_public.clone());

        let mut alice_session =
            TestPeerSession::init_as_initiator(&alice_priv, &bob_pub, &bob_identity_pub, "bob".to_string())
                .unwrap();

        let first = alice_session.encrypt(b"m1").unwrap();
        let alice_ephemeral_pub =
            ClassicSuiteProvider::kem_public_key_from_bytes(first.dh_public_key.to_vec());
        let (mut bob_session, first_plain) = TestPeerSession::init_as_responder(
            &bob_priv,
            &alice_identity_pub,
            &alice_ephemeral_pub,
            &first,
            "alice".to_string(),
        )
        .unwrap();
        assert_eq!(first_plain, b"m1");

        let m2 = alice_session.encrypt(b"m2").unwrap();
        let m3 = alice_session.encrypt(b"m3").unwrap();
        let m4 = alice_session.encrypt(b"m4").unwrap();

        // Deliver m4, m2, m3: m4 arrives first, buffering skipped keys for 2 and 3.
        assert_eq!(bob_session.decrypt(&m4).unwrap(), b"m4");
        assert_eq!(bob_session.decrypt(&m2).unwrap(), b"m2");
        assert_eq!(bob_session.decrypt(&m3).unwrap(), b"m3");
    }
}
