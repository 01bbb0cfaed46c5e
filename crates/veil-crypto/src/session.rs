//! Pairwise sessions.
//!
//! A session is created either outbound, from a peer's identity key and a
//! claimed one-time key, or inbound, from the first pre-key message the peer
//! sent. Until the first successful decrypt every outgoing message is a
//! pre-key message (type 0) so the peer can run its own inbound handshake;
//! afterwards messages are normal (type 1).

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::account::Account;
use crate::backend::{BackendKind, InboundSession, SessionBackend};
use crate::error::CryptoError;
use crate::pickle::{self, EntityKind, PickleKey};
use crate::selector::Engine;

/// Framing of a pairwise message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Handshake message; the receiver creates an inbound session from it.
    PreKey,
    /// Message on an established session.
    Normal,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::PreKey => 0,
            MessageType::Normal => 1,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, CryptoError> {
        match value {
            0 => Ok(MessageType::PreKey),
            1 => Ok(MessageType::Normal),
            other => Err(CryptoError::Decryption(format!(
                "unknown message type: {other}"
            ))),
        }
    }
}

/// `{type, body}` pair produced by [`Session::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub message_type: MessageType,
    pub body: Vec<u8>,
}

impl EncryptedMessage {
    pub fn is_prekey(&self) -> bool {
        self.message_type == MessageType::PreKey
    }
}

pub struct Session {
    backend: BackendKind,
    inner: Mutex<Box<dyn SessionBackend>>,
}

impl Session {
    fn from_backend(backend: BackendKind, inner: Box<dyn SessionBackend>) -> Self {
        Self {
            backend,
            inner: Mutex::new(inner),
        }
    }

    /// Start a session with a peer before any message has been exchanged.
    pub fn create_outbound(
        account: &Account,
        identity_key: &str,
        one_time_key: &str,
    ) -> Result<Self, CryptoError> {
        let inner = account.with_backend(|backend| {
            backend.create_outbound_session(identity_key, one_time_key)
        })?;
        let session = Self::from_backend(account.backend(), inner);
        debug!(session_id = %session.session_id(), "created outbound session");
        Ok(session)
    }

    /// Derive a session from a received pre-key message.
    ///
    /// Returns the new session and the plaintext of `message`. The one-time
    /// key the message was addressed to is removed from the account's pool,
    /// but only once the message has decrypted.
    pub fn create_inbound(
        account: &Account,
        identity_key: &str,
        message: &EncryptedMessage,
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        if !message.is_prekey() {
            return Err(CryptoError::Decryption(
                "inbound sessions can only be created from pre-key messages".into(),
            ));
        }
        let InboundSession { session, plaintext } = account
            .with_backend(|backend| backend.create_inbound_session(identity_key, message))?;
        let session = Self::from_backend(account.backend(), session);
        debug!(session_id = %session.session_id(), "created inbound session");
        Ok((session, plaintext))
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn SessionBackend>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_id(&self) -> String {
        self.lock().session_id()
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Flips to true on the first successful decrypt and stays there.
    pub fn has_received_message(&self) -> bool {
        self.lock().has_received_message()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        self.lock().encrypt(plaintext)
    }

    /// Decrypt a message from the peer. On failure the session is unchanged
    /// and the caller may try another candidate session.
    pub fn decrypt(&self, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError> {
        let mut inner = self.lock();
        let first = !inner.has_received_message();
        let plaintext = inner.decrypt(message)?;
        if first {
            debug!(session_id = %inner.session_id(), "session established");
        }
        Ok(plaintext)
    }

    /// Whether `message` is a pre-key message belonging to this session.
    pub fn matches_prekey_message(&self, message: &EncryptedMessage) -> bool {
        message.is_prekey() && self.lock().matches_prekey_message(message)
    }

    pub fn pickle(&self, key: &PickleKey) -> Result<Vec<u8>, CryptoError> {
        let payload = self.lock().payload()?;
        pickle::seal(key, self.backend, EntityKind::Session, &payload)
    }

    pub fn unpickle(engine: &Engine, blob: &[u8], key: &PickleKey) -> Result<Self, CryptoError> {
        let payload = pickle::open(key, engine.kind(), EntityKind::Session, blob)?;
        let inner = engine.inner().restore_session(&payload)?;
        Ok(Self::from_backend(engine.kind(), inner))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.backend)
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(engine: &Engine) -> (Account, Account, Session) {
        let alice = Account::new(engine).unwrap();
        let bob = Account::new(engine).unwrap();
        bob.generate_one_time_keys(1).unwrap();
        let otk = bob.one_time_keys().into_values().next().unwrap();
        bob.mark_keys_as_published();
        let outbound =
            Session::create_outbound(&alice, &bob.identity_keys().curve25519, &otk).unwrap();
        (alice, bob, outbound)
    }

    #[test]
    fn message_type_codes() {
        assert_eq!(MessageType::PreKey.as_u8(), 0);
        assert_eq!(MessageType::from_u8(1).unwrap(), MessageType::Normal);
        assert!(MessageType::from_u8(2).is_err());
    }

    #[test]
    fn framing_switches_after_first_decrypt() {
        let engine = Engine::software().unwrap();
        let (alice, bob, outbound) = pair(&engine);

        let first = outbound.encrypt(b"hello").unwrap();
        assert_eq!(first.message_type, MessageType::PreKey);
        let (inbound, plaintext) =
            Session::create_inbound(&bob, &alice.identity_keys().curve25519, &first).unwrap();
        assert_eq!(plaintext, b"hello");
        assert!(inbound.has_received_message());

        let reply = inbound.encrypt(b"hi").unwrap();
        assert_eq!(reply.message_type, MessageType::Normal);
        assert!(!outbound.has_received_message());
        assert_eq!(outbound.decrypt(&reply).unwrap(), b"hi");
        assert!(outbound.has_received_message());
        assert_eq!(
            outbound.encrypt(b"again").unwrap().message_type,
            MessageType::Normal
        );
    }

    #[test]
    fn inbound_requires_prekey_message() {
        let engine = Engine::software().unwrap();
        let (alice, bob, _) = pair(&engine);
        let bogus = EncryptedMessage {
            message_type: MessageType::Normal,
            body: vec![1, 2, 3],
        };
        assert!(matches!(
            Session::create_inbound(&bob, &alice.identity_keys().curve25519, &bogus),
            Err(CryptoError::Decryption(_))
        ));
    }

    #[test]
    fn failed_decrypt_keeps_session_fresh() {
        let engine = Engine::software().unwrap();
        let (alice, bob, outbound) = pair(&engine);
        let first = outbound.encrypt(b"hello").unwrap();
        let (inbound, _) =
            Session::create_inbound(&bob, &alice.identity_keys().curve25519, &first).unwrap();

        let mut reply = inbound.encrypt(b"hi").unwrap();
        let last = reply.body.len() - 1;
        reply.body[last] ^= 0xff;
        assert!(outbound.decrypt(&reply).is_err());
        assert!(!outbound.has_received_message());
    }

    #[test]
    fn pickle_roundtrip_keeps_ratchet() {
        let engine = Engine::software().unwrap();
        let key = PickleKey::generate().unwrap();
        let (alice, bob, outbound) = pair(&engine);
        let first = outbound.encrypt(b"hello").unwrap();
        let (inbound, _) =
            Session::create_inbound(&bob, &alice.identity_keys().curve25519, &first).unwrap();

        let restored = Session::unpickle(&engine, &outbound.pickle(&key).unwrap(), &key).unwrap();
        assert_eq!(restored.session_id(), outbound.session_id());
        let reply = inbound.encrypt(b"hi").unwrap();
        assert_eq!(restored.decrypt(&reply).unwrap(), b"hi");
    }

    #[test]
    fn pickle_with_wrong_key_is_corrupt() {
        let engine = Engine::software().unwrap();
        let (_, _, outbound) = pair(&engine);
        let blob = outbound.pickle(&PickleKey::generate().unwrap()).unwrap();
        assert!(matches!(
            Session::unpickle(&engine, &blob, &PickleKey::generate().unwrap()),
            Err(CryptoError::CorruptState(_))
        ));
    }
}
