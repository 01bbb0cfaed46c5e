//! Olm/Megolm engine backed by vodozemac.
//!
//! Pickles are the vodozemac pickle structs serialized as JSON; the pickle
//! envelope in `crate::pickle` adds versioning and encryption on top.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use vodozemac::megolm::{
    ExportedSessionKey, GroupSession, GroupSessionPickle, InboundGroupSession,
    InboundGroupSessionPickle, MegolmMessage, SessionConfig as MegolmSessionConfig, SessionKey,
};
use vodozemac::olm::{
    Account, AccountPickle, OlmMessage, Session, SessionConfig, SessionPickle,
};
use vodozemac::Curve25519PublicKey;

use super::{
    AccountBackend, BackendKind, CryptoEngine, GroupSessionBackend, InboundGroupSessionBackend,
    InboundSession, SessionBackend,
};
use crate::error::CryptoError;
use crate::group::{ExportedGroupKey, GroupKeyKind};
use crate::identity::IdentityKeys;
use crate::session::{EncryptedMessage, MessageType};

#[derive(Debug, Default)]
pub struct NativeEngine;

impl NativeEngine {
    pub fn new() -> Self {
        Self
    }

    /// Exercise the engine end to end: handshake, reply, and a group
    /// message. Any failure means the engine is unusable on this platform.
    pub fn self_test(&self) -> Result<(), CryptoError> {
        let alice = self.create_account()?;
        let mut bob = self.create_account()?;
        bob.generate_one_time_keys(1)?;
        let one_time_key = bob
            .one_time_keys()
            .into_values()
            .next()
            .ok_or_else(|| CryptoError::Initialization("no one-time key generated".into()))?;

        let mut outbound =
            alice.create_outbound_session(&bob.identity_keys().curve25519, &one_time_key)?;
        let first = outbound.encrypt(b"probe")?;
        let InboundSession {
            session: mut inbound,
            plaintext,
        } = bob.create_inbound_session(&alice.identity_keys().curve25519, &first)?;
        if plaintext != b"probe" {
            return Err(CryptoError::Initialization("olm round trip mismatch".into()));
        }
        let reply = inbound.encrypt(b"ack")?;
        if outbound.decrypt(&reply)? != b"ack" {
            return Err(CryptoError::Initialization("olm reply mismatch".into()));
        }

        let mut group = self.create_group_session()?;
        let key = ExportedGroupKey {
            session_id: group.session_id(),
            message_index: group.message_index(),
            kind: GroupKeyKind::Shared,
            key: group.session_key()?,
        };
        let mut receiver = self.create_inbound_group_session(&key)?;
        let ciphertext = group.encrypt(b"group probe")?;
        let (group_plaintext, _) = receiver.decrypt(&ciphertext)?;
        if group_plaintext != b"group probe" {
            return Err(CryptoError::Initialization("megolm round trip mismatch".into()));
        }

        debug!("native engine self-test passed");
        Ok(())
    }
}

fn corrupt(e: impl std::fmt::Display) -> CryptoError {
    CryptoError::CorruptState(e.to_string())
}

fn curve25519_key(input: &str) -> Result<Curve25519PublicKey, CryptoError> {
    Curve25519PublicKey::from_base64(input).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn to_olm_message(message: &EncryptedMessage) -> Result<OlmMessage, CryptoError> {
    let body = std::str::from_utf8(&message.body)
        .map_err(|e| CryptoError::Decryption(format!("olm message body is not base64: {e}")))?;
    OlmMessage::from_parts(message.message_type.as_u8() as usize, body)
        .map_err(|e| CryptoError::Decryption(format!("malformed olm message: {e}")))
}

fn from_olm_message(message: OlmMessage) -> Result<EncryptedMessage, CryptoError> {
    let (message_type, body) = message.to_parts();
    Ok(EncryptedMessage {
        message_type: MessageType::from_u8(message_type as u8)?,
        body: body.into_bytes(),
    })
}

impl CryptoEngine for NativeEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn create_account(&self) -> Result<Box<dyn AccountBackend>, CryptoError> {
        Ok(Box::new(NativeAccount(Account::new())))
    }

    fn restore_account(&self, payload: &[u8]) -> Result<Box<dyn AccountBackend>, CryptoError> {
        let pickle: AccountPickle = serde_json::from_slice(payload).map_err(corrupt)?;
        Ok(Box::new(NativeAccount(Account::from_pickle(pickle))))
    }

    fn restore_session(&self, payload: &[u8]) -> Result<Box<dyn SessionBackend>, CryptoError> {
        let pickle: SessionPickle = serde_json::from_slice(payload).map_err(corrupt)?;
        Ok(Box::new(NativeSession(Session::from_pickle(pickle))))
    }

    fn create_group_session(&self) -> Result<Box<dyn GroupSessionBackend>, CryptoError> {
        Ok(Box::new(NativeGroupSession(GroupSession::new(
            MegolmSessionConfig::default(),
        ))))
    }

    fn restore_group_session(
        &self,
        payload: &[u8],
    ) -> Result<Box<dyn GroupSessionBackend>, CryptoError> {
        let pickle: GroupSessionPickle = serde_json::from_slice(payload).map_err(corrupt)?;
        Ok(Box::new(NativeGroupSession(GroupSession::from_pickle(pickle))))
    }

    fn create_inbound_group_session(
        &self,
        key: &ExportedGroupKey,
    ) -> Result<Box<dyn InboundGroupSessionBackend>, CryptoError> {
        let session = match key.kind {
            GroupKeyKind::Shared => {
                let session_key = SessionKey::from_base64(&key.key)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                InboundGroupSession::new(&session_key, MegolmSessionConfig::default())
            }
            GroupKeyKind::Exported => {
                let exported = ExportedSessionKey::from_base64(&key.key)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                InboundGroupSession::import(&exported, MegolmSessionConfig::default())
            }
        };
        Ok(Box::new(NativeInboundGroupSession(session)))
    }

    fn restore_inbound_group_session(
        &self,
        payload: &[u8],
    ) -> Result<Box<dyn InboundGroupSessionBackend>, CryptoError> {
        let pickle: InboundGroupSessionPickle =
            serde_json::from_slice(payload).map_err(corrupt)?;
        Ok(Box::new(NativeInboundGroupSession(
            InboundGroupSession::from_pickle(pickle),
        )))
    }
}

struct NativeAccount(Account);

impl AccountBackend for NativeAccount {
    fn identity_keys(&self) -> IdentityKeys {
        let keys = self.0.identity_keys();
        IdentityKeys {
            curve25519: keys.curve25519.to_base64(),
            ed25519: keys.ed25519.to_base64(),
        }
    }

    fn sign(&self, message: &str) -> Result<String, CryptoError> {
        Ok(self.0.sign(message).to_base64())
    }

    fn generate_one_time_keys(&mut self, count: usize) -> Result<(), CryptoError> {
        let result = self.0.generate_one_time_keys(count);
        if !result.removed.is_empty() {
            warn!(
                excess = result.removed.len(),
                "one-time key pool full, discarding oldest keys"
            );
        }
        Ok(())
    }

    fn one_time_keys(&self) -> BTreeMap<String, String> {
        self.0
            .one_time_keys()
            .into_iter()
            .map(|(id, key)| (id.to_base64(), key.to_base64()))
            .collect()
    }

    fn mark_keys_as_published(&mut self) {
        self.0.mark_keys_as_published();
    }

    fn max_one_time_keys(&self) -> usize {
        self.0.max_number_of_one_time_keys()
    }

    fn generate_fallback_key(&mut self) -> Result<(), CryptoError> {
        let _ = self.0.generate_fallback_key();
        Ok(())
    }

    fn fallback_key(&self) -> Option<(String, String)> {
        self.0
            .fallback_key()
            .into_iter()
            .next()
            .map(|(id, key)| (id.to_base64(), key.to_base64()))
    }

    fn create_outbound_session(
        &self,
        identity_key: &str,
        one_time_key: &str,
    ) -> Result<Box<dyn SessionBackend>, CryptoError> {
        let session = self.0.create_outbound_session(
            SessionConfig::default(),
            curve25519_key(identity_key)?,
            curve25519_key(one_time_key)?,
        );
        Ok(Box::new(NativeSession(session)))
    }

    fn create_inbound_session(
        &mut self,
        identity_key: &str,
        message: &EncryptedMessage,
    ) -> Result<InboundSession, CryptoError> {
        let OlmMessage::PreKey(pre_key_message) = to_olm_message(message)? else {
            return Err(CryptoError::Decryption(
                "expected a pre-key message for a new session".into(),
            ));
        };
        let result = self
            .0
            .create_inbound_session(curve25519_key(identity_key)?, &pre_key_message)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;
        Ok(InboundSession {
            session: Box::new(NativeSession(result.session)),
            plaintext: result.plaintext,
        })
    }

    fn payload(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(&self.0.pickle()).map_err(corrupt)
    }
}

struct NativeSession(Session);

impl SessionBackend for NativeSession {
    fn session_id(&self) -> String {
        self.0.session_id()
    }

    fn has_received_message(&self) -> bool {
        self.0.has_received_message()
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        from_olm_message(self.0.encrypt(plaintext))
    }

    fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError> {
        let message = to_olm_message(message)?;
        self.0
            .decrypt(&message)
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }

    fn matches_prekey_message(&self, message: &EncryptedMessage) -> bool {
        match to_olm_message(message) {
            Ok(OlmMessage::PreKey(m)) => m.session_id() == self.0.session_id(),
            _ => false,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(&self.0.pickle()).map_err(corrupt)
    }
}

struct NativeGroupSession(GroupSession);

impl GroupSessionBackend for NativeGroupSession {
    fn session_id(&self) -> String {
        self.0.session_id()
    }

    fn message_index(&self) -> u32 {
        self.0.message_index()
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.0.encrypt(plaintext).to_bytes())
    }

    fn session_key(&self) -> Result<String, CryptoError> {
        Ok(self.0.session_key().to_base64())
    }

    fn payload(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(&self.0.pickle()).map_err(corrupt)
    }
}

struct NativeInboundGroupSession(InboundGroupSession);

impl InboundGroupSessionBackend for NativeInboundGroupSession {
    fn session_id(&self) -> String {
        self.0.session_id()
    }

    fn first_known_index(&self) -> u32 {
        self.0.first_known_index()
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, u32), CryptoError> {
        let message = MegolmMessage::from_bytes(ciphertext)
            .map_err(|e| CryptoError::Decryption(format!("malformed megolm message: {e}")))?;
        let decrypted = self
            .0
            .decrypt(&message)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;
        Ok((decrypted.plaintext, decrypted.message_index))
    }

    fn export_at(&mut self, index: u32) -> Result<Option<String>, CryptoError> {
        Ok(self.0.export_at(index).map(|key| key.to_base64()))
    }

    fn payload(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(&self.0.pickle()).map_err(corrupt)
    }
}
