//! Group sessions (sender keys).
//!
//! The sender keeps an [`OutboundGroupSession`] per group and shares its
//! session key with each member over pairwise sessions. Members hold an
//! [`InboundGroupSession`] that can decrypt from the index the key was
//! exported at onwards, never before it. Rotate the outbound session when
//! membership changes.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::backend::{BackendKind, GroupSessionBackend, InboundGroupSessionBackend};
use crate::error::CryptoError;
use crate::pickle::{self, EntityKind, PickleKey};
use crate::selector::Engine;

/// How an exported key was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKeyKind {
    /// From the outbound session; signed by the sender.
    Shared,
    /// Re-exported from an inbound session at a chosen index.
    Exported,
}

/// Group key material in transit.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ExportedGroupKey {
    pub session_id: String,
    pub message_index: u32,
    #[zeroize(skip)]
    pub kind: GroupKeyKind,
    pub key: String,
}

impl ExportedGroupKey {
    pub fn new(
        session_id: impl Into<String>,
        message_index: u32,
        kind: GroupKeyKind,
        key: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message_index,
            kind,
            key: key.into(),
        }
    }

    /// Opaque transport form (unpadded base64).
    pub fn to_blob(&self) -> Result<String, CryptoError> {
        let bytes = Zeroizing::new(
            postcard::to_allocvec(self)
                .map_err(|e| CryptoError::Encryption(format!("group key encode failed: {e}")))?,
        );
        Ok(STANDARD_NO_PAD.encode(bytes.as_slice()))
    }

    pub fn from_blob(blob: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            STANDARD_NO_PAD
                .decode(blob.trim_end_matches('='))
                .map_err(|e| CryptoError::InvalidKey(format!("invalid group key blob: {e}")))?,
        );
        postcard::from_bytes(&bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("malformed group key blob: {e}")))
    }
}

impl fmt::Debug for ExportedGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedGroupKey")
            .field("session_id", &self.session_id)
            .field("message_index", &self.message_index)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Ciphertext of one group message, tagged with the index it was sent at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCiphertext {
    pub session_id: String,
    pub message_index: u32,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedGroupMessage {
    pub plaintext: Vec<u8>,
    /// For the caller's replay detection.
    pub message_index: u32,
}

pub struct OutboundGroupSession {
    backend: BackendKind,
    inner: Mutex<Box<dyn GroupSessionBackend>>,
}

impl OutboundGroupSession {
    pub fn new(engine: &Engine) -> Result<Self, CryptoError> {
        let inner = engine.inner().create_group_session()?;
        let session = Self {
            backend: engine.kind(),
            inner: Mutex::new(inner),
        };
        debug!(session_id = %session.session_id(), "created outbound group session");
        Ok(session)
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn GroupSessionBackend>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_id(&self) -> String {
        self.lock().session_id()
    }

    /// Index the next message will be encrypted at.
    pub fn message_index(&self) -> u32 {
        self.lock().message_index()
    }

    /// Encrypt at the current index, then advance it by one.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<GroupCiphertext, CryptoError> {
        let mut inner = self.lock();
        let message_index = inner.message_index();
        let ciphertext = inner.encrypt(plaintext)?;
        Ok(GroupCiphertext {
            session_id: inner.session_id(),
            message_index,
            ciphertext,
        })
    }

    /// The session key at the current index, for distribution to members.
    pub fn export_session_key(&self) -> Result<ExportedGroupKey, CryptoError> {
        let inner = self.lock();
        Ok(ExportedGroupKey {
            session_id: inner.session_id(),
            message_index: inner.message_index(),
            kind: GroupKeyKind::Shared,
            key: inner.session_key()?,
        })
    }

    pub fn pickle(&self, key: &PickleKey) -> Result<Vec<u8>, CryptoError> {
        let payload = self.lock().payload()?;
        pickle::seal(key, self.backend, EntityKind::OutboundGroupSession, &payload)
    }

    pub fn unpickle(engine: &Engine, blob: &[u8], key: &PickleKey) -> Result<Self, CryptoError> {
        let payload = pickle::open(key, engine.kind(), EntityKind::OutboundGroupSession, blob)?;
        Ok(Self {
            backend: engine.kind(),
            inner: Mutex::new(engine.inner().restore_group_session(&payload)?),
        })
    }
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("backend", &self.backend)
            .field("session_id", &self.session_id())
            .field("message_index", &self.message_index())
            .finish()
    }
}

pub struct InboundGroupSession {
    backend: BackendKind,
    inner: Mutex<Box<dyn InboundGroupSessionBackend>>,
}

impl InboundGroupSession {
    /// Create a receiving session from a shared or re-exported key.
    pub fn import(engine: &Engine, key: &ExportedGroupKey) -> Result<Self, CryptoError> {
        let inner = engine.inner().create_inbound_group_session(key)?;
        if inner.session_id() != key.session_id {
            return Err(CryptoError::InvalidKey(format!(
                "group key labelled {} belongs to session {}",
                key.session_id,
                inner.session_id()
            )));
        }
        debug!(
            session_id = %key.session_id,
            first_known_index = inner.first_known_index(),
            kind = ?key.kind,
            "imported inbound group session"
        );
        Ok(Self {
            backend: engine.kind(),
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn InboundGroupSessionBackend>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_id(&self) -> String {
        self.lock().session_id()
    }

    /// Lowest index this session can decrypt. Fixed at import.
    pub fn first_known_index(&self) -> u32 {
        self.lock().first_known_index()
    }

    /// Decrypt a group message. Messages below [`Self::first_known_index`]
    /// are refused. Replays are not detected here; use the returned index.
    pub fn decrypt(&self, message: &GroupCiphertext) -> Result<DecryptedGroupMessage, CryptoError> {
        let mut inner = self.lock();
        if message.session_id != inner.session_id() {
            return Err(CryptoError::Decryption(format!(
                "message belongs to group session {}",
                message.session_id
            )));
        }
        if message.message_index < inner.first_known_index() {
            return Err(CryptoError::Decryption(format!(
                "message index {} is below the first known index {}",
                message.message_index,
                inner.first_known_index()
            )));
        }
        let (plaintext, message_index) = inner.decrypt(&message.ciphertext)?;
        if message_index != message.message_index {
            return Err(CryptoError::Decryption(format!(
                "message labelled index {} was encrypted at {message_index}",
                message.message_index
            )));
        }
        Ok(DecryptedGroupMessage {
            plaintext,
            message_index,
        })
    }

    /// Re-export the session anchored at `index`, for sharing history from
    /// that point on. `None` if `index` is below the first known index.
    pub fn export_at(&self, index: u32) -> Result<Option<ExportedGroupKey>, CryptoError> {
        let mut inner = self.lock();
        let Some(key) = inner.export_at(index)? else {
            return Ok(None);
        };
        Ok(Some(ExportedGroupKey {
            session_id: inner.session_id(),
            message_index: index,
            kind: GroupKeyKind::Exported,
            key,
        }))
    }

    pub fn export_at_first_known_index(&self) -> Result<ExportedGroupKey, CryptoError> {
        let index = self.first_known_index();
        self.export_at(index)?.ok_or_else(|| {
            CryptoError::CorruptState(format!("cannot export at first known index {index}"))
        })
    }

    pub fn pickle(&self, key: &PickleKey) -> Result<Vec<u8>, CryptoError> {
        let payload = self.lock().payload()?;
        pickle::seal(key, self.backend, EntityKind::InboundGroupSession, &payload)
    }

    pub fn unpickle(engine: &Engine, blob: &[u8], key: &PickleKey) -> Result<Self, CryptoError> {
        let payload = pickle::open(key, engine.kind(), EntityKind::InboundGroupSession, blob)?;
        Ok(Self {
            backend: engine.kind(),
            inner: Mutex::new(engine.inner().restore_inbound_group_session(&payload)?),
        })
    }
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("backend", &self.backend)
            .field("session_id", &self.session_id())
            .field("first_known_index", &self.first_known_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::software().unwrap()
    }

    #[test]
    fn indices_increase_by_one() {
        let engine = engine();
        let outbound = OutboundGroupSession::new(&engine).unwrap();
        let indices: Vec<u32> = (0..5)
            .map(|_| outbound.encrypt(b"tick").unwrap().message_index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(outbound.message_index(), 5);
    }

    #[test]
    fn late_import_sets_boundary() {
        let engine = engine();
        let outbound = OutboundGroupSession::new(&engine).unwrap();
        let history: Vec<_> = (0..3).map(|_| outbound.encrypt(b"old").unwrap()).collect();

        let key = outbound.export_session_key().unwrap();
        assert_eq!(key.message_index, 3);
        let inbound = InboundGroupSession::import(&engine, &key).unwrap();
        assert_eq!(inbound.first_known_index(), 3);

        for message in &history {
            assert!(matches!(
                inbound.decrypt(message),
                Err(CryptoError::Decryption(_))
            ));
        }
        let current = outbound.encrypt(b"new").unwrap();
        let decrypted = inbound.decrypt(&current).unwrap();
        assert_eq!(decrypted.plaintext, b"new");
        assert_eq!(decrypted.message_index, 3);
        assert_eq!(inbound.first_known_index(), 3);
    }

    #[test]
    fn mislabelled_ciphertext_rejected() {
        let engine = engine();
        let outbound = OutboundGroupSession::new(&engine).unwrap();
        let inbound =
            InboundGroupSession::import(&engine, &outbound.export_session_key().unwrap()).unwrap();

        let mut message = outbound.encrypt(b"one").unwrap();
        message.session_id = "other".into();
        assert!(inbound.decrypt(&message).is_err());

        let mut message = outbound.encrypt(b"two").unwrap();
        message.message_index = 7;
        assert!(inbound.decrypt(&message).is_err());
    }

    #[test]
    fn selective_history_export() {
        let engine = engine();
        let outbound = OutboundGroupSession::new(&engine).unwrap();
        let inbound =
            InboundGroupSession::import(&engine, &outbound.export_session_key().unwrap()).unwrap();
        let messages: Vec<_> = (0..4)
            .map(|i| outbound.encrypt(format!("m{i}").as_bytes()).unwrap())
            .collect();

        let exported = inbound.export_at(2).unwrap().unwrap();
        assert_eq!(exported.kind, GroupKeyKind::Exported);
        let blob = exported.to_blob().unwrap();
        let shared = InboundGroupSession::import(&engine, &ExportedGroupKey::from_blob(&blob).unwrap())
            .unwrap();

        assert_eq!(shared.first_known_index(), 2);
        assert!(shared.decrypt(&messages[1]).is_err());
        assert_eq!(shared.decrypt(&messages[3]).unwrap().plaintext, b"m3");
        assert!(shared.export_at(1).unwrap().is_none());
        assert_eq!(shared.export_at_first_known_index().unwrap().message_index, 2);
    }

    #[test]
    fn wrong_session_label_on_import() {
        let engine = engine();
        let outbound = OutboundGroupSession::new(&engine).unwrap();
        let mut key = outbound.export_session_key().unwrap();
        key.session_id = "someone-else".into();
        assert!(matches!(
            InboundGroupSession::import(&engine, &key),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn pickles_roundtrip() {
        let engine = engine();
        let pickle_key = PickleKey::generate().unwrap();
        let outbound = OutboundGroupSession::new(&engine).unwrap();
        let inbound =
            InboundGroupSession::import(&engine, &outbound.export_session_key().unwrap()).unwrap();
        outbound.encrypt(b"before pickle").unwrap();

        let outbound =
            OutboundGroupSession::unpickle(&engine, &outbound.pickle(&pickle_key).unwrap(), &pickle_key)
                .unwrap();
        let inbound =
            InboundGroupSession::unpickle(&engine, &inbound.pickle(&pickle_key).unwrap(), &pickle_key)
                .unwrap();
        assert_eq!(outbound.message_index(), 1);

        let message = outbound.encrypt(b"after pickle").unwrap();
        assert_eq!(inbound.decrypt(&message).unwrap().message_index, 1);
    }

    #[test]
    fn debug_hides_key_material() {
        let key = ExportedGroupKey::new("sid", 0, GroupKeyKind::Shared, "secret-material");
        assert!(!format!("{key:?}").contains("secret-material"));
    }
}
