//! The engine seam: one trait, two implementations.
//!
//! [`CryptoEngine`] is a factory for backend-specific account, session and
//! group-session handles. The public wrappers in `account`, `session` and
//! `group` own those handles and never learn which engine produced them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::group::ExportedGroupKey;
use crate::identity::IdentityKeys;
use crate::session::EncryptedMessage;

#[cfg(feature = "native")]
pub mod native;
pub mod software;

/// Which engine produced a piece of state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Native,
    Software,
}

impl BackendKind {
    pub fn tag(self) -> u8 {
        match self {
            BackendKind::Native => 0x01,
            BackendKind::Software => 0x02,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(BackendKind::Native),
            0x02 => Some(BackendKind::Software),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => f.write_str("native"),
            BackendKind::Software => f.write_str("software"),
        }
    }
}

pub trait CryptoEngine: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn create_account(&self) -> Result<Box<dyn AccountBackend>, CryptoError>;
    fn restore_account(&self, payload: &[u8]) -> Result<Box<dyn AccountBackend>, CryptoError>;

    fn restore_session(&self, payload: &[u8]) -> Result<Box<dyn SessionBackend>, CryptoError>;

    fn create_group_session(&self) -> Result<Box<dyn GroupSessionBackend>, CryptoError>;
    fn restore_group_session(
        &self,
        payload: &[u8],
    ) -> Result<Box<dyn GroupSessionBackend>, CryptoError>;

    fn create_inbound_group_session(
        &self,
        key: &ExportedGroupKey,
    ) -> Result<Box<dyn InboundGroupSessionBackend>, CryptoError>;
    fn restore_inbound_group_session(
        &self,
        payload: &[u8],
    ) -> Result<Box<dyn InboundGroupSessionBackend>, CryptoError>;
}

/// Result of deriving a session from a received handshake message.
pub struct InboundSession {
    pub session: Box<dyn SessionBackend>,
    pub plaintext: Vec<u8>,
}

pub trait AccountBackend: Send {
    fn identity_keys(&self) -> IdentityKeys;
    fn sign(&self, message: &str) -> Result<String, CryptoError>;

    fn generate_one_time_keys(&mut self, count: usize) -> Result<(), CryptoError>;
    /// Unpublished one-time keys: key id -> Curve25519 public key.
    fn one_time_keys(&self) -> BTreeMap<String, String>;
    fn mark_keys_as_published(&mut self);
    fn max_one_time_keys(&self) -> usize;

    fn generate_fallback_key(&mut self) -> Result<(), CryptoError>;
    /// The fallback key if it has not been published yet.
    fn fallback_key(&self) -> Option<(String, String)>;

    fn create_outbound_session(
        &self,
        identity_key: &str,
        one_time_key: &str,
    ) -> Result<Box<dyn SessionBackend>, CryptoError>;
    /// Must leave the account untouched when the message does not decrypt.
    fn create_inbound_session(
        &mut self,
        identity_key: &str,
        message: &EncryptedMessage,
    ) -> Result<InboundSession, CryptoError>;

    fn payload(&self) -> Result<Vec<u8>, CryptoError>;
}

pub trait SessionBackend: Send {
    fn session_id(&self) -> String;
    fn has_received_message(&self) -> bool;
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError>;
    /// Must leave the session untouched on failure.
    fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError>;
    fn matches_prekey_message(&self, message: &EncryptedMessage) -> bool;
    fn payload(&self) -> Result<Vec<u8>, CryptoError>;
}

pub trait GroupSessionBackend: Send {
    fn session_id(&self) -> String;
    fn message_index(&self) -> u32;
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    /// Signed session key at the current index, backend encoded.
    fn session_key(&self) -> Result<String, CryptoError>;
    fn payload(&self) -> Result<Vec<u8>, CryptoError>;
}

pub trait InboundGroupSessionBackend: Send {
    fn session_id(&self) -> String;
    fn first_known_index(&self) -> u32;
    /// Returns the plaintext and the message index it was encrypted at.
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, u32), CryptoError>;
    /// Unsigned export anchored at `index`, or `None` below the first known index.
    fn export_at(&mut self, index: u32) -> Result<Option<String>, CryptoError>;
    fn payload(&self) -> Result<Vec<u8>, CryptoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_tags_roundtrip() {
        for kind in [BackendKind::Native, BackendKind::Software] {
            assert_eq!(BackendKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(BackendKind::from_tag(0x7f), None);
    }

    #[test]
    fn backend_display() {
        assert_eq!(BackendKind::Native.to_string(), "native");
        assert_eq!(BackendKind::Software.to_string(), "software");
    }
}
