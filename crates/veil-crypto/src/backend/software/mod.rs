//! Pure-Rust fallback engine.
//!
//! Used when the native engine cannot be loaded. It follows the same
//! protocol shape (triple-DH handshake, double ratchet, per-message group
//! ratchet) but its wire and pickle formats are its own: peers of one
//! conversation must run the same engine.

mod account;
pub(crate) mod primitives;
mod ratchet;
mod sender_key;

use tracing::debug;

use super::{
    AccountBackend, BackendKind, CryptoEngine, GroupSessionBackend, InboundGroupSessionBackend,
    SessionBackend,
};
use crate::error::CryptoError;
use crate::group::ExportedGroupKey;

use account::SoftwareAccount;
use ratchet::SoftwareSession;
use sender_key::{SoftwareGroupSession, SoftwareInboundGroupSession};

/// Wire/pickle format version of the software engine.
pub(crate) const FORMAT_VERSION: u8 = 0x01;

#[derive(Debug, Default)]
pub struct SoftwareEngine;

impl SoftwareEngine {
    pub fn new() -> Self {
        Self
    }

    /// The fallback's one prerequisite: working authenticated encryption.
    pub fn probe() -> Result<(), CryptoError> {
        primitives::aead_self_test()?;
        debug!("software engine AEAD probe passed");
        Ok(())
    }
}

pub(crate) fn decode_state<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, CryptoError> {
    postcard::from_bytes(payload)
        .map_err(|e| CryptoError::CorruptState(format!("software state decode failed: {e}")))
}

pub(crate) fn encode_state<T: serde::Serialize>(state: &T) -> Result<Vec<u8>, CryptoError> {
    postcard::to_allocvec(state)
        .map_err(|e| CryptoError::CorruptState(format!("software state encode failed: {e}")))
}

impl CryptoEngine for SoftwareEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Software
    }

    fn create_account(&self) -> Result<Box<dyn AccountBackend>, CryptoError> {
        Ok(Box::new(SoftwareAccount::new()?))
    }

    fn restore_account(&self, payload: &[u8]) -> Result<Box<dyn AccountBackend>, CryptoError> {
        Ok(Box::new(SoftwareAccount::from_payload(payload)?))
    }

    fn restore_session(&self, payload: &[u8]) -> Result<Box<dyn SessionBackend>, CryptoError> {
        Ok(Box::new(SoftwareSession::from_payload(payload)?))
    }

    fn create_group_session(&self) -> Result<Box<dyn GroupSessionBackend>, CryptoError> {
        Ok(Box::new(SoftwareGroupSession::new()?))
    }

    fn restore_group_session(
        &self,
        payload: &[u8],
    ) -> Result<Box<dyn GroupSessionBackend>, CryptoError> {
        Ok(Box::new(SoftwareGroupSession::from_payload(payload)?))
    }

    fn create_inbound_group_session(
        &self,
        key: &ExportedGroupKey,
    ) -> Result<Box<dyn InboundGroupSessionBackend>, CryptoError> {
        Ok(Box::new(SoftwareInboundGroupSession::from_key(key)?))
    }

    fn restore_inbound_group_session(
        &self,
        payload: &[u8],
    ) -> Result<Box<dyn InboundGroupSessionBackend>, CryptoError> {
        Ok(Box::new(SoftwareInboundGroupSession::from_payload(payload)?))
    }
}
