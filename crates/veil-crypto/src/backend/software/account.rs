//! Software engine account: identity keys, one-time key pool, fallback key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::primitives::{self, X25519KeyPair};
use super::ratchet::{PreKeyMessage, SoftwareSession};
use super::{decode_state, encode_state, FORMAT_VERSION};
use crate::backend::{AccountBackend, InboundSession, SessionBackend};
use crate::error::CryptoError;
use crate::identity::{decode_key32, encode_base64, IdentityKeys};
use crate::session::EncryptedMessage;

/// Upper bound on locally held one-time keys. The oldest are discarded past it.
const MAX_ONE_TIME_KEYS: usize = 100;

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredKey {
    id: u64,
    pair: X25519KeyPair,
    published: bool,
}

impl StoredKey {
    fn key_id(&self) -> String {
        encode_base64(&self.id.to_be_bytes())
    }

    fn public_key(&self) -> String {
        encode_base64(&self.pair.public)
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(super) struct SoftwareAccount {
    version: u8,
    identity: X25519KeyPair,
    signing_pkcs8: Vec<u8>,
    signing_public: [u8; 32],
    one_time_keys: Vec<StoredKey>,
    next_key_id: u64,
    fallback_key: Option<StoredKey>,
    /// Kept after rotation so handshakes already in flight still resolve.
    previous_fallback_key: Option<StoredKey>,
}

enum KeySource {
    OneTime(usize),
    Fallback,
}

impl SoftwareAccount {
    pub fn new() -> Result<Self, CryptoError> {
        let (signing_pkcs8, signing_public) = primitives::generate_ed25519()?;
        Ok(Self {
            version: FORMAT_VERSION,
            identity: X25519KeyPair::generate(),
            signing_pkcs8: signing_pkcs8.to_vec(),
            signing_public,
            one_time_keys: Vec::new(),
            next_key_id: 0,
            fallback_key: None,
            previous_fallback_key: None,
        })
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, CryptoError> {
        let account: SoftwareAccount = decode_state(payload)?;
        if account.version != FORMAT_VERSION {
            return Err(CryptoError::CorruptState(format!(
                "unsupported account version {}",
                account.version
            )));
        }
        if primitives::ed25519_public(&account.signing_pkcs8)? != account.signing_public
            || primitives::x25519_public(&account.identity.secret) != account.identity.public
        {
            return Err(CryptoError::CorruptState(
                "account key pairs are inconsistent".into(),
            ));
        }
        Ok(account)
    }

    fn next_key(&mut self) -> StoredKey {
        let key = StoredKey {
            id: self.next_key_id,
            pair: X25519KeyPair::generate(),
            published: false,
        };
        self.next_key_id += 1;
        key
    }

    /// Secret for the one-time or fallback key a handshake was addressed to.
    fn find_key(&self, public: &[u8; 32]) -> Option<(KeySource, Zeroizing<[u8; 32]>)> {
        if let Some(position) = self
            .one_time_keys
            .iter()
            .position(|key| &key.pair.public == public)
        {
            let secret = Zeroizing::new(self.one_time_keys[position].pair.secret);
            return Some((KeySource::OneTime(position), secret));
        }
        [&self.fallback_key, &self.previous_fallback_key]
            .into_iter()
            .flatten()
            .find(|key| &key.pair.public == public)
            .map(|key| (KeySource::Fallback, Zeroizing::new(key.pair.secret)))
    }
}

impl AccountBackend for SoftwareAccount {
    fn identity_keys(&self) -> IdentityKeys {
        IdentityKeys {
            curve25519: encode_base64(&self.identity.public),
            ed25519: encode_base64(&self.signing_public),
        }
    }

    fn sign(&self, message: &str) -> Result<String, CryptoError> {
        let signature = primitives::ed25519_sign(&self.signing_pkcs8, message.as_bytes())?;
        Ok(encode_base64(&signature))
    }

    fn generate_one_time_keys(&mut self, count: usize) -> Result<(), CryptoError> {
        for _ in 0..count {
            let key = self.next_key();
            self.one_time_keys.push(key);
        }
        if self.one_time_keys.len() > MAX_ONE_TIME_KEYS {
            let excess = self.one_time_keys.len() - MAX_ONE_TIME_KEYS;
            warn!(excess, "one-time key pool full, discarding oldest keys");
            self.one_time_keys.drain(..excess);
        }
        Ok(())
    }

    fn one_time_keys(&self) -> BTreeMap<String, String> {
        self.one_time_keys
            .iter()
            .filter(|key| !key.published)
            .map(|key| (key.key_id(), key.public_key()))
            .collect()
    }

    fn mark_keys_as_published(&mut self) {
        for key in &mut self.one_time_keys {
            key.published = true;
        }
        if let Some(key) = self.fallback_key.as_mut() {
            key.published = true;
        }
    }

    fn max_one_time_keys(&self) -> usize {
        MAX_ONE_TIME_KEYS
    }

    fn generate_fallback_key(&mut self) -> Result<(), CryptoError> {
        let key = self.next_key();
        self.previous_fallback_key = self.fallback_key.take();
        self.fallback_key = Some(key);
        Ok(())
    }

    fn fallback_key(&self) -> Option<(String, String)> {
        self.fallback_key
            .as_ref()
            .filter(|key| !key.published)
            .map(|key| (key.key_id(), key.public_key()))
    }

    fn create_outbound_session(
        &self,
        identity_key: &str,
        one_time_key: &str,
    ) -> Result<Box<dyn SessionBackend>, CryptoError> {
        let their_identity = decode_key32(identity_key)?;
        let their_one_time = decode_key32(one_time_key)?;
        let session = SoftwareSession::outbound(&self.identity, &their_identity, &their_one_time)?;
        Ok(Box::new(session))
    }

    fn create_inbound_session(
        &mut self,
        identity_key: &str,
        message: &EncryptedMessage,
    ) -> Result<InboundSession, CryptoError> {
        let prekey = PreKeyMessage::parse(message)?;
        if decode_key32(identity_key)? != prekey.identity_key {
            return Err(CryptoError::Decryption(
                "pre-key message was not sent by the given identity key".into(),
            ));
        }
        let (source, secret) = self
            .find_key(&prekey.one_time_key)
            .ok_or_else(|| CryptoError::Decryption("unknown one-time key".into()))?;

        let (session, plaintext) = SoftwareSession::inbound(&self.identity, &secret, &prekey)?;

        // One-time keys are single use; fallback keys stay until rotated.
        if let KeySource::OneTime(position) = source {
            self.one_time_keys.remove(position);
        }
        Ok(InboundSession {
            session: Box::new(session),
            plaintext,
        })
    }

    fn payload(&self) -> Result<Vec<u8>, CryptoError> {
        encode_state(self)
    }
}
