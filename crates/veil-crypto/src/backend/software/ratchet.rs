//! Pairwise double ratchet for the software engine.
//!
//! The handshake is a triple Diffie-Hellman over the initiator's identity and
//! base keys and the responder's identity and one-time keys. After that every
//! change of direction performs a DH ratchet step; within a direction each
//! message advances a symmetric HMAC chain.
//!
//! Decryption works on a clone and only replaces the live state once the
//! AEAD tag has verified, so a forged or corrupted message never moves the
//! ratchet.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::primitives::{self, MessageCipher, X25519KeyPair};
use super::{decode_state, encode_state, FORMAT_VERSION};
use crate::backend::SessionBackend;
use crate::error::CryptoError;
use crate::identity::encode_base64;
use crate::session::{EncryptedMessage, MessageType};

/// Largest gap a single message may open in a receiving chain.
const MAX_SKIP: u32 = 2000;
/// Skipped message keys kept for late, out-of-order messages.
const MAX_SKIPPED_KEYS: usize = 40;
const MAX_RECEIVER_CHAINS: usize = 5;

const ROOT_INFO: &[u8] = b"VEIL_ROOT";
const RATCHET_INFO: &[u8] = b"VEIL_RATCHET";
const MESSAGE_INFO: &[u8] = b"VEIL_MESSAGE_KEYS";

/// Body of a normal (type 1) message.
#[derive(Serialize, Deserialize)]
struct RatchetMessage {
    version: u8,
    ratchet_key: [u8; 32],
    chain_index: u32,
    ciphertext: Vec<u8>,
}

/// Body of a pre-key (type 0) message: the handshake keys plus an embedded
/// ratchet message.
#[derive(Serialize, Deserialize)]
pub(super) struct PreKeyMessage {
    version: u8,
    pub one_time_key: [u8; 32],
    pub base_key: [u8; 32],
    pub identity_key: [u8; 32],
    message: Vec<u8>,
}

impl PreKeyMessage {
    pub fn parse(message: &EncryptedMessage) -> Result<Self, CryptoError> {
        if message.message_type != MessageType::PreKey {
            return Err(CryptoError::Decryption("expected a pre-key message".into()));
        }
        let prekey: PreKeyMessage = decode_wire(&message.body)?;
        check_version(prekey.version)?;
        Ok(prekey)
    }

    fn session_id(&self) -> [u8; 32] {
        session_id(&self.identity_key, &self.base_key, &self.one_time_key)
    }
}

impl RatchetMessage {
    fn parse(body: &[u8]) -> Result<Self, CryptoError> {
        let message: RatchetMessage = decode_wire(body)?;
        check_version(message.version)?;
        Ok(message)
    }
}

fn decode_wire<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, CryptoError> {
    postcard::from_bytes(body).map_err(|e| CryptoError::Decryption(format!("malformed message: {e}")))
}

fn encode_wire<T: Serialize>(message: &T) -> Result<Vec<u8>, CryptoError> {
    postcard::to_allocvec(message)
        .map_err(|e| CryptoError::Encryption(format!("message encode failed: {e}")))
}

fn check_version(version: u8) -> Result<(), CryptoError> {
    if version != FORMAT_VERSION {
        return Err(CryptoError::Decryption(format!(
            "unsupported message version {version}"
        )));
    }
    Ok(())
}

fn session_id(identity_key: &[u8; 32], base_key: &[u8; 32], one_time_key: &[u8; 32]) -> [u8; 32] {
    primitives::sha256(&[&identity_key[..], &base_key[..], &one_time_key[..]])
}

fn split_keys(material: &[u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&material[..32]);
    chain.copy_from_slice(&material[32..]);
    (root, chain)
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SenderChain {
    ratchet: X25519KeyPair,
    chain_key: [u8; 32],
    index: u32,
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ReceiverChain {
    ratchet_key: [u8; 32],
    chain_key: [u8; 32],
    index: u32,
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SkippedKey {
    ratchet_key: [u8; 32],
    index: u32,
    message_key: [u8; 32],
}

/// Handshake keys repeated in every message until the peer replies.
#[derive(Clone, Serialize, Deserialize, Zeroize)]
struct Handshake {
    identity_key: [u8; 32],
    base_key: [u8; 32],
    one_time_key: [u8; 32],
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(super) struct SoftwareSession {
    version: u8,
    session_id: [u8; 32],
    root_key: [u8; 32],
    sender: Option<SenderChain>,
    receivers: Vec<ReceiverChain>,
    skipped: Vec<SkippedKey>,
    handshake: Option<Handshake>,
    has_received_message: bool,
}

impl SoftwareSession {
    /// Initiator side of the handshake.
    pub fn outbound(
        identity: &X25519KeyPair,
        their_identity_key: &[u8; 32],
        their_one_time_key: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let base = X25519KeyPair::generate();

        let mut ikm = Zeroizing::new(Vec::with_capacity(96));
        ikm.extend_from_slice(&*primitives::x25519(&identity.secret, their_one_time_key)?);
        ikm.extend_from_slice(&*primitives::x25519(&base.secret, their_identity_key)?);
        ikm.extend_from_slice(&*primitives::x25519(&base.secret, their_one_time_key)?);
        let material = primitives::hkdf::<64>(None, &ikm, ROOT_INFO)?;
        let (root_key, chain_key) = split_keys(&material);

        Ok(Self {
            version: FORMAT_VERSION,
            session_id: session_id(&identity.public, &base.public, their_one_time_key),
            root_key,
            sender: Some(SenderChain {
                ratchet: X25519KeyPair::generate(),
                chain_key,
                index: 0,
            }),
            receivers: Vec::new(),
            skipped: Vec::new(),
            handshake: Some(Handshake {
                identity_key: identity.public,
                base_key: base.public,
                one_time_key: *their_one_time_key,
            }),
            has_received_message: false,
        })
    }

    /// Responder side: derive the session from a pre-key message and decrypt
    /// the message it carries. Nothing is kept if decryption fails.
    pub fn inbound(
        identity: &X25519KeyPair,
        one_time_secret: &[u8; 32],
        prekey: &PreKeyMessage,
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let message = RatchetMessage::parse(&prekey.message)?;

        let mut ikm = Zeroizing::new(Vec::with_capacity(96));
        ikm.extend_from_slice(&*primitives::x25519(one_time_secret, &prekey.identity_key)?);
        ikm.extend_from_slice(&*primitives::x25519(&identity.secret, &prekey.base_key)?);
        ikm.extend_from_slice(&*primitives::x25519(one_time_secret, &prekey.base_key)?);
        let material = primitives::hkdf::<64>(None, &ikm, ROOT_INFO)?;
        let (root_key, chain_key) = split_keys(&material);

        let mut session = Self {
            version: FORMAT_VERSION,
            session_id: prekey.session_id(),
            root_key,
            sender: None,
            receivers: vec![ReceiverChain {
                ratchet_key: message.ratchet_key,
                chain_key,
                index: 0,
            }],
            skipped: Vec::new(),
            handshake: None,
            has_received_message: false,
        };
        let plaintext = session.decrypt_message(&message)?;
        Ok((session, plaintext))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, CryptoError> {
        let session: SoftwareSession = decode_state(payload)?;
        if session.version != FORMAT_VERSION {
            return Err(CryptoError::CorruptState(format!(
                "unsupported session version {}",
                session.version
            )));
        }
        Ok(session)
    }

    fn aad(&self, ratchet_key: &[u8; 32], index: u32) -> Vec<u8> {
        let mut aad = Vec::with_capacity(32 + 1 + 32 + 4);
        aad.extend_from_slice(&self.session_id);
        aad.push(FORMAT_VERSION);
        aad.extend_from_slice(ratchet_key);
        aad.extend_from_slice(&index.to_be_bytes());
        aad
    }

    fn encrypt_message(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        let mut sender = match self.sender.take() {
            Some(sender) => sender,
            None => self.ratchet_sending()?,
        };
        let index = sender.index;
        let message_key = primitives::chain_message_key(&sender.chain_key)?;
        sender.chain_key = *primitives::chain_advance(&sender.chain_key)?;
        sender.index = index
            .checked_add(1)
            .ok_or_else(|| CryptoError::Encryption("sending chain exhausted".into()))?;
        let ratchet_key = sender.ratchet.public;
        self.sender = Some(sender);

        let cipher = MessageCipher::derive(&message_key, MESSAGE_INFO)?;
        let ciphertext = cipher.seal(&self.aad(&ratchet_key, index), plaintext)?;
        let body = encode_wire(&RatchetMessage {
            version: FORMAT_VERSION,
            ratchet_key,
            chain_index: index,
            ciphertext,
        })?;

        match &self.handshake {
            Some(handshake) if !self.has_received_message => {
                let prekey = PreKeyMessage {
                    version: FORMAT_VERSION,
                    one_time_key: handshake.one_time_key,
                    base_key: handshake.base_key,
                    identity_key: handshake.identity_key,
                    message: body,
                };
                Ok(EncryptedMessage {
                    message_type: MessageType::PreKey,
                    body: encode_wire(&prekey)?,
                })
            }
            _ => Ok(EncryptedMessage {
                message_type: MessageType::Normal,
                body,
            }),
        }
    }

    /// New sending chain against the peer's latest ratchet key.
    fn ratchet_sending(&mut self) -> Result<SenderChain, CryptoError> {
        let their_key = self
            .receivers
            .last()
            .map(|chain| chain.ratchet_key)
            .ok_or_else(|| CryptoError::Encryption("no receiving chain to ratchet against".into()))?;
        let ratchet = X25519KeyPair::generate();
        let shared = primitives::x25519(&ratchet.secret, &their_key)?;
        let material = primitives::hkdf::<64>(Some(&self.root_key), &shared[..], RATCHET_INFO)?;
        let (root_key, chain_key) = split_keys(&material);
        self.root_key = root_key;
        Ok(SenderChain {
            ratchet,
            chain_key,
            index: 0,
        })
    }

    /// New receiving chain for a ratchet key the peer just introduced.
    fn ratchet_receiving(&mut self, ratchet_key: &[u8; 32]) -> Result<usize, CryptoError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| CryptoError::Decryption("unexpected ratchet key".into()))?;
        let shared = primitives::x25519(&sender.ratchet.secret, ratchet_key)?;
        let material = primitives::hkdf::<64>(Some(&self.root_key), &shared[..], RATCHET_INFO)?;
        let (root_key, chain_key) = split_keys(&material);

        self.root_key = root_key;
        self.sender = None;
        self.receivers.push(ReceiverChain {
            ratchet_key: *ratchet_key,
            chain_key,
            index: 0,
        });
        if self.receivers.len() > MAX_RECEIVER_CHAINS {
            self.receivers.remove(0);
        }
        Ok(self.receivers.len() - 1)
    }

    fn message_key_for(
        &mut self,
        ratchet_key: &[u8; 32],
        index: u32,
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        if let Some(position) = self
            .skipped
            .iter()
            .position(|key| &key.ratchet_key == ratchet_key && key.index == index)
        {
            let key = Zeroizing::new(self.skipped[position].message_key);
            self.skipped.remove(position);
            return Ok(key);
        }

        let position = match self
            .receivers
            .iter()
            .position(|chain| &chain.ratchet_key == ratchet_key)
        {
            Some(position) => position,
            None => self.ratchet_receiving(ratchet_key)?,
        };

        let chain = &mut self.receivers[position];
        if index < chain.index {
            return Err(CryptoError::Decryption(format!(
                "message key {index} already used"
            )));
        }
        if index - chain.index > MAX_SKIP {
            return Err(CryptoError::Decryption(format!(
                "message index {index} too far ahead of chain"
            )));
        }
        while chain.index < index {
            let key = primitives::chain_message_key(&chain.chain_key)?;
            self.skipped.push(SkippedKey {
                ratchet_key: *ratchet_key,
                index: chain.index,
                message_key: *key,
            });
            chain.chain_key = *primitives::chain_advance(&chain.chain_key)?;
            chain.index += 1;
        }
        let key = primitives::chain_message_key(&chain.chain_key)?;
        chain.chain_key = *primitives::chain_advance(&chain.chain_key)?;
        chain.index = index
            .checked_add(1)
            .ok_or_else(|| CryptoError::Decryption("receiving chain exhausted".into()))?;

        if self.skipped.len() > MAX_SKIPPED_KEYS {
            let excess = self.skipped.len() - MAX_SKIPPED_KEYS;
            self.skipped.drain(..excess);
        }
        Ok(key)
    }

    fn decrypt_message(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let message_key = self.message_key_for(&message.ratchet_key, message.chain_index)?;
        let cipher = MessageCipher::derive(&message_key, MESSAGE_INFO)?;
        let plaintext = cipher.open(
            &self.aad(&message.ratchet_key, message.chain_index),
            &message.ciphertext,
        )?;
        self.has_received_message = true;
        Ok(plaintext)
    }
}

impl SessionBackend for SoftwareSession {
    fn session_id(&self) -> String {
        encode_base64(&self.session_id)
    }

    fn has_received_message(&self) -> bool {
        self.has_received_message
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        let mut next = self.clone();
        let message = next.encrypt_message(plaintext)?;
        *self = next;
        Ok(message)
    }

    fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError> {
        let inner = match message.message_type {
            MessageType::PreKey => {
                let prekey = PreKeyMessage::parse(message)?;
                if prekey.session_id() != self.session_id {
                    return Err(CryptoError::Decryption(
                        "pre-key message belongs to another session".into(),
                    ));
                }
                RatchetMessage::parse(&prekey.message)?
            }
            MessageType::Normal => RatchetMessage::parse(&message.body)?,
        };
        let mut next = self.clone();
        let plaintext = next.decrypt_message(&inner)?;
        *self = next;
        Ok(plaintext)
    }

    fn matches_prekey_message(&self, message: &EncryptedMessage) -> bool {
        PreKeyMessage::parse(message)
            .map(|prekey| prekey.session_id() == self.session_id)
            .unwrap_or(false)
    }

    fn payload(&self) -> Result<Vec<u8>, CryptoError> {
        encode_state(self)
    }
}
