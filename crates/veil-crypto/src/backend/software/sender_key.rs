//! Group sessions for the software engine.
//!
//! The sender owns a symmetric HMAC chain and an Ed25519 signing key. Every
//! message advances the chain by one step and is signed, so receivers can
//! both decrypt and attribute it. The session id is the signing public key.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::primitives::{self, MessageCipher};
use super::{decode_state, encode_state, FORMAT_VERSION};
use crate::backend::{GroupSessionBackend, InboundGroupSessionBackend};
use crate::error::CryptoError;
use crate::group::{ExportedGroupKey, GroupKeyKind};
use crate::identity::{decode_base64, encode_base64};

const GROUP_INFO: &[u8] = b"VEIL_GROUP_KEYS";
/// Largest jump past the highest index seen that a receiver will walk for
/// one message. Indices below that point were already reached and are
/// derived from the first known index without a limit.
#[cfg(not(test))]
const MAX_ADVANCE: u32 = 1 << 20;
#[cfg(test)]
const MAX_ADVANCE: u32 = 64;

/// Chain key anchored at a message index.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct RatchetPoint {
    index: u32,
    chain_key: [u8; 32],
}

impl RatchetPoint {
    /// Step forward to `index`, at most [`MAX_ADVANCE`] steps.
    fn advance_to(&self, index: u32) -> Result<RatchetPoint, CryptoError> {
        if index.saturating_sub(self.index) > MAX_ADVANCE {
            return Err(CryptoError::Decryption(format!(
                "message index {index} too far ahead of {}",
                self.index
            )));
        }
        self.walk_to(index)
    }

    fn walk_to(&self, index: u32) -> Result<RatchetPoint, CryptoError> {
        if index < self.index {
            return Err(CryptoError::Decryption(format!(
                "cannot rewind group ratchet from {} to {index}",
                self.index
            )));
        }
        let mut chain_key = Zeroizing::new(self.chain_key);
        for _ in self.index..index {
            chain_key = primitives::chain_advance(&chain_key)?;
        }
        Ok(RatchetPoint {
            index,
            chain_key: *chain_key,
        })
    }

    fn cipher(&self) -> Result<MessageCipher, CryptoError> {
        let message_key = primitives::chain_message_key(&self.chain_key)?;
        MessageCipher::derive(&message_key, GROUP_INFO)
    }
}

/// Serialized key handed to receivers, base64 on the outside.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct GroupKeyMaterial {
    version: u8,
    index: u32,
    chain_key: [u8; 32],
    signing_public: [u8; 32],
    /// Present on keys shared by the owner, absent on re-exports.
    signature: Option<Vec<u8>>,
}

impl GroupKeyMaterial {
    fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + 4 + 32 + 32);
        bytes.push(self.version);
        bytes.extend_from_slice(&self.index.to_be_bytes());
        bytes.extend_from_slice(&self.chain_key);
        bytes.extend_from_slice(&self.signing_public);
        bytes
    }

    fn encode(&self) -> Result<String, CryptoError> {
        let bytes = Zeroizing::new(encode_state(self)?);
        Ok(encode_base64(&bytes))
    }

    fn decode(key: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(decode_base64(key)?);
        let material: GroupKeyMaterial = postcard::from_bytes(&bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("malformed group key: {e}")))?;
        if material.version != FORMAT_VERSION {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported group key version {}",
                material.version
            )));
        }
        Ok(material)
    }
}

#[derive(Serialize, Deserialize)]
struct GroupWireMessage {
    version: u8,
    index: u32,
    ciphertext: Vec<u8>,
    signature: Vec<u8>,
}

fn signed_message_bytes(version: u8, index: u32, ciphertext: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + 4 + ciphertext.len());
    bytes.push(version);
    bytes.extend_from_slice(&index.to_be_bytes());
    bytes.extend_from_slice(ciphertext);
    bytes
}

fn message_aad(signing_public: &[u8; 32], index: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(32 + 1 + 4);
    aad.extend_from_slice(signing_public);
    aad.push(FORMAT_VERSION);
    aad.extend_from_slice(&index.to_be_bytes());
    aad
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(super) struct SoftwareGroupSession {
    version: u8,
    ratchet: RatchetPoint,
    signing_pkcs8: Vec<u8>,
    signing_public: [u8; 32],
}

impl SoftwareGroupSession {
    pub fn new() -> Result<Self, CryptoError> {
        let (signing_pkcs8, signing_public) = primitives::generate_ed25519()?;
        Ok(Self {
            version: FORMAT_VERSION,
            ratchet: RatchetPoint {
                index: 0,
                chain_key: primitives::random_bytes::<32>()?,
            },
            signing_pkcs8: signing_pkcs8.to_vec(),
            signing_public,
        })
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, CryptoError> {
        let session: SoftwareGroupSession = decode_state(payload)?;
        if session.version != FORMAT_VERSION {
            return Err(CryptoError::CorruptState(format!(
                "unsupported group session version {}",
                session.version
            )));
        }
        if primitives::ed25519_public(&session.signing_pkcs8)? != session.signing_public {
            return Err(CryptoError::CorruptState(
                "group session signing key is inconsistent".into(),
            ));
        }
        Ok(session)
    }
}

impl GroupSessionBackend for SoftwareGroupSession {
    fn session_id(&self) -> String {
        encode_base64(&self.signing_public)
    }

    fn message_index(&self) -> u32 {
        self.ratchet.index
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let index = self.ratchet.index;
        let next_index = index
            .checked_add(1)
            .ok_or_else(|| CryptoError::Encryption("group ratchet exhausted".into()))?;

        let ciphertext = self
            .ratchet
            .cipher()?
            .seal(&message_aad(&self.signing_public, index), plaintext)?;
        let signature = primitives::ed25519_sign(
            &self.signing_pkcs8,
            &signed_message_bytes(FORMAT_VERSION, index, &ciphertext),
        )?;
        let message = postcard::to_allocvec(&GroupWireMessage {
            version: FORMAT_VERSION,
            index,
            ciphertext,
            signature,
        })
        .map_err(|e| CryptoError::Encryption(format!("group message encode failed: {e}")))?;

        let chain_key = primitives::chain_advance(&self.ratchet.chain_key)?;
        self.ratchet = RatchetPoint {
            index: next_index,
            chain_key: *chain_key,
        };
        Ok(message)
    }

    fn session_key(&self) -> Result<String, CryptoError> {
        let mut material = GroupKeyMaterial {
            version: FORMAT_VERSION,
            index: self.ratchet.index,
            chain_key: self.ratchet.chain_key,
            signing_public: self.signing_public,
            signature: None,
        };
        material.signature = Some(primitives::ed25519_sign(
            &self.signing_pkcs8,
            &material.signed_bytes(),
        )?);
        material.encode()
    }

    fn payload(&self) -> Result<Vec<u8>, CryptoError> {
        encode_state(self)
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(super) struct SoftwareInboundGroupSession {
    version: u8,
    signing_public: [u8; 32],
    initial: RatchetPoint,
    /// Highest point reached so far; decryption starts here when it can.
    latest: RatchetPoint,
}

impl SoftwareInboundGroupSession {
    pub fn from_key(key: &ExportedGroupKey) -> Result<Self, CryptoError> {
        let material = GroupKeyMaterial::decode(&key.key)?;
        match key.kind {
            GroupKeyKind::Shared => {
                let signature = material
                    .signature
                    .as_deref()
                    .ok_or_else(|| CryptoError::InvalidKey("shared group key is unsigned".into()))?;
                if !primitives::ed25519_verify(
                    &material.signing_public,
                    &material.signed_bytes(),
                    signature,
                ) {
                    return Err(CryptoError::InvalidKey(
                        "group key signature verification failed".into(),
                    ));
                }
            }
            GroupKeyKind::Exported => {}
        }
        if material.index != key.message_index {
            return Err(CryptoError::InvalidKey(format!(
                "group key is anchored at {} but labelled {}",
                material.index, key.message_index
            )));
        }

        let point = RatchetPoint {
            index: material.index,
            chain_key: material.chain_key,
        };
        Ok(Self {
            version: FORMAT_VERSION,
            signing_public: material.signing_public,
            initial: point.clone(),
            latest: point,
        })
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, CryptoError> {
        let session: SoftwareInboundGroupSession = decode_state(payload)?;
        if session.version != FORMAT_VERSION || session.latest.index < session.initial.index {
            return Err(CryptoError::CorruptState(
                "inbound group session state is inconsistent".into(),
            ));
        }
        Ok(session)
    }

    fn point_at(&self, index: u32) -> Result<RatchetPoint, CryptoError> {
        if index >= self.latest.index {
            self.latest.advance_to(index)
        } else {
            self.initial.walk_to(index)
        }
    }
}

impl InboundGroupSessionBackend for SoftwareInboundGroupSession {
    fn session_id(&self) -> String {
        encode_base64(&self.signing_public)
    }

    fn first_known_index(&self) -> u32 {
        self.initial.index
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, u32), CryptoError> {
        let message: GroupWireMessage = postcard::from_bytes(ciphertext)
            .map_err(|e| CryptoError::Decryption(format!("malformed group message: {e}")))?;
        if message.version != FORMAT_VERSION {
            return Err(CryptoError::Decryption(format!(
                "unsupported group message version {}",
                message.version
            )));
        }
        if !primitives::ed25519_verify(
            &self.signing_public,
            &signed_message_bytes(message.version, message.index, &message.ciphertext),
            &message.signature,
        ) {
            return Err(CryptoError::Decryption(
                "group message signature verification failed".into(),
            ));
        }
        if message.index < self.initial.index {
            return Err(CryptoError::Decryption(format!(
                "message index {} is below the first known index {}",
                message.index, self.initial.index
            )));
        }

        let point = self.point_at(message.index)?;
        let plaintext = point.cipher()?.open(
            &message_aad(&self.signing_public, message.index),
            &message.ciphertext,
        )?;
        if point.index > self.latest.index {
            self.latest = point;
        }
        Ok((plaintext, message.index))
    }

    fn export_at(&mut self, index: u32) -> Result<Option<String>, CryptoError> {
        if index < self.initial.index {
            return Ok(None);
        }
        let point = self.point_at(index)?;
        let material = GroupKeyMaterial {
            version: FORMAT_VERSION,
            index: point.index,
            chain_key: point.chain_key,
            signing_public: self.signing_public,
            signature: None,
        };
        material.encode().map(Some)
    }

    fn payload(&self) -> Result<Vec<u8>, CryptoError> {
        encode_state(self)
    }
}
