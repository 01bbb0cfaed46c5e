//! Encrypted, versioned pickles of accounts and sessions.
//!
//! Envelope: [VPKL magic(4)] [version(1)] [backend(1)] [entity kind(1)]
//! [nonce(12)] [length(4)] [encrypted payload + tag(16)]
//!
//! The header is authenticated as AAD. The payload is whatever the backend
//! produced for the entity; it is only readable by the backend that wrote it.

use std::fmt;
use std::num::NonZeroU32;

use ring::pbkdf2;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::backend::software::primitives::{self, NONCE_LEN};
use crate::backend::BackendKind;
use crate::error::CryptoError;

const MAGIC: &[u8; 4] = b"VPKL"; // "Veil PicKLe"
const VERSION: u8 = 0x01;
const HEADER_LEN: usize = 4 + 1 + 1 + 1 + NONCE_LEN + 4; // 23 bytes
const AAD_LEN: usize = 4 + 1 + 1 + 1;

/// 256-bit secret pickles are sealed under.
pub struct PickleKey(Zeroizing<[u8; 32]>);

impl PickleKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("pickle key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self::from_bytes(primitives::random_bytes::<32>()?))
    }

    /// Derive a key from a passphrase with PBKDF2-HMAC-SHA256.
    pub fn derive(passphrase: &str, salt: &[u8], iterations: u32) -> Result<Self, CryptoError> {
        let iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| CryptoError::Config("PBKDF2 iterations must be non-zero".into()))?;
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            passphrase.as_bytes(),
            &mut key[..],
        );
        Ok(Self(key))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PickleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PickleKey(..)")
    }
}

/// What a pickle contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityKind {
    Account,
    Session,
    OutboundGroupSession,
    InboundGroupSession,
}

impl EntityKind {
    pub fn tag(self) -> u8 {
        match self {
            EntityKind::Account => 0x01,
            EntityKind::Session => 0x02,
            EntityKind::OutboundGroupSession => 0x03,
            EntityKind::InboundGroupSession => 0x04,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(EntityKind::Account),
            0x02 => Some(EntityKind::Session),
            0x03 => Some(EntityKind::OutboundGroupSession),
            0x04 => Some(EntityKind::InboundGroupSession),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Account => "account",
            EntityKind::Session => "session",
            EntityKind::OutboundGroupSession => "outbound group session",
            EntityKind::InboundGroupSession => "inbound group session",
        };
        f.write_str(name)
    }
}

/// Cleartext part of a pickle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PickleHeader {
    pub version: u8,
    pub backend: BackendKind,
    pub kind: EntityKind,
    pub payload_len: u32,
}

fn aad(backend: BackendKind, kind: EntityKind) -> [u8; AAD_LEN] {
    let mut aad = [0u8; AAD_LEN];
    aad[..4].copy_from_slice(MAGIC);
    aad[4] = VERSION;
    aad[5] = backend.tag();
    aad[6] = kind.tag();
    aad
}

/// Encrypt a backend payload into a pickle.
pub fn seal(
    key: &PickleKey,
    backend: BackendKind,
    kind: EntityKind,
    payload: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = primitives::random_bytes::<NONCE_LEN>()?;
    let ciphertext = primitives::seal(key.as_bytes(), nonce, &aad(backend, kind), payload)?;
    let payload_len = u32::try_from(ciphertext.len())
        .map_err(|_| CryptoError::Encryption("pickle payload too large".into()))?;

    let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    blob.extend_from_slice(&aad(backend, kind));
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&payload_len.to_be_bytes());
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Parse the cleartext header without decrypting.
pub fn read_header(blob: &[u8]) -> Result<PickleHeader, CryptoError> {
    if blob.len() < HEADER_LEN {
        return Err(CryptoError::CorruptState("pickle too short".into()));
    }
    if &blob[0..4] != MAGIC {
        return Err(CryptoError::CorruptState(
            "invalid pickle format (expected VPKL header)".into(),
        ));
    }
    if blob[4] != VERSION {
        return Err(CryptoError::CorruptState(format!(
            "unsupported pickle version {}",
            blob[4]
        )));
    }
    let backend = BackendKind::from_tag(blob[5])
        .ok_or_else(|| CryptoError::CorruptState(format!("unknown backend tag {}", blob[5])))?;
    let kind = EntityKind::from_tag(blob[6])
        .ok_or_else(|| CryptoError::CorruptState(format!("unknown entity tag {}", blob[6])))?;

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&blob[19..23]);
    Ok(PickleHeader {
        version: blob[4],
        backend,
        kind,
        payload_len: u32::from_be_bytes(len_bytes),
    })
}

/// Decrypt a pickle written by [`seal`] for the given backend and entity.
pub fn open(
    key: &PickleKey,
    backend: BackendKind,
    kind: EntityKind,
    blob: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let header = read_header(blob)?;
    if header.backend != backend {
        return Err(CryptoError::BackendMismatch {
            expected: backend,
            found: header.backend,
        });
    }
    if header.kind != kind {
        return Err(CryptoError::CorruptState(format!(
            "expected a pickled {kind}, found a pickled {}",
            header.kind
        )));
    }
    let payload_len = header.payload_len as usize;
    if blob.len() != HEADER_LEN + payload_len {
        return Err(CryptoError::CorruptState("pickle truncated".into()));
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&blob[7..7 + NONCE_LEN]);
    let payload = primitives::open(key.as_bytes(), nonce, &aad(backend, kind), &blob[HEADER_LEN..])
        .map_err(|_| CryptoError::CorruptState("wrong pickle key or corrupted pickle".into()))?;
    Ok(Zeroizing::new(payload))
}

/// Check if data starts with a valid VPKL header.
pub fn has_valid_header(blob: &[u8]) -> bool {
    read_header(blob).is_ok()
}
