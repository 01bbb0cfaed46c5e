//! Encrypted device records.
//!
//! A device record holds the account of one local identity, sealed under a
//! passphrase with PBKDF2 + AES-256-GCM. Its header names the user, device
//! and backend in the clear so a device mismatch can be reported before
//! the secret is needed; the header is still authenticated.
//!
//! File format: [VDEV magic(4)] [version(1)] [iterations(4)] [salt(32)]
//! [nonce(12)] [header length(2)] [header] [length(4)]
//! [encrypted payload + tag(16)]

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::backend::software::primitives::{self, NONCE_LEN};
use crate::backend::BackendKind;
use crate::error::CryptoError;
use crate::pickle::PickleKey;

const MAGIC: &[u8; 4] = b"VDEV"; // "Veil DEVice"
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const PREFIX_LEN: usize = 4 + 1 + 4; // magic, version, iterations
const FIXED_LEN: usize = PREFIX_LEN + SALT_LEN + NONCE_LEN + 2; // 55 bytes
/// Upper bound on the work factor a record may ask for before it is
/// authenticated.
const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

/// Who a device record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub user_id: String,
    pub device_id: String,
    pub backend: BackendKind,
}

struct ParsedRecord<'a> {
    iterations: u32,
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    header_bytes: &'a [u8],
    header: RecordHeader,
    ciphertext: &'a [u8],
}

impl ParsedRecord<'_> {
    fn aad(&self, data: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(PREFIX_LEN + self.header_bytes.len());
        aad.extend_from_slice(&data[..PREFIX_LEN]);
        aad.extend_from_slice(self.header_bytes);
        aad
    }
}

fn corrupt(message: impl Into<String>) -> CryptoError {
    CryptoError::CorruptState(message.into())
}

fn parse(data: &[u8]) -> Result<ParsedRecord<'_>, CryptoError> {
    if data.len() < FIXED_LEN {
        return Err(corrupt("device record too short"));
    }
    if &data[0..4] != MAGIC {
        return Err(corrupt("invalid device record (expected VDEV header)"));
    }
    if data[4] != VERSION {
        return Err(corrupt(format!("unsupported device record version {}", data[4])));
    }

    let mut iterations = [0u8; 4];
    iterations.copy_from_slice(&data[5..9]);
    let iterations = u32::from_be_bytes(iterations);
    if iterations == 0 || iterations > MAX_PBKDF2_ITERATIONS {
        return Err(corrupt(format!("implausible PBKDF2 iteration count {iterations}")));
    }

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&data[9..9 + SALT_LEN]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&data[41..41 + NONCE_LEN]);

    let mut len_bytes = [0u8; 2];
    len_bytes.copy_from_slice(&data[53..55]);
    let header_len = u16::from_be_bytes(len_bytes) as usize;
    let header_end = FIXED_LEN + header_len;
    if data.len() < header_end + 4 {
        return Err(corrupt("device record truncated"));
    }
    let header_bytes = &data[FIXED_LEN..header_end];
    let header: RecordHeader = postcard::from_bytes(header_bytes)
        .map_err(|e| corrupt(format!("malformed device record header: {e}")))?;

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[header_end..header_end + 4]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;
    let ciphertext = &data[header_end + 4..];
    if ciphertext.len() != payload_len {
        return Err(corrupt("device record truncated"));
    }

    Ok(ParsedRecord {
        iterations,
        salt,
        nonce,
        header_bytes,
        header,
        ciphertext,
    })
}

/// Seal an account payload into a device record.
pub fn seal_record(
    header: &RecordHeader,
    payload: &[u8],
    passphrase: &str,
    iterations: u32,
) -> Result<Vec<u8>, CryptoError> {
    if iterations == 0 || iterations > MAX_PBKDF2_ITERATIONS {
        return Err(CryptoError::Config(format!(
            "PBKDF2 iterations must be between 1 and {MAX_PBKDF2_ITERATIONS}"
        )));
    }
    let header_bytes = postcard::to_allocvec(header)
        .map_err(|e| CryptoError::Encryption(format!("header encode failed: {e}")))?;
    let header_len = u16::try_from(header_bytes.len())
        .map_err(|_| CryptoError::Encryption("device record header too large".into()))?;

    let salt = primitives::random_bytes::<SALT_LEN>()?;
    let nonce = primitives::random_bytes::<NONCE_LEN>()?;
    let key = PickleKey::derive(passphrase, &salt, iterations)?;

    let mut prefix = Vec::with_capacity(PREFIX_LEN);
    prefix.extend_from_slice(MAGIC);
    prefix.push(VERSION);
    prefix.extend_from_slice(&iterations.to_be_bytes());

    let mut aad = prefix.clone();
    aad.extend_from_slice(&header_bytes);
    let ciphertext = primitives::seal(key.as_bytes(), nonce, &aad, payload)?;
    let payload_len = u32::try_from(ciphertext.len())
        .map_err(|_| CryptoError::Encryption("device record payload too large".into()))?;

    let mut data =
        Vec::with_capacity(FIXED_LEN + header_bytes.len() + 4 + ciphertext.len());
    data.extend_from_slice(&prefix);
    data.extend_from_slice(&salt);
    data.extend_from_slice(&nonce);
    data.extend_from_slice(&header_len.to_be_bytes());
    data.extend_from_slice(&header_bytes);
    data.extend_from_slice(&payload_len.to_be_bytes());
    data.extend_from_slice(&ciphertext);
    Ok(data)
}

/// The cleartext header, without the passphrase.
pub fn read_record_header(data: &[u8]) -> Result<RecordHeader, CryptoError> {
    Ok(parse(data)?.header)
}

/// Decrypt a device record, returning its header and the account payload.
pub fn open_record(
    data: &[u8],
    passphrase: &str,
) -> Result<(RecordHeader, Zeroizing<Vec<u8>>), CryptoError> {
    let record = parse(data)?;
    let key = PickleKey::derive(passphrase, &record.salt, record.iterations)?;
    let payload = primitives::open(key.as_bytes(), record.nonce, &record.aad(data), record.ciphertext)
        .map_err(|_| corrupt("incorrect store secret or corrupted device record"))?;
    Ok((record.header, Zeroizing::new(payload)))
}

/// Check if file data starts with a valid VDEV header.
pub fn has_valid_header(data: &[u8]) -> bool {
    parse(data).is_ok()
}
