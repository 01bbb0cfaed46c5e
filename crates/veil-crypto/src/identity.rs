//! Identity key types and encoding helpers.
//!
//! Each device has a long-term Curve25519 identity key (key agreement) and
//! an Ed25519 signing key, generated once per account and kept until the
//! device is reset. Keys travel as unpadded base64, the same encoding the
//! native engine uses, so both backends present identical key formats.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use ring::signature::{UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Public identity keys of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    /// Curve25519 identity key, unpadded base64.
    pub curve25519: String,
    /// Ed25519 signing key, unpadded base64.
    pub ed25519: String,
}

/// (userId, deviceId) pair a local identity is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub user_id: String,
    pub device_id: String,
}

impl DeviceIdentity {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

pub fn decode_base64(input: &str) -> Result<Vec<u8>, CryptoError> {
    // Accept padded input from callers that re-encode keys.
    STANDARD_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")))
}

/// Decode a 32-byte public key (Curve25519 or Ed25519) from base64.
pub fn decode_key32(input: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = decode_base64(input)?;
    bytes.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("expected 32 key bytes, got {}", bytes.len()))
    })
}

/// Verify an Ed25519 signature produced by [`crate::Account::sign`].
///
/// Signatures are plain Ed25519 on both backends, so any peer can check
/// them regardless of which engine produced them.
pub fn verify_signature(
    ed25519_key: &str,
    message: &str,
    signature: &str,
) -> Result<(), CryptoError> {
    let key = decode_key32(ed25519_key)?;
    let signature = decode_base64(signature)?;
    UnparsedPublicKey::new(&ED25519, key)
        .verify(message.as_bytes(), &signature)
        .map_err(|_| CryptoError::InvalidKey("signature verification failed".into()))
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    use super::*;

    #[test]
    fn key_roundtrip_through_base64() {
        let key = [7u8; 32];
        let encoded = encode_base64(&key);
        assert!(!encoded.ends_with('='));
        assert_eq!(decode_key32(&encoded).unwrap(), key);
    }

    #[test]
    fn padded_input_is_accepted() {
        let key = [9u8; 32];
        let padded = STANDARD.encode(key);
        assert!(padded.ends_with('='));
        assert_eq!(decode_key32(&padded).unwrap(), key);
    }

    #[test]
    fn wrong_length_rejected() {
        let short = encode_base64(&[1u8; 16]);
        assert!(matches!(decode_key32(&short), Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn garbage_rejected() {
        assert!(decode_base64("not base64 !!").is_err());
    }
}
