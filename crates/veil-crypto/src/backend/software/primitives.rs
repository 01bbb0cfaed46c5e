//! Primitive operations for the software engine.
//!
//! AES-256-GCM and Ed25519 come from ring, X25519 from x25519-dalek, and the
//! chain/root KDFs are HKDF-SHA256 and HMAC-SHA256.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// AES-256-GCM authentication tag size.
pub const GCM_TAG_SIZE: usize = 16;
pub const NONCE_LEN: usize = 12;

const CHAIN_MESSAGE_SEED: &[u8] = &[0x01];
const CHAIN_ADVANCE_SEED: &[u8] = &[0x02];

pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    SystemRandom::new()
        .fill(&mut out)
        .map_err(|_| CryptoError::Encryption("RNG failed".into()))?;
    Ok(out)
}

/// A fresh X25519 key pair as (secret bytes, public bytes).
pub fn generate_x25519() -> (Zeroizing<[u8; 32]>, [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (Zeroizing::new(secret.to_bytes()), public.to_bytes())
}

/// X25519 key pair as stored in software engine state.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct X25519KeyPair {
    pub secret: [u8; 32],
    pub public: [u8; 32],
}

impl X25519KeyPair {
    pub fn generate() -> Self {
        let (secret, public) = generate_x25519();
        Self {
            secret: *secret,
            public,
        }
    }
}

pub fn x25519_public(secret: &[u8; 32]) -> [u8; 32] {
    PublicKey::from(&StaticSecret::from(*secret)).to_bytes()
}

/// X25519 agreement. Non-contributory results (small-order peer keys) are
/// rejected.
pub fn x25519(secret: &[u8; 32], public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let shared = StaticSecret::from(*secret).diffie_hellman(&PublicKey::from(*public));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("non-contributory X25519 public key".into()));
    }
    Ok(Zeroizing::new(shared.to_bytes()))
}

/// Generate an Ed25519 key pair, returned as (PKCS#8 document, public key).
pub fn generate_ed25519() -> Result<(Zeroizing<Vec<u8>>, [u8; 32]), CryptoError> {
    let document = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new())
        .map_err(|_| CryptoError::Encryption("Ed25519 key generation failed".into()))?;
    let pkcs8 = Zeroizing::new(document.as_ref().to_vec());
    let public = ed25519_public(&pkcs8)?;
    Ok((pkcs8, public))
}

fn ed25519_pair(pkcs8: &[u8]) -> Result<Ed25519KeyPair, CryptoError> {
    Ed25519KeyPair::from_pkcs8(pkcs8)
        .map_err(|e| CryptoError::CorruptState(format!("invalid Ed25519 key: {e}")))
}

pub fn ed25519_public(pkcs8: &[u8]) -> Result<[u8; 32], CryptoError> {
    let pair = ed25519_pair(pkcs8)?;
    pair.public_key()
        .as_ref()
        .try_into()
        .map_err(|_| CryptoError::CorruptState("unexpected Ed25519 public key length".into()))
}

pub fn ed25519_sign(pkcs8: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Ok(ed25519_pair(pkcs8)?.sign(message).as_ref().to_vec())
}

pub fn ed25519_verify(public: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    UnparsedPublicKey::new(&ED25519, public)
        .verify(message, signature)
        .is_ok()
}

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::Encryption("invalid HMAC key".into()))?;
    mac.update(data);
    Ok(Zeroizing::new(mac.finalize().into_bytes().into()))
}

/// Expand `ikm` into `N` bytes of key material.
pub fn hkdf<const N: usize>(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; N]>, CryptoError> {
    let mut out = Zeroizing::new([0u8; N]);
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, &mut out[..])
        .map_err(|_| CryptoError::Encryption("HKDF output too long".into()))?;
    Ok(out)
}

/// Message key for the current step of a symmetric chain.
pub fn chain_message_key(chain_key: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    hmac_sha256(chain_key, CHAIN_MESSAGE_SEED)
}

/// Next chain key. The previous one should be dropped by the caller.
pub fn chain_advance(chain_key: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    hmac_sha256(chain_key, CHAIN_ADVANCE_SEED)
}

/// AES key and nonce for one message, expanded from its message key.
pub struct MessageCipher {
    key: Zeroizing<[u8; 32]>,
    nonce: [u8; NONCE_LEN],
}

impl MessageCipher {
    pub fn derive(message_key: &[u8; 32], info: &[u8]) -> Result<Self, CryptoError> {
        let material = hkdf::<44>(None, message_key, info)?;
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&material[..32]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&material[32..]);
        Ok(Self { key, nonce })
    }

    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal(&self.key, self.nonce, aad, plaintext)
    }

    pub fn open(&self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(&self.key, self.nonce, aad, ciphertext)
    }
}

fn aead_key(key: &[u8; 32]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| CryptoError::Encryption("invalid AES-256-GCM key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// AES-256-GCM encrypt; returns ciphertext with the 16-byte tag appended.
pub fn seal(
    key: &[u8; 32],
    nonce: [u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut in_out = plaintext.to_vec();
    aead_key(key)?
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Encryption("AES-256-GCM seal failed".into()))?;
    Ok(in_out)
}

pub fn open(
    key: &[u8; 32],
    nonce: [u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < GCM_TAG_SIZE {
        return Err(CryptoError::Decryption("ciphertext too short for GCM tag".into()));
    }
    let mut in_out = ciphertext.to_vec();
    let plaintext = aead_key(key)?
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
        .map_err(|_| CryptoError::Decryption("invalid key or tampered data".into()))?;
    Ok(plaintext.to_vec())
}

/// Seal/open round trip under a random key. The fallback engine refuses to
/// start if this does not hold.
pub fn aead_self_test() -> Result<(), CryptoError> {
    let key = random_bytes::<32>()?;
    let nonce = random_bytes::<NONCE_LEN>()?;
    let probe = b"veil aead probe";
    let sealed = seal(&key, nonce, b"probe", probe)?;
    if sealed.len() != probe.len() + GCM_TAG_SIZE || &sealed[..probe.len()] == probe {
        return Err(CryptoError::NoSecureBackend("AES-256-GCM produced no ciphertext".into()));
    }
    let opened = open(&key, nonce, b"probe", &sealed)
        .map_err(|e| CryptoError::NoSecureBackend(e.to_string()))?;
    if opened != probe {
        return Err(CryptoError::NoSecureBackend("AES-256-GCM round trip mismatch".into()));
    }
    Ok(())
}
