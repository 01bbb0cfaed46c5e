use thiserror::Error;

use crate::backend::BackendKind;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The native engine could not be used. Recovered by falling back.
    #[error("backend initialization failed: {0}")]
    Initialization(String),

    /// Not even the fallback's authenticated encryption works. Fatal.
    #[error("no secure crypto backend available: {0}")]
    NoSecureBackend(String),

    #[error("device mismatch: store is bound to device {persisted_device_id}, caller asserted {asserted_device_id}")]
    DeviceMismatch {
        persisted_device_id: String,
        asserted_device_id: String,
    },

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("corrupt state: {0}")]
    CorruptState(String),

    #[error("state was pickled by the {found} backend, active backend is {expected}")]
    BackendMismatch {
        expected: BackendKind,
        found: BackendKind,
    },

    #[error("one-time key pool exhausted")]
    KeyExhaustion,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl CryptoError {
    /// Whether the caller can carry on without an explicit user decision.
    ///
    /// Device mismatches, corrupt state and backend switches need a reset or
    /// re-registration; everything else is local to one operation.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CryptoError::NoSecureBackend(_)
                | CryptoError::DeviceMismatch { .. }
                | CryptoError::CorruptState(_)
                | CryptoError::BackendMismatch { .. }
        )
    }
}
