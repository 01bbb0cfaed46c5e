//! Veil end-to-end encryption core.
//!
//! This crate provides:
//! - Device accounts with identity keys, a one-time key pool and a fallback key
//! - Pairwise double-ratchet sessions with pre-key/normal message framing
//! - Sender-key group sessions with partial-history export and import
//! - A native Olm/Megolm engine (vodozemac) with a pure-Rust software fallback,
//!   selected once per process
//! - Encrypted pickles and device records, with device binding checks

pub mod account;
pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod group;
pub mod identity;
pub mod persistence;
pub mod pickle;
pub mod prekey;
pub mod selector;
pub mod session;
pub mod stores;

// Re-export key types for convenience
pub use account::Account;
pub use backend::BackendKind;
pub use config::CryptoConfig;
pub use context::{CryptoContext, IdentityInit, LocalIdentity};
pub use device::{BindingCheck, DeviceBindingGuard};
pub use error::CryptoError;
pub use group::{
    DecryptedGroupMessage, ExportedGroupKey, GroupCiphertext, GroupKeyKind, InboundGroupSession,
    OutboundGroupSession,
};
pub use identity::{verify_signature, DeviceIdentity, IdentityKeys};
pub use pickle::{EntityKind, PickleKey};
pub use prekey::{ClaimedKey, KeyPoolSignal, OneTimeKey, PublishedKeyDirectory};
pub use selector::{CryptoBackendSelector, Engine, EngineLoader};
pub use session::{EncryptedMessage, MessageType, Session};
pub use stores::{FileStore, IdentityStore, MemoryStore};
