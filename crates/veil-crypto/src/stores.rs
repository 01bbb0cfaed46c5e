//! Where sealed device records live.
//!
//! The crypto layer only produces and consumes opaque bytes; an
//! [`IdentityStore`] decides where they go. Records are keyed by a store name,
//! by default derived from the user id with [`store_name_for`].

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::CryptoError;

const RECORD_EXTENSION: &str = "vdev";

pub trait IdentityStore: Send + Sync {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, CryptoError>;
    fn save(&self, name: &str, record: &[u8]) -> Result<(), CryptoError>;
    /// Returns whether a record existed.
    fn delete(&self, name: &str) -> Result<bool, CryptoError>;
}

/// Deterministic store name for a user.
/// We use a UUID v5 of the user id so names are filesystem safe.
pub fn store_name_for(user_id: &str) -> String {
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("veil-user-{user_id}").as_bytes());
    format!("veil-identity-{uuid}")
}

/// Process-local store, for tests and ephemeral identities.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryStore {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.records.get(name).map(|record| record.value().clone()))
    }

    fn save(&self, name: &str, record: &[u8]) -> Result<(), CryptoError> {
        self.records.insert(name.to_owned(), record.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, CryptoError> {
        Ok(self.records.remove(name).is_some())
    }
}

/// One file per store name in a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CryptoError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, CryptoError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(CryptoError::Config(format!("invalid store name {name:?}")));
        }
        Ok(self.dir.join(format!("{name}.{RECORD_EXTENSION}")))
    }
}

impl IdentityStore for FileStore {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        match fs::read(self.path_for(name)?) {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, name: &str, record: &[u8]) -> Result<(), CryptoError> {
        let path = self.path_for(name)?;
        // Write to a temp file first so a crash never leaves a torn record.
        let tmp = self.dir.join(format!(".{name}.tmp"));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(record)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "saved device record");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, CryptoError> {
        match fs::remove_file(self.path_for(name)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
