//! Process-level entry point.
//!
//! A [`CryptoContext`] owns the backend selector, the configuration and the
//! identity store. Construct one per process (or per test) and pass it by
//! reference; nothing in this crate keeps global state.

use std::fmt;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

use crate::account::Account;
use crate::config::CryptoConfig;
use crate::device::{BindingCheck, DeviceBindingGuard};
use crate::error::CryptoError;
use crate::identity::DeviceIdentity;
use crate::persistence::{self, RecordHeader};
use crate::selector::{CryptoBackendSelector, Engine};
use crate::stores::{store_name_for, FileStore, IdentityStore, MemoryStore};

/// An initialized local identity.
pub struct LocalIdentity {
    pub device: DeviceIdentity,
    pub store_name: String,
    pub account: Account,
    /// Whether the account was generated by this initialization.
    pub created: bool,
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("device", &self.device)
            .field("store_name", &self.store_name)
            .field("account", &self.account)
            .field("created", &self.created)
            .finish()
    }
}

/// Result of [`CryptoContext::initialize_identity`].
#[derive(Debug)]
pub struct IdentityInit {
    /// `None` when the store is bound to another device.
    pub identity: Option<LocalIdentity>,
    pub conflicting_device_id: Option<String>,
    pub has_mismatch: bool,
}

pub struct CryptoContext {
    config: CryptoConfig,
    selector: CryptoBackendSelector,
    store: Arc<dyn IdentityStore>,
}

impl CryptoContext {
    /// Context persisting to `config.store_dir`, or in memory when unset.
    pub fn new(config: CryptoConfig) -> Result<Self, CryptoError> {
        let store: Arc<dyn IdentityStore> = match &config.store_dir {
            Some(dir) => Arc::new(FileStore::new(dir)?),
            None => Arc::new(MemoryStore::new()),
        };
        let selector = CryptoBackendSelector::new(&config);
        Ok(Self::with_parts(config, selector, store))
    }

    pub fn in_memory(config: CryptoConfig) -> Self {
        let selector = CryptoBackendSelector::new(&config);
        Self::with_parts(config, selector, Arc::new(MemoryStore::new()))
    }

    pub fn with_parts(
        config: CryptoConfig,
        selector: CryptoBackendSelector,
        store: Arc<dyn IdentityStore>,
    ) -> Self {
        Self {
            config,
            selector,
            store,
        }
    }

    pub fn config(&self) -> &CryptoConfig {
        &self.config
    }

    pub fn selector(&self) -> &CryptoBackendSelector {
        &self.selector
    }

    /// Select the backend. Idempotent; concurrent callers share one attempt.
    pub async fn initialize(&self) -> Result<Engine, CryptoError> {
        self.selector.initialize().await
    }

    pub fn is_backend_available(&self) -> bool {
        self.selector.is_available()
    }

    pub fn is_native_active(&self) -> bool {
        self.selector.is_native_active()
    }

    fn resolve_secret(&self, store_secret: Option<&str>) -> Result<Zeroizing<String>, CryptoError> {
        store_secret
            .or(self.config.store_secret.as_deref())
            .map(|secret| Zeroizing::new(secret.to_owned()))
            .ok_or_else(|| CryptoError::Config("no store secret supplied or configured".into()))
    }

    /// Open the identity persisted for (`user_id`, `device_id`), or create and
    /// persist a fresh one.
    ///
    /// If the store is bound to another device nothing is created: the result
    /// carries the persisted device id and `has_mismatch`. Clear the store
    /// with [`Self::clear_persisted_identity`] before retrying.
    #[instrument(skip(self, store_secret))]
    pub async fn initialize_identity(
        &self,
        user_id: &str,
        device_id: &str,
        store_name: Option<&str>,
        store_secret: Option<&str>,
    ) -> Result<IdentityInit, CryptoError> {
        let engine = self.initialize().await?;
        let secret = self.resolve_secret(store_secret)?;
        let store_name = store_name
            .map(str::to_owned)
            .unwrap_or_else(|| store_name_for(user_id));
        let device = DeviceIdentity::new(user_id, device_id);

        match DeviceBindingGuard::new(self.store.as_ref()).check(&store_name, &device)? {
            BindingCheck::Mismatch {
                persisted_device_id,
                ..
            } => Ok(IdentityInit {
                identity: None,
                conflicting_device_id: Some(persisted_device_id),
                has_mismatch: true,
            }),
            BindingCheck::Matches { record, .. } => {
                let (header, payload) = persistence::open_record(&record, &secret)?;
                if header.backend != engine.kind() {
                    return Err(CryptoError::BackendMismatch {
                        expected: engine.kind(),
                        found: header.backend,
                    });
                }
                let account = Account::from_payload(&engine, &payload)?;
                info!(store_name = %store_name, backend = %engine.kind(), "restored identity");
                Ok(IdentityInit {
                    identity: Some(LocalIdentity {
                        device,
                        store_name,
                        account,
                        created: false,
                    }),
                    conflicting_device_id: None,
                    has_mismatch: false,
                })
            }
            BindingCheck::Fresh => {
                let account = Account::new(&engine)?;
                account.generate_one_time_keys(self.config.initial_one_time_keys)?;
                account.generate_fallback_key()?;
                let identity = LocalIdentity {
                    device,
                    store_name,
                    account,
                    created: true,
                };
                self.seal_and_save(&identity, &secret)?;
                info!(store_name = %identity.store_name, backend = %engine.kind(), "created identity");
                Ok(IdentityInit {
                    identity: Some(identity),
                    conflicting_device_id: None,
                    has_mismatch: false,
                })
            }
        }
    }

    /// Re-seal the identity, e.g. after generating or publishing keys.
    pub fn persist_identity(
        &self,
        identity: &LocalIdentity,
        store_secret: Option<&str>,
    ) -> Result<(), CryptoError> {
        let secret = self.resolve_secret(store_secret)?;
        self.seal_and_save(identity, &secret)
    }

    fn seal_and_save(&self, identity: &LocalIdentity, secret: &str) -> Result<(), CryptoError> {
        let header = RecordHeader {
            user_id: identity.device.user_id.clone(),
            device_id: identity.device.device_id.clone(),
            backend: identity.account.backend(),
        };
        let payload = Zeroizing::new(identity.account.payload()?);
        let record =
            persistence::seal_record(&header, &payload, secret, self.config.pbkdf2_iterations)?;
        self.store.save(&identity.store_name, &record)
    }

    /// Delete the local identity of `user_id`. Destructive: the device must
    /// re-register afterwards. Returns whether a record existed.
    pub fn clear_persisted_identity(&self, user_id: &str) -> Result<bool, CryptoError> {
        self.clear_store(&store_name_for(user_id))
    }

    pub fn clear_store(&self, store_name: &str) -> Result<bool, CryptoError> {
        let existed = self.store.delete(store_name)?;
        warn!(store_name, existed, "cleared persisted identity");
        Ok(existed)
    }
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("config", &self.config)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CryptoConfig {
        CryptoConfig {
            force_fallback: true,
            pbkdf2_iterations: 1_000,
            initial_one_time_keys: 5,
            ..CryptoConfig::default()
        }
    }

    #[tokio::test]
    async fn fresh_identity_is_created_and_restored() {
        let context = CryptoContext::in_memory(config());
        let first = context
            .initialize_identity("@alice:example.org", "A", None, Some("secret"))
            .await
            .unwrap();
        let identity = first.identity.unwrap();
        assert!(identity.created);
        assert_eq!(identity.account.one_time_keys().len(), 5);
        assert!(identity.account.fallback_key().is_some());

        let second = context
            .initialize_identity("@alice:example.org", "A", None, Some("secret"))
            .await
            .unwrap();
        let restored = second.identity.unwrap();
        assert!(!restored.created);
        assert_eq!(restored.account.identity_keys(), identity.account.identity_keys());
    }

    #[tokio::test]
    async fn persisted_changes_survive() {
        let context = CryptoContext::in_memory(config());
        let init = context
            .initialize_identity("@alice:example.org", "A", None, Some("secret"))
            .await
            .unwrap();
        let identity = init.identity.unwrap();
        identity.account.mark_keys_as_published();
        context.persist_identity(&identity, Some("secret")).unwrap();

        let again = context
            .initialize_identity("@alice:example.org", "A", None, Some("secret"))
            .await
            .unwrap();
        assert!(again.identity.unwrap().account.one_time_keys().is_empty());
    }

    #[tokio::test]
    async fn missing_secret_is_a_config_error() {
        let context = CryptoContext::in_memory(config());
        assert!(matches!(
            context.initialize_identity("@alice:example.org", "A", None, None).await,
            Err(CryptoError::Config(_))
        ));
    }

    #[tokio::test]
    async fn configured_secret_is_used() {
        let context = CryptoContext::in_memory(CryptoConfig {
            store_secret: Some("configured".into()),
            ..config()
        });
        let init = context
            .initialize_identity("@alice:example.org", "A", Some("custom-store"), None)
            .await
            .unwrap();
        assert_eq!(init.identity.unwrap().store_name, "custom-store");
    }

    #[tokio::test]
    async fn wrong_secret_is_corrupt_state() {
        let context = CryptoContext::in_memory(config());
        context
            .initialize_identity("@alice:example.org", "A", None, Some("secret"))
            .await
            .unwrap();
        assert!(matches!(
            context
                .initialize_identity("@alice:example.org", "A", None, Some("wrong"))
                .await,
            Err(CryptoError::CorruptState(_))
        ));
    }

    #[tokio::test]
    async fn file_backed_context() {
        let dir = tempfile::tempdir().unwrap();
        let config = CryptoConfig {
            store_dir: Some(dir.path().to_path_buf()),
            ..config()
        };
        let keys = {
            let context = CryptoContext::new(config.clone()).unwrap();
            let init = context
                .initialize_identity("@alice:example.org", "A", None, Some("secret"))
                .await
                .unwrap();
            init.identity.unwrap().account.identity_keys()
        };

        let context = CryptoContext::new(config).unwrap();
        let init = context
            .initialize_identity("@alice:example.org", "A", None, Some("secret"))
            .await
            .unwrap();
        assert_eq!(init.identity.unwrap().account.identity_keys(), keys);
        assert!(context.clear_persisted_identity("@alice:example.org").unwrap());
    }
}
