//! Device account: identity keys, the one-time key pool and the fallback key.
//!
//! All pool operations (generate, publish, consume on inbound handshake) run
//! under one lock, so concurrent callers never observe a half-updated pool.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::backend::{AccountBackend, BackendKind};
use crate::error::CryptoError;
use crate::identity::IdentityKeys;
use crate::pickle::{self, EntityKind, PickleKey};
use crate::prekey::{KeyPoolSignal, OneTimeKey};
use crate::selector::Engine;

pub struct Account {
    backend: BackendKind,
    inner: Mutex<Box<dyn AccountBackend>>,
}

impl Account {
    /// Fresh identity on the given engine.
    pub fn new(engine: &Engine) -> Result<Self, CryptoError> {
        let inner = engine.inner().create_account()?;
        let account = Self::from_backend(engine.kind(), inner);
        info!(backend = %account.backend, "created new account");
        Ok(account)
    }

    fn from_backend(backend: BackendKind, inner: Box<dyn AccountBackend>) -> Self {
        Self {
            backend,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn AccountBackend>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the backend handle while holding the pool lock.
    pub(crate) fn with_backend<R>(&self, f: impl FnOnce(&mut dyn AccountBackend) -> R) -> R {
        let mut inner = self.lock();
        f(&mut **inner)
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn identity_keys(&self) -> IdentityKeys {
        self.lock().identity_keys()
    }

    /// Ed25519 signature over `message`, unpadded base64.
    pub fn sign(&self, message: &str) -> Result<String, CryptoError> {
        self.lock().sign(message)
    }

    /// Append `count` unpublished one-time keys with fresh ids.
    pub fn generate_one_time_keys(&self, count: usize) -> Result<(), CryptoError> {
        self.lock().generate_one_time_keys(count)?;
        debug!(count, "generated one-time keys");
        Ok(())
    }

    /// Unpublished one-time keys, key id -> public key.
    pub fn one_time_keys(&self) -> BTreeMap<String, String> {
        self.lock().one_time_keys()
    }

    /// Mark every current one-time key (and the fallback key) as published.
    /// Published keys are kept until a handshake consumes them.
    pub fn mark_keys_as_published(&self) {
        self.lock().mark_keys_as_published();
    }

    pub fn max_one_time_keys(&self) -> usize {
        self.lock().max_one_time_keys()
    }

    /// Replace the fallback key. The previous one keeps working for
    /// handshakes already in flight.
    pub fn generate_fallback_key(&self) -> Result<(), CryptoError> {
        self.lock().generate_fallback_key()?;
        debug!("generated fallback key");
        Ok(())
    }

    /// The fallback key, if it has not been published yet.
    pub fn fallback_key(&self) -> Option<OneTimeKey> {
        self.lock()
            .fallback_key()
            .map(|(key_id, public_key)| OneTimeKey { key_id, public_key })
    }

    /// Evaluate the pool given how many published keys the server still
    /// holds. Exhaustion rotates in a fresh fallback key unless an
    /// unpublished one is already waiting.
    pub fn check_key_pool(&self, remaining_published: usize) -> Result<KeyPoolSignal, CryptoError> {
        let mut inner = self.lock();
        let target = inner.max_one_time_keys() / 2;
        let signal = KeyPoolSignal::evaluate(remaining_published, target);
        match signal {
            KeyPoolSignal::Exhausted { count } => {
                warn!(count, "one-time key pool exhausted");
                if inner.fallback_key().is_none() {
                    inner.generate_fallback_key()?;
                }
            }
            KeyPoolSignal::Replenish { count } => {
                debug!(remaining_published, count, "one-time key pool running low");
            }
            KeyPoolSignal::Healthy => {}
        }
        Ok(signal)
    }

    pub fn pickle(&self, key: &PickleKey) -> Result<Vec<u8>, CryptoError> {
        let payload = self.payload()?;
        pickle::seal(key, self.backend, EntityKind::Account, &payload)
    }

    /// Restore an account pickled by [`Account::pickle`] on the same backend.
    pub fn unpickle(engine: &Engine, blob: &[u8], key: &PickleKey) -> Result<Self, CryptoError> {
        let payload = pickle::open(key, engine.kind(), EntityKind::Account, blob)?;
        Self::from_payload(engine, &payload)
    }

    pub(crate) fn payload(&self) -> Result<Vec<u8>, CryptoError> {
        self.lock().payload()
    }

    pub(crate) fn from_payload(engine: &Engine, payload: &[u8]) -> Result<Self, CryptoError> {
        let inner = engine.inner().restore_account(payload)?;
        Ok(Self::from_backend(engine.kind(), inner))
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("backend", &self.backend)
            .field("curve25519", &self.identity_keys().curve25519)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::identity::verify_signature;

    fn account() -> Account {
        Account::new(&Engine::software().unwrap()).unwrap()
    }

    #[test]
    fn generated_ids_never_collide() {
        let account = account();
        account.generate_one_time_keys(10).unwrap();
        let first: BTreeSet<_> = account.one_time_keys().into_keys().collect();
        account.mark_keys_as_published();
        account.generate_one_time_keys(10).unwrap();
        let second: BTreeSet<_> = account.one_time_keys().into_keys().collect();

        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 10);
        assert!(first.is_disjoint(&second));
    }

    #[test]
    fn published_keys_stay_hidden_after_pickle() {
        let engine = Engine::software().unwrap();
        let key = PickleKey::generate().unwrap();
        let account = Account::new(&engine).unwrap();
        account.generate_one_time_keys(4).unwrap();
        account.mark_keys_as_published();
        account.generate_one_time_keys(2).unwrap();
        let unpublished = account.one_time_keys();

        let restored = Account::unpickle(&engine, &account.pickle(&key).unwrap(), &key).unwrap();
        assert_eq!(restored.one_time_keys(), unpublished);
        assert_eq!(restored.identity_keys(), account.identity_keys());

        restored.generate_one_time_keys(2).unwrap();
        let fresh: BTreeSet<_> = restored.one_time_keys().into_keys().collect();
        assert_eq!(fresh.len(), 4);
        assert!(unpublished.keys().all(|id| fresh.contains(id)));
    }

    #[test]
    fn signatures_verify() {
        let account = account();
        let signature = account.sign("keys").unwrap();
        verify_signature(&account.identity_keys().ed25519, "keys", &signature).unwrap();
    }

    #[test]
    fn fallback_key_published_with_pool() {
        let account = account();
        account.generate_fallback_key().unwrap();
        assert!(account.fallback_key().is_some());
        account.mark_keys_as_published();
        assert!(account.fallback_key().is_none());
    }

    #[test]
    fn exhaustion_is_a_signal() {
        let account = account();
        assert_eq!(account.check_key_pool(40).unwrap(), KeyPoolSignal::Healthy);
        assert_eq!(
            account.check_key_pool(4).unwrap(),
            KeyPoolSignal::Replenish { count: 46 }
        );
        assert!(account.fallback_key().is_none());
        assert_eq!(
            account.check_key_pool(0).unwrap(),
            KeyPoolSignal::Exhausted { count: 50 }
        );
        assert!(account.fallback_key().is_some());
    }

    #[test]
    fn unpickle_on_wrong_backend_is_refused() {
        let engine = Engine::software().unwrap();
        let key = PickleKey::generate().unwrap();
        let blob = account().pickle(&key).unwrap();
        let mut tampered = blob.clone();
        tampered[5] = BackendKind::Native.tag();
        assert!(matches!(
            Account::unpickle(&engine, &tampered, &key),
            Err(CryptoError::BackendMismatch { .. })
        ));
    }

    #[test]
    fn garbage_pickle_is_corrupt() {
        let engine = Engine::software().unwrap();
        let key = PickleKey::generate().unwrap();
        let err = Account::unpickle(&engine, b"not a pickle", &key).unwrap_err();
        assert!(matches!(err, CryptoError::CorruptState(_)));
        assert!(!err.is_recoverable());
    }
}
