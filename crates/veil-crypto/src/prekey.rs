//! One-time key pool signals and the claim side of published keys.
//!
//! One-time keys are single-use Curve25519 keys a peer claims to start a
//! session while we are offline. The fallback key is reusable and is only
//! handed out once every one-time key has been claimed.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::account::Account;
use crate::error::CryptoError;
use crate::identity::IdentityKeys;

/// Number of one-time keys to generate when an identity is first created.
pub const INITIAL_ONE_TIME_KEYS: usize = 50;

/// Threshold below which we should replenish one-time keys.
pub const REPLENISH_THRESHOLD: usize = 10;

/// A one-time (or fallback) key's public portion, as uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeKey {
    pub key_id: String,
    pub public_key: String,
}

/// State of the published pool. Exhaustion is a signal to replenish, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPoolSignal {
    Healthy,
    Replenish { count: usize },
    Exhausted { count: usize },
}

impl KeyPoolSignal {
    /// `target` is the number of published keys the pool should be topped
    /// back up to.
    pub fn evaluate(remaining: usize, target: usize) -> Self {
        if remaining == 0 {
            KeyPoolSignal::Exhausted { count: target }
        } else if remaining < REPLENISH_THRESHOLD {
            KeyPoolSignal::Replenish {
                count: target.saturating_sub(remaining),
            }
        } else {
            KeyPoolSignal::Healthy
        }
    }

    pub fn needs_keys(&self) -> bool {
        !matches!(self, KeyPoolSignal::Healthy)
    }
}

/// What a peer receives when claiming a key for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedKey {
    pub identity_keys: IdentityKeys,
    pub one_time_key: OneTimeKey,
    pub is_fallback: bool,
}

#[derive(Default)]
struct Published {
    one_time_keys: VecDeque<OneTimeKey>,
    fallback_key: Option<OneTimeKey>,
}

/// Keys one device has published, as a key server holds them.
pub struct PublishedKeyDirectory {
    identity_keys: IdentityKeys,
    published: Mutex<Published>,
}

impl PublishedKeyDirectory {
    pub fn new(identity_keys: IdentityKeys) -> Self {
        Self {
            identity_keys,
            published: Mutex::new(Published::default()),
        }
    }

    pub fn identity_keys(&self) -> &IdentityKeys {
        &self.identity_keys
    }

    /// Upload every unpublished key of `account` and mark them published.
    /// Reading and marking happen under the account lock, so keys generated
    /// concurrently are never marked without being uploaded.
    pub fn publish(&self, account: &Account) -> usize {
        let (one_time_keys, fallback_key) = account.with_backend(|backend| {
            let keys = backend.one_time_keys();
            let fallback = backend.fallback_key();
            backend.mark_keys_as_published();
            (keys, fallback)
        });

        let mut published = self.published.lock().unwrap_or_else(|p| p.into_inner());
        let count = one_time_keys.len();
        published.one_time_keys.extend(
            one_time_keys
                .into_iter()
                .map(|(key_id, public_key)| OneTimeKey { key_id, public_key }),
        );
        if let Some((key_id, public_key)) = fallback_key {
            published.fallback_key = Some(OneTimeKey { key_id, public_key });
        }
        debug!(count, "published one-time keys");
        count
    }

    /// Hand out the oldest unclaimed one-time key, each exactly once; then the
    /// fallback key, repeatedly; then [`CryptoError::KeyExhaustion`].
    pub fn claim(&self) -> Result<ClaimedKey, CryptoError> {
        let mut published = self.published.lock().unwrap_or_else(|p| p.into_inner());
        let (one_time_key, is_fallback) = match published.one_time_keys.pop_front() {
            Some(key) => (key, false),
            None => (
                published
                    .fallback_key
                    .clone()
                    .ok_or(CryptoError::KeyExhaustion)?,
                true,
            ),
        };
        Ok(ClaimedKey {
            identity_keys: self.identity_keys.clone(),
            one_time_key,
            is_fallback,
        })
    }

    /// Unclaimed one-time keys.
    pub fn remaining(&self) -> usize {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .one_time_keys
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::selector::Engine;

    #[test]
    fn signal_thresholds() {
        assert_eq!(KeyPoolSignal::evaluate(25, 50), KeyPoolSignal::Healthy);
        assert_eq!(
            KeyPoolSignal::evaluate(9, 50),
            KeyPoolSignal::Replenish { count: 41 }
        );
        assert_eq!(
            KeyPoolSignal::evaluate(0, 50),
            KeyPoolSignal::Exhausted { count: 50 }
        );
        assert!(!KeyPoolSignal::Healthy.needs_keys());
    }

    #[test]
    fn keys_are_claimed_once_in_order() {
        let account = Account::new(&Engine::software().unwrap()).unwrap();
        account.generate_one_time_keys(5).unwrap();
        let directory = PublishedKeyDirectory::new(account.identity_keys());

        assert_eq!(directory.publish(&account), 5);
        assert!(account.one_time_keys().is_empty());
        assert_eq!(directory.publish(&account), 0);

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let claimed = directory.claim().unwrap();
            assert!(!claimed.is_fallback);
            assert!(seen.insert(claimed.one_time_key.key_id));
        }
        assert_eq!(directory.remaining(), 0);
        assert!(matches!(directory.claim(), Err(CryptoError::KeyExhaustion)));
    }

    #[test]
    fn fallback_key_is_reused_after_exhaustion() {
        let account = Account::new(&Engine::software().unwrap()).unwrap();
        account.generate_one_time_keys(1).unwrap();
        account.generate_fallback_key().unwrap();
        let directory = PublishedKeyDirectory::new(account.identity_keys());
        directory.publish(&account);

        assert!(!directory.claim().unwrap().is_fallback);
        let first = directory.claim().unwrap();
        let second = directory.claim().unwrap();
        assert!(first.is_fallback && second.is_fallback);
        assert_eq!(first.one_time_key, second.one_time_key);
    }

    #[test]
    fn concurrent_generate_and_publish_lose_nothing() {
        const GENERATORS: usize = 4;
        const ROUNDS: usize = 5;
        const BATCH: usize = 4;

        let account = Account::new(&Engine::software().unwrap()).unwrap();
        let directory = PublishedKeyDirectory::new(account.identity_keys());

        std::thread::scope(|scope| {
            for _ in 0..GENERATORS {
                scope.spawn(|| {
                    for _ in 0..ROUNDS {
                        account.generate_one_time_keys(BATCH).unwrap();
                    }
                });
            }
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..ROUNDS * 2 {
                        directory.publish(&account);
                        std::thread::yield_now();
                    }
                });
            }
        });

        let mut published = Vec::new();
        loop {
            match directory.claim() {
                Ok(claimed) => published.push(claimed.one_time_key.key_id),
                Err(CryptoError::KeyExhaustion) => break,
                Err(e) => panic!("unexpected claim error: {e}"),
            }
        }
        let unpublished: Vec<_> = account.one_time_keys().into_keys().collect();

        let all: HashSet<_> = published.iter().chain(&unpublished).cloned().collect();
        assert_eq!(published.len() + unpublished.len(), GENERATORS * ROUNDS * BATCH);
        assert_eq!(all.len(), GENERATORS * ROUNDS * BATCH);
    }
}
