//! KeyedLocks - per-key serialization
//!
//! ## Purpose
//!
//! - Linearize operations on the same key (stream key, source id)
//! - Operations on different keys never contend
//! - Lease released automatically on drop
//!
//! An entry lives only while someone holds or waits on it; the last lease
//! to drop removes it, so arbitrary keys never accumulate.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

type LockMap<K> = HashMap<K, Arc<Mutex<()>>>;

/// Lock table keyed by `K`
pub struct KeyedLocks<K> {
    /// Only touched in short synchronous sections (also from `Drop`)
    locks: Arc<StdMutex<LockMap<K>>>,
    /// None = wait indefinitely
    wait_timeout: Option<Duration>,
}

fn table<K>(locks: &StdMutex<LockMap<K>>) -> MutexGuard<'_, LockMap<K>> {
    // a panic while holding the table cannot leave the map half-updated
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remove `key` when nothing but the table references its lock
fn remove_if_idle<K: Eq + Hash>(locks: &mut LockMap<K>, key: &K) {
    if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        locks.remove(key);
    }
}

impl<K> KeyedLocks<K>
where
    K: Clone + Eq + Hash + Display,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
            wait_timeout: None,
        }
    }

    /// Create with a bounded wait; `acquire` returns `LockError::Busy` on expiry
    pub fn with_timeout(wait: Duration) -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
            wait_timeout: Some(wait),
        }
    }

    /// Acquire the lock for `key`, waiting if another holder is active
    pub async fn acquire(&self, key: &K) -> Result<KeyLease<K>, LockError> {
        let lock = self.get_or_create_lock(key);

        let guard = match self.wait_timeout {
            None => lock.lock_owned().await,
            Some(wait) => match timeout(wait, lock.lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    // the timed-out future released its Arc
                    remove_if_idle(&mut table(&self.locks), key);
                    tracing::warn!(
                        key = %key,
                        timeout_ms = wait.as_millis() as u64,
                        "Key lock wait timed out"
                    );
                    return Err(LockError::Busy);
                }
            },
        };

        tracing::trace!(key = %key, "Key lock acquired");
        Ok(KeyLease {
            key: key.clone(),
            guard: Some(guard),
            locks: self.locks.clone(),
        })
    }

    fn get_or_create_lock(&self, key: &K) -> Arc<Mutex<()>> {
        table(&self.locks)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        table(&self.locks).len()
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Held lock - released on drop
pub struct KeyLease<K: Eq + Hash> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<StdMutex<LockMap<K>>>,
}

impl<K: Eq + Hash> KeyLease<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for KeyLease<K> {
    fn drop(&mut self) {
        // new waiters clone the lock under the table mutex, so the count is stable here
        let mut locks = table(&self.locks);
        drop(self.guard.take());
        remove_if_idle(&mut locks, &self.key);
    }
}

/// Lock acquisition error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("key busy (wait timeout)")]
    Busy,
}
