//! Per-key mutual exclusion for cache writers.
//!
//! Each acquire hands out a fresh lock id; ids are never reused within a
//! table, so a stale id held by a finished writer can never validate again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Identifies one acquisition of a key lock.
pub type LockId = u64;

#[derive(Default)]
struct LockTableInner {
    locks: HashMap<String, LockId>,
    last_lock_id: LockId,
}

/// Table of held key locks.
#[derive(Default)]
pub struct LockTable {
    inner: Mutex<LockTableInner>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, or `None` if another writer holds it.
    pub fn acquire_lock_for_key(&self, key: &str) -> Option<LockId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locks.contains_key(key) {
            return None;
        }
        inner.last_lock_id += 1;
        let id = inner.last_lock_id;
        inner.locks.insert(key.to_string(), id);
        Some(id)
    }

    /// Release `key` if `lock_id` holds it. Returns false otherwise.
    pub fn release_lock(&self, lock_id: LockId, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.locks.get(key) == Some(&lock_id) {
            inner.locks.remove(key);
            true
        } else {
            false
        }
    }

    /// True if `lock_id` currently holds `key`.
    pub fn validate_lock(&self, lock_id: LockId, key: &str) -> bool {
        self.inner.lock().unwrap().locks.get(key) == Some(&lock_id)
    }

    pub fn is_key_locked(&self, key: &str) -> bool {
        self.inner.lock().unwrap().locks.contains_key(key)
    }

    /// True if `lock_id` currently holds any key.
    pub fn is_valid_lock_id(&self, lock_id: LockId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .locks
            .values()
            .any(|id| *id == lock_id)
    }

    pub fn all_locked_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().unwrap().locks.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Human-readable description of the lock on `key`, for diagnostics.
    pub fn describe_lock_for_key(&self, key: &str) -> String {
        match self.inner.lock().unwrap().locks.get(key) {
            Some(id) => format!("key {} locked by {}", key, id),
            None => format!("key {} unlocked", key),
        }
    }

    /// Acquire a lock that is released when the returned guard is dropped.
    pub fn new_auto_lock(self: &Arc<Self>, key: &str) -> Option<AutoLock> {
        let lock_id = self.acquire_lock_for_key(key)?;
        Some(AutoLock {
            table: self.clone(),
            key: key.to_string(),
            lock_id,
            released: false,
        })
    }

    /// Acquire an auto lock, retrying up to `attempts` times while the key is held.
    pub async fn acquire_with_retry(
        self: &Arc<Self>,
        key: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<AutoLock> {
        for attempt in 0..attempts.max(1) {
            if let Some(lock) = self.new_auto_lock(key) {
                return Ok(lock);
            }
            debug!(key, attempt, "key is locked, waiting");
            tokio::time::sleep(delay).await;
        }
        Err(Error::LockUnavailable(key.to_string()))
    }
}

// =============================================================================
// AutoLock
// =============================================================================

/// A held key lock, released on drop.
pub struct AutoLock {
    table: Arc<LockTable>,
    key: String,
    lock_id: LockId,
    released: bool,
}

impl AutoLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    /// True if this guard still holds its key in `table`.
    pub fn validate(&self) -> bool {
        !self.released && self.table.validate_lock(self.lock_id, &self.key)
    }

    /// True if this guard was issued by `table` and still holds `key`.
    pub fn validate_for(&self, table: &Arc<LockTable>, key: &str) -> bool {
        Arc::ptr_eq(&self.table, table) && self.key == key && self.validate()
    }

    /// Release early. Returns false if the lock was already released.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.table.release_lock(self.lock_id, &self.key)
    }
}

impl Drop for AutoLock {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for AutoLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoLock")
            .field("key", &self.key)
            .field("lock_id", &self.lock_id)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_holder_per_key() {
        let table = LockTable::new();
        let id = table.acquire_lock_for_key("a").unwrap();
        assert!(table.acquire_lock_for_key("a").is_none());
        assert!(table.acquire_lock_for_key("b").is_some());
        assert!(table.validate_lock(id, "a"));
        assert!(table.is_valid_lock_id(id));
    }

    #[test]
    fn test_released_and_foreign_ids_never_validate() {
        let table = LockTable::new();
        let first = table.acquire_lock_for_key("a").unwrap();
        assert!(!table.release_lock(first + 100, "a"));
        assert!(table.release_lock(first, "a"));
        assert!(!table.validate_lock(first, "a"));
        assert!(!table.release_lock(first, "a"));

        let second = table.acquire_lock_for_key("a").unwrap();
        assert_ne!(first, second);
        assert!(!table.validate_lock(first, "a"));
        assert!(table.validate_lock(second, "a"));
        assert!(!table.is_valid_lock_id(first));
    }

    #[test]
    fn test_auto_lock_releases_on_drop() {
        let table = Arc::new(LockTable::new());
        {
            let lock = table.new_auto_lock("a").unwrap();
            assert!(lock.validate());
            assert_eq!(table.all_locked_keys(), vec!["a".to_string()]);
        }
        assert!(!table.is_key_locked("a"));
    }

    #[test]
    fn test_explicit_release_then_drop() {
        let table = Arc::new(LockTable::new());
        let mut lock = table.new_auto_lock("a").unwrap();
        assert!(lock.release());
        assert!(!lock.validate());
        assert!(!lock.release());
        let other = table.new_auto_lock("a").unwrap();
        drop(lock);
        // Dropping the released guard leaves the new holder alone
        assert!(other.validate());
    }

    #[test]
    fn test_describe_lock_names_holder() {
        let table = Arc::new(LockTable::new());
        assert_eq!(table.describe_lock_for_key("a"), "key a unlocked");
        let lock = table.new_auto_lock("a").unwrap();
        assert_eq!(
            table.describe_lock_for_key("a"),
            format!("key a locked by {}", lock.lock_id())
        );
        drop(lock);
        assert_eq!(table.describe_lock_for_key("a"), "key a unlocked");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_yields_one_holder() {
        let table = Arc::new(LockTable::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let table = table.clone();
            handles.push(tokio::spawn(async move { table.acquire_lock_for_key("k") }));
        }
        let mut winners = Vec::new();
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                winners.push(id);
            }
        }
        assert_eq!(winners.len(), 1);
        assert!(table.validate_lock(winners[0], "k"));
    }

    #[tokio::test]
    async fn test_acquire_with_retry() {
        let table = Arc::new(LockTable::new());
        let held = table.new_auto_lock("a").unwrap();
        let err = table
            .acquire_with_retry("a", 2, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err, Error::LockUnavailable("a".to_string()));

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .acquire_with_retry("a", 50, Duration::from_millis(5))
                    .await
                    .map(|lock| lock.lock_id())
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }
}
