//! Persistent store of cached things for one record.
//!
//! Things are kept in the key-value database under `rec/{record}/thing/{id}`.
//! Recently used things are also kept in an in-memory LRU overlay capped by
//! entry count. The overlay has its own mutex, separate from key locks.
//!
//! Readers fill the overlay without taking key locks. A fill is dropped if any
//! write reached the overlay while the reader was at the database, so a read
//! that raced a writer never leaves the older copy cached.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tracing::debug;

use crate::caches::{KeyValueDb, KeyValueDbTransaction};
use crate::error::{Error, Result};
use crate::model::Thing;

use super::keys;
use super::lock_table::{AutoLock, LockTable};

pub const DEFAULT_MAX_ITEMS_IN_MEMORY: usize = 500;

/// How long mutations wait for a contended key lock.
#[derive(Debug, Clone, Copy)]
pub struct LockRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_millis(50),
        }
    }
}

struct Overlay {
    cache: LruCache<String, Thing>,
    /// Maximum number of entries; 0 disables the overlay.
    limit: usize,
    /// Bumped by every write and eviction.
    epoch: u64,
}

impl Overlay {
    fn insert(&mut self, thing: Thing) {
        if self.limit == 0 {
            return;
        }
        self.cache.put(thing.key.id.clone(), thing);
        while self.cache.len() > self.limit {
            self.cache.pop_lru();
        }
    }

    /// Cache a thing just written to the database.
    fn store(&mut self, thing: Thing) {
        self.epoch += 1;
        self.insert(thing);
    }

    fn evict(&mut self, id: &str) {
        self.epoch += 1;
        self.cache.pop(id);
    }

    /// Cache a thing read at `epoch`, unless a write happened since.
    fn fill(&mut self, thing: Thing, epoch: u64) {
        if self.epoch == epoch {
            self.insert(thing);
        }
    }
}

/// Cached things of one record.
pub struct ThingStore {
    db: Arc<dyn KeyValueDb>,
    record_id: String,
    locks: Arc<LockTable>,
    overlay: Mutex<Overlay>,
    lock_retry: LockRetry,
}

impl ThingStore {
    pub fn new(
        db: Arc<dyn KeyValueDb>,
        record_id: impl Into<String>,
        locks: Arc<LockTable>,
        max_items_in_memory: usize,
    ) -> Self {
        Self {
            db,
            record_id: record_id.into(),
            locks,
            // Count is enforced manually so the limit can change at runtime
            overlay: Mutex::new(Overlay {
                cache: LruCache::unbounded(),
                limit: max_items_in_memory,
                epoch: 0,
            }),
            lock_retry: LockRetry::default(),
        }
    }

    pub fn with_lock_retry(mut self, lock_retry: LockRetry) -> Self {
        self.lock_retry = lock_retry;
        self
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn lock_retry(&self) -> LockRetry {
        self.lock_retry
    }

    /// Acquire the key lock for a thing id, waiting while it is contended.
    pub async fn lock_item(&self, id: &str) -> Result<AutoLock> {
        self.locks
            .acquire_with_retry(id, self.lock_retry.attempts, self.lock_retry.delay)
            .await
    }

    fn check_lock(&self, lock: &AutoLock, id: &str) -> Result<()> {
        if lock.validate_for(&self.locks, id) {
            Ok(())
        } else {
            Err(Error::LockUnavailable(id.to_string()))
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get_item(&self, id: &str) -> Result<Option<Thing>> {
        let cached = self.overlay.lock().unwrap().cache.get(id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        self.refresh_and_get_item(id).await
    }

    pub async fn exists_item(&self, id: &str) -> Result<bool> {
        if self.overlay.lock().unwrap().cache.contains(id) {
            return Ok(true);
        }
        Ok(self.db.exists(&keys::thing_key(&self.record_id, id)).await?)
    }

    /// Read from the database, bypassing and then refreshing the overlay.
    pub async fn refresh_and_get_item(&self, id: &str) -> Result<Option<Thing>> {
        let epoch = self.overlay.lock().unwrap().epoch;
        let Some(bytes) = self.db.get(&keys::thing_key(&self.record_id, id)).await? else {
            self.delete_key_from_cache(id);
            return Ok(None);
        };
        let thing: Thing = serde_json::from_slice(&bytes)?;
        self.overlay.lock().unwrap().fill(thing.clone(), epoch);
        Ok(Some(thing))
    }

    /// Ids of every cached thing, sorted.
    pub async fn all_keys(&self) -> Result<Vec<String>> {
        let prefix = keys::things_prefix(&self.record_id);
        let entries = self.db.list_entries(&prefix).await?;
        Ok(entries
            .iter()
            .filter_map(|e| e.key_suffix(&prefix).map(str::to_string))
            .collect())
    }

    /// Every cached thing, read from the database.
    pub async fn all_items(&self) -> Result<Vec<Thing>> {
        let prefix = keys::things_prefix(&self.record_id);
        let entries = self.db.list_entries(&prefix).await?;
        entries
            .iter()
            .map(|e| serde_json::from_slice(&e.value).map_err(Error::from))
            .collect()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub async fn put_item(&self, thing: Thing) -> Result<()> {
        let lock = self.lock_item(&thing.key.id).await?;
        self.put_item_locked(thing, &lock).await
    }

    /// Store `thing` while the caller holds its key lock.
    pub async fn put_item_locked(&self, thing: Thing, lock: &AutoLock) -> Result<()> {
        self.check_lock(lock, &thing.key.id)?;
        let mut txn = self.db.transaction().await?;
        self.stage_put(txn.as_mut(), &thing)?;
        txn.commit().await?;
        debug!(record = %self.record_id, id = %thing.key.id, "stored thing");
        self.overlay.lock().unwrap().store(thing);
        Ok(())
    }

    pub async fn remove_item(&self, id: &str) -> Result<()> {
        let lock = self.lock_item(id).await?;
        self.remove_item_locked(id, &lock).await
    }

    pub async fn remove_item_locked(&self, id: &str, lock: &AutoLock) -> Result<()> {
        self.check_lock(lock, id)?;
        let mut txn = self.db.transaction().await?;
        self.stage_remove(txn.as_mut(), id);
        txn.commit().await?;
        self.delete_key_from_cache(id);
        Ok(())
    }

    /// Add a put of `thing` to a transaction owned by the caller.
    ///
    /// The caller must hold the key lock and call [`ThingStore::note_stored`]
    /// once the transaction commits.
    pub(crate) fn stage_put(
        &self,
        txn: &mut (dyn KeyValueDbTransaction + Send),
        thing: &Thing,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(thing)?;
        txn.set(keys::thing_key(&self.record_id, &thing.key.id), bytes);
        Ok(())
    }

    pub(crate) fn stage_remove(&self, txn: &mut (dyn KeyValueDbTransaction + Send), id: &str) {
        txn.del(keys::thing_key(&self.record_id, id));
    }

    /// Bring the overlay in line with a committed transaction.
    pub(crate) fn note_stored(&self, id: &str, thing: Option<Thing>) {
        match thing {
            Some(thing) => self.overlay.lock().unwrap().store(thing),
            None => self.delete_key_from_cache(id),
        }
    }

    // =========================================================================
    // Overlay
    // =========================================================================

    /// Drop every overlay entry. The database is untouched.
    pub fn clear_cache(&self) {
        let mut overlay = self.overlay.lock().unwrap();
        overlay.epoch += 1;
        overlay.cache.clear();
    }

    pub fn delete_key_from_cache(&self, id: &str) {
        self.overlay.lock().unwrap().evict(id);
    }

    /// Change the overlay cap, evicting least recently used entries. 0 disables it.
    pub fn set_cache_limit_count(&self, limit: usize) {
        let mut overlay = self.overlay.lock().unwrap();
        overlay.limit = limit;
        while overlay.cache.len() > limit {
            overlay.cache.pop_lru();
        }
    }

    pub fn cached_count(&self) -> usize {
        self.overlay.lock().unwrap().cache.len()
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.overlay.lock().unwrap().cache.contains(id)
    }
}
