//! Cache of one record: things, pending operations, sync status, views and
//! stored queries.
//!
//! Every write that touches both a thing and its pending operations happens
//! in a single key-value transaction while the thing's key lock is held.
//!
//! Server data never overwrites a thing with pending operations. Writers of
//! server data take the key lock first and check the pending queue after, so
//! an operation queued while they waited is always seen.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::caches::KeyValueDb;
use crate::error::{Error, Result};
use crate::model::pending_operation::{is_local_id, new_local_id};
use crate::model::{
    PendingMethod, PendingOperation, PendingState, PendingThing, Thing, ThingKey, ThingQuery,
    ThingQueryResult,
};
use crate::transport::{ChangeBatch, ThingClient};

use super::cache_status::CacheStatus;
use super::keys;
use super::lock_table::{AutoLock, LockTable};
use super::pending_table::PendingTable;
use super::stored_query::StoredQuery;
use super::thing_store::{LockRetry, ThingStore, DEFAULT_MAX_ITEMS_IN_MEMORY};

/// Settings shared by every record cache of a vault.
#[derive(Debug, Clone, Copy)]
pub struct RecordCacheSettings {
    pub max_items_in_memory: usize,
    pub lock_retry: LockRetry,
}

impl Default for RecordCacheSettings {
    fn default() -> Self {
        Self {
            max_items_in_memory: DEFAULT_MAX_ITEMS_IN_MEMORY,
            lock_retry: LockRetry::default(),
        }
    }
}

/// Key locks held while writing server data.
#[derive(Default)]
struct ServerWriteLocks {
    held: HashMap<String, AutoLock>,
    /// Ids left alone: pending operations, or a busy key.
    skipped: BTreeSet<String>,
}

impl ServerWriteLocks {
    fn holds(&self, id: &str) -> bool {
        self.held.contains_key(id)
    }
}

pub struct RecordCache {
    db: Arc<dyn KeyValueDb>,
    record_id: String,
    things: ThingStore,
    pending: PendingTable,
    /// Serializes read-modify-write of the status entry.
    status_lock: Mutex<()>,
}

impl RecordCache {
    pub fn new(db: Arc<dyn KeyValueDb>, record_id: &str, settings: RecordCacheSettings) -> Self {
        let locks = Arc::new(LockTable::new());
        Self {
            things: ThingStore::new(db.clone(), record_id, locks, settings.max_items_in_memory)
                .with_lock_retry(settings.lock_retry),
            pending: PendingTable::new(db.clone(), record_id),
            db,
            record_id: record_id.to_string(),
            status_lock: Mutex::new(()),
        }
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn things(&self) -> &ThingStore {
        &self.things
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        self.things.locks()
    }

    pub async fn lock_item(&self, id: &str) -> Result<AutoLock> {
        self.things.lock_item(id).await
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn status(&self) -> Result<CacheStatus> {
        self.get_json(&keys::meta_key(&self.record_id))
            .await
            .map(Option::unwrap_or_default)
    }

    /// Write the status entry if it is missing, so the record is listed by the vault.
    pub async fn ensure_status(&self) -> Result<()> {
        let _guard = self.status_lock.lock().await;
        let key = keys::meta_key(&self.record_id);
        if !self.db.exists(&key).await? {
            self.put_json(key, &CacheStatus::default()).await?;
        }
        Ok(())
    }

    /// Apply `f` to the stored status and persist the result.
    pub async fn update_status<F>(&self, f: F) -> Result<CacheStatus>
    where
        F: FnOnce(&mut CacheStatus) + Send,
    {
        let _guard = self.status_lock.lock().await;
        let mut status = self.status().await?;
        f(&mut status);
        self.put_json(keys::meta_key(&self.record_id), &status).await?;
        Ok(status)
    }

    // =========================================================================
    // Local changes
    // =========================================================================

    /// Record a local update of `thing` and queue it for commit.
    pub async fn track_put(&self, thing: Thing) -> Result<PendingOperation> {
        let lock = self.lock_item(&thing.key.id).await?;
        let mut op = PendingOperation::put(&thing)?;

        let mut txn = self.db.transaction().await?;
        self.things.stage_put(txn.as_mut(), &thing)?;
        self.pending.stage_insert(txn.as_mut(), &mut op).await?;
        txn.commit().await?;

        self.things.note_stored(&op.thing_id, Some(thing));
        drop(lock);
        debug!(record = %self.record_id, id = %op.thing_id, "queued put");
        Ok(op)
    }

    /// Record a locally created thing. A local id is assigned unless it already has one.
    pub async fn track_new(&self, mut thing: Thing) -> Result<(Thing, PendingOperation)> {
        if !is_local_id(&thing.key.id) {
            thing.key = ThingKey::new(new_local_id(), String::new());
        }
        thing.is_placeholder = false;
        let op = self.track_put(thing.clone()).await?;
        Ok((thing, op))
    }

    /// Record a local delete.
    ///
    /// A thing that only exists locally has its queued operations dropped
    /// instead, and `None` is returned.
    pub async fn track_remove(&self, type_id: &str, key: &ThingKey) -> Result<Option<PendingOperation>> {
        let lock = self.lock_item(&key.id).await?;
        let mut txn = self.db.transaction().await?;
        self.things.stage_remove(txn.as_mut(), &key.id);

        let op = if is_local_id(&key.id) {
            for queued in self.pending.for_thing(&key.id).await? {
                self.pending.stage_remove(txn.as_mut(), &queued.identifier);
            }
            None
        } else {
            let mut op = PendingOperation::remove(type_id, key)?;
            self.pending.stage_insert(txn.as_mut(), &mut op).await?;
            Some(op)
        };
        txn.commit().await?;

        self.things.note_stored(&key.id, None);
        drop(lock);
        Ok(op)
    }

    /// Put a failed or conflicted operation back in the queue with a fresh
    /// attempt count. Returns false if it is missing or already queued.
    pub async fn requeue(&self, identifier: &Uuid) -> Result<bool> {
        let Some(op) = self.pending.get(identifier).await? else {
            return Ok(false);
        };
        let _lock = self.lock_item(&op.thing_id).await?;
        let Some(mut op) = self.pending.get(identifier).await? else {
            return Ok(false);
        };
        if op.is_queued() {
            return Ok(false);
        }
        op.state = PendingState::Queued;
        op.version = 0;
        self.pending.put(&op).await?;
        info!(record = %self.record_id, id = %op.thing_id, "requeued pending operation");
        Ok(true)
    }

    /// Drop a failed or conflicted operation without sending it.
    ///
    /// A local-only thing left with no operations is deleted. Otherwise the
    /// thing is marked stale so the next sync restores the server's copy.
    /// Returns false if the operation is missing or still queued.
    pub async fn discard(&self, identifier: &Uuid) -> Result<bool> {
        let Some(op) = self.pending.get(identifier).await? else {
            return Ok(false);
        };
        let _lock = self.lock_item(&op.thing_id).await?;
        let Some(op) = self.pending.get(identifier).await? else {
            return Ok(false);
        };
        if op.is_queued() {
            return Ok(false);
        }

        let remaining = self
            .pending
            .for_thing(&op.thing_id)
            .await?
            .into_iter()
            .filter(|other| other.identifier != op.identifier)
            .count();
        let drop_local = is_local_id(&op.thing_id) && remaining == 0;

        let _guard = self.status_lock.lock().await;
        let mut status = self.status().await?;
        let mut txn = self.db.transaction().await?;
        self.pending.stage_remove(txn.as_mut(), &op.identifier);
        if drop_local {
            self.things.stage_remove(txn.as_mut(), &op.thing_id);
        } else if !is_local_id(&op.thing_id) {
            status.stale_ids.insert(op.thing_id.clone());
            txn.set(keys::meta_key(&self.record_id), serde_json::to_vec(&status)?);
        }
        txn.commit().await?;

        if drop_local {
            self.things.note_stored(&op.thing_id, None);
        }
        info!(record = %self.record_id, id = %op.thing_id, "discarded pending operation");
        Ok(true)
    }

    // =========================================================================
    // Server results
    // =========================================================================

    /// Store a confirmed commit and remove its pending operation atomically.
    ///
    /// For a put the thing is stored under the key the server assigned; later
    /// operations on the same thing are retargeted at that key. Returns the
    /// stored thing, or `None` for a remove.
    pub async fn apply_commit_success(
        &self,
        op: &PendingOperation,
        lock: &AutoLock,
        confirmed_keys: &[ThingKey],
    ) -> Result<Option<Thing>> {
        if !lock.validate_for(self.locks(), &op.thing_id) {
            return Err(Error::LockUnavailable(op.thing_id.clone()));
        }

        let mut txn = self.db.transaction().await?;
        self.pending.stage_remove(txn.as_mut(), &op.identifier);

        let stored = match op.method_name {
            PendingMethod::PutThings => {
                let mut thing = op.thing()?;
                let key = confirmed_keys.first().cloned().ok_or_else(|| {
                    Error::Serialization("put response carried no key".to_string())
                })?;
                thing.key = key.clone();
                thing.is_placeholder = false;
                if key.id != op.thing_id {
                    self.things.stage_remove(txn.as_mut(), &op.thing_id);
                }
                self.things.stage_put(txn.as_mut(), &thing)?;

                for mut later in self.pending.for_thing(&op.thing_id).await? {
                    if later.identifier != op.identifier {
                        later.retarget(&key)?;
                        self.pending.stage_put(txn.as_mut(), &later)?;
                    }
                }
                Some(thing)
            }
            PendingMethod::RemoveThings => {
                self.things.stage_remove(txn.as_mut(), &op.thing_id);
                None
            }
        };
        txn.commit().await?;

        if let Some(thing) = &stored {
            if thing.key.id != op.thing_id {
                self.things.note_stored(&op.thing_id, None);
            }
            self.things.note_stored(&thing.key.id, Some(thing.clone()));
        } else {
            self.things.note_stored(&op.thing_id, None);
        }
        Ok(stored)
    }

    /// Take key locks for writing server data to `ids`.
    ///
    /// Ids with pending operations, and ids still locked after the retry
    /// budget, are skipped rather than failing the whole write. The pending
    /// queue is read again once every lock is held, so an operation queued
    /// between the first read and the lock is never overwritten.
    async fn lock_for_server_write<I>(&self, ids: I) -> Result<ServerWriteLocks>
    where
        I: IntoIterator<Item = String>,
    {
        let pending = self.pending.thing_ids().await?;
        let mut locks = ServerWriteLocks::default();
        for id in ids {
            if locks.held.contains_key(&id) || locks.skipped.contains(&id) {
                continue;
            }
            if pending.contains(&id) {
                locks.skipped.insert(id);
                continue;
            }
            match self.lock_item(&id).await {
                Ok(lock) => {
                    locks.held.insert(id, lock);
                }
                Err(Error::LockUnavailable(_)) => {
                    debug!(record = %self.record_id, id = %id, "thing is busy, skipping server copy");
                    locks.skipped.insert(id);
                }
                Err(e) => return Err(e),
            }
        }

        if !locks.held.is_empty() {
            let pending = self.pending.thing_ids().await?;
            locks.held.retain(|id, _| {
                if pending.contains(id) {
                    locks.skipped.insert(id.clone());
                    false
                } else {
                    true
                }
            });
        }
        Ok(locks)
    }

    /// Store things fetched from the server in one transaction.
    ///
    /// Things with pending local operations or a busy key are skipped, as is
    /// a placeholder that would replace a stored copy of the same version.
    /// Returns the number of things written.
    pub async fn store_server_things(&self, things: Vec<Thing>) -> Result<usize> {
        let locks = self
            .lock_for_server_write(things.iter().map(|t| t.key.id.clone()).collect::<Vec<String>>())
            .await?;

        let mut txn = self.db.transaction().await?;
        let mut written: HashMap<String, Thing> = HashMap::new();
        for thing in things {
            if !locks.holds(&thing.key.id) {
                continue;
            }
            if thing.is_placeholder {
                let current = match written.get(&thing.key.id) {
                    Some(staged) => Some(staged.key.clone()),
                    None => self.things.get_item(&thing.key.id).await?.map(|t| t.key),
                };
                if current.as_ref() == Some(&thing.key) {
                    continue;
                }
            }
            self.things.stage_put(txn.as_mut(), &thing)?;
            written.insert(thing.key.id.clone(), thing);
        }
        if written.is_empty() {
            return Ok(0);
        }
        txn.commit().await?;

        let count = written.len();
        for (id, thing) in written {
            self.things.note_stored(&id, Some(thing));
        }
        drop(locks);
        Ok(count)
    }

    /// Store one thing fetched from the server. Returns true if it was written.
    pub async fn store_server_thing(&self, thing: Thing) -> Result<bool> {
        Ok(self.store_server_things(vec![thing]).await? == 1)
    }

    /// Apply one page of server changes and advance the watermark, atomically.
    ///
    /// Things with pending local operations or a busy key are left alone and
    /// marked stale, since the watermark moves past their change. Returns the
    /// number of things written or removed.
    pub async fn apply_change_batch(&self, batch: &ChangeBatch) -> Result<usize> {
        let ids = batch
            .things
            .iter()
            .map(|t| t.key.id.clone())
            .chain(batch.removed.iter().cloned())
            .collect::<Vec<String>>();
        let locks = self.lock_for_server_write(ids).await?;

        let mut txn = self.db.transaction().await?;
        let mut written: HashMap<String, Thing> = HashMap::new();
        let mut removed: Vec<String> = Vec::new();
        for thing in &batch.things {
            if locks.holds(&thing.key.id) {
                self.things.stage_put(txn.as_mut(), thing)?;
                written.insert(thing.key.id.clone(), thing.clone());
            }
        }
        for id in &batch.removed {
            if locks.holds(id) && !written.contains_key(id) {
                self.things.stage_remove(txn.as_mut(), id);
                removed.push(id.clone());
            }
        }

        let _guard = self.status_lock.lock().await;
        let mut status = self.status().await?;
        status.advance_watermark(batch.batch_sequence_number);
        status.note_server_sequence_number(batch.latest_sequence_number);
        for id in written.keys().chain(removed.iter()) {
            status.clear_stale(id);
        }
        status.stale_ids.extend(locks.skipped.iter().cloned());
        txn.set(keys::meta_key(&self.record_id), serde_json::to_vec(&status)?);
        txn.commit().await?;

        if !locks.skipped.is_empty() {
            debug!(record = %self.record_id, skipped = locks.skipped.len(), "left changes for pending things");
        }
        let count = written.len() + removed.len();
        for (id, thing) in written {
            self.things.note_stored(&id, Some(thing));
        }
        for id in removed {
            self.things.note_stored(&id, None);
        }
        drop(locks);
        Ok(count)
    }

    /// Stale things whose pending operations are all gone, ready to be fetched.
    pub async fn stale_ids_ready_for_refresh(&self) -> Result<Vec<String>> {
        let stale = self.status().await?.stale_ids;
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        let pending = self.pending.thing_ids().await?;
        Ok(stale.into_iter().filter(|id| !pending.contains(id)).collect())
    }

    /// Store the server's current copies of stale things `ids`.
    ///
    /// An id missing from `things` was deleted on the server and is removed.
    /// Ids written or removed stop being stale. Returns the number of things
    /// written or removed.
    pub async fn apply_refreshed_things(&self, ids: &[String], things: Vec<Thing>) -> Result<usize> {
        let locks = self.lock_for_server_write(ids.iter().cloned().collect::<Vec<String>>()).await?;

        let mut txn = self.db.transaction().await?;
        let mut written: HashMap<String, Thing> = HashMap::new();
        for thing in things {
            if locks.holds(&thing.key.id) {
                self.things.stage_put(txn.as_mut(), &thing)?;
                written.insert(thing.key.id.clone(), thing);
            }
        }
        let removed: Vec<String> = ids
            .iter()
            .filter(|id| locks.holds(id) && !written.contains_key(*id))
            .cloned()
            .collect();
        for id in &removed {
            self.things.stage_remove(txn.as_mut(), id);
        }

        let _guard = self.status_lock.lock().await;
        let mut status = self.status().await?;
        for id in locks.held.keys() {
            status.clear_stale(id);
        }
        txn.set(keys::meta_key(&self.record_id), serde_json::to_vec(&status)?);
        txn.commit().await?;

        let count = written.len() + removed.len();
        for (id, thing) in written {
            self.things.note_stored(&id, Some(thing));
        }
        for id in removed {
            self.things.note_stored(&id, None);
        }
        drop(locks);
        info!(record = %self.record_id, count, "refreshed stale things");
        Ok(count)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Answer `query` from the cache, or `None` if the cache cannot be trusted
    /// to be complete and the caller should ask the server.
    pub async fn cached_result_for_query(&self, query: &ThingQuery) -> Result<Option<ThingQueryResult>> {
        if !self.status().await?.is_consistent() {
            return Ok(None);
        }
        let mut matching: Vec<Thing> = self
            .things
            .all_items()
            .await?
            .into_iter()
            .filter(|t| query.matches(t))
            .collect();
        matching.sort_by(|a, b| {
            b.effective_date
                .cmp(&a.effective_date)
                .then_with(|| a.key.id.cmp(&b.key.id))
        });
        if let Some(max) = query.max_results {
            matching.truncate(max);
        }

        let mut result = ThingQueryResult {
            name: query.name.clone(),
            ..Default::default()
        };
        for thing in matching {
            if thing.is_placeholder {
                result.pending_keys.push(PendingThing {
                    key: thing.key.clone(),
                    type_id: thing.type_id.clone(),
                    effective_date: thing.effective_date,
                });
            } else {
                result.things.push(thing);
            }
        }
        Ok(Some(result))
    }

    pub async fn load_stored_query(&self, name: &str) -> Result<Option<StoredQuery>> {
        self.get_json(&keys::query_key(&self.record_id, name)).await
    }

    pub async fn save_stored_query(&self, query: &StoredQuery) -> Result<()> {
        self.put_json(keys::query_key(&self.record_id, query.name()), query)
            .await
    }

    /// Load, refresh if stale, and save the stored query named `query.name`.
    pub async fn synchronize_stored_query(
        &self,
        client: &ThingClient,
        query: ThingQuery,
        max_age: chrono::Duration,
    ) -> Result<StoredQuery> {
        let mut stored = self
            .load_stored_query(&query.name)
            .await?
            .filter(|stored| stored.query == query)
            .unwrap_or_else(|| StoredQuery::new(query));
        if stored
            .synchronize(client, &self.record_id, max_age)
            .await?
            .is_some()
        {
            self.save_stored_query(&stored).await?;
        }
        Ok(stored)
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub async fn save_view_data<T: Serialize + Sync>(&self, name: &str, data: &T) -> Result<()> {
        self.put_json(keys::view_key(&self.record_id, name), data).await
    }

    pub async fn load_view_data<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.get_json(&keys::view_key(&self.record_id, name)).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Delete every entry of this record, including pending operations.
    pub async fn delete_all(&self) -> Result<usize> {
        let _guard = self.status_lock.lock().await;
        let entries = self
            .db
            .list_entries(&keys::record_prefix(&self.record_id))
            .await?;
        let mut txn = self.db.transaction().await?;
        for entry in &entries {
            txn.del(entry.key.clone());
        }
        txn.commit().await?;
        self.things.clear_cache();
        info!(record = %self.record_id, entries = entries.len(), "deleted record cache");
        Ok(entries.len())
    }

    /// Drop cached things and sync state but keep pending operations, so
    /// unsaved local work survives. The next sync starts from scratch.
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.status_lock.lock().await;
        let mut txn = self.db.transaction().await?;
        for prefix in [
            keys::things_prefix(&self.record_id),
            keys::view_key(&self.record_id, ""),
            keys::query_key(&self.record_id, ""),
        ] {
            for entry in self.db.list_entries(&prefix).await? {
                txn.del(entry.key);
            }
        }
        txn.set(
            keys::meta_key(&self.record_id),
            serde_json::to_vec(&CacheStatus::default())?,
        );
        txn.commit().await?;
        self.things.clear_cache();
        Ok(())
    }

    // =========================================================================
    // Encoding helpers
    // =========================================================================

    async fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.db.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize + Sync + ?Sized>(&self, key: Vec<u8>, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let mut txn = self.db.transaction().await?;
        txn.set(key, bytes);
        txn.commit().await?;
        Ok(())
    }
}

impl std::fmt::Debug for RecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCache")
            .field("record_id", &self.record_id)
            .finish()
    }
}
