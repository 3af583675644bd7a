//! Queue of pending operations for one record.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::caches::{KeyValueDb, KeyValueDbTransaction};
use crate::error::{Error, Result};
use crate::model::PendingOperation;

use super::keys;

/// Pending operations, persisted under `rec/{record}/pending/{identifier}`.
pub struct PendingTable {
    db: Arc<dyn KeyValueDb>,
    record_id: String,
    /// Next queue position; loaded from the stored operations on first insert.
    next_sequence: Mutex<Option<u64>>,
}

impl PendingTable {
    pub fn new(db: Arc<dyn KeyValueDb>, record_id: impl Into<String>) -> Self {
        Self {
            db,
            record_id: record_id.into(),
            next_sequence: Mutex::new(None),
        }
    }

    /// All operations in queue order.
    ///
    /// Operations stored without a queue position sort first, by request date.
    pub async fn list(&self) -> Result<Vec<PendingOperation>> {
        let entries = self
            .db
            .list_entries(&keys::pending_prefix(&self.record_id))
            .await?;
        let mut ops = entries
            .iter()
            .map(|e| serde_json::from_slice(&e.value).map_err(Error::from))
            .collect::<Result<Vec<PendingOperation>>>()?;
        ops.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.original_request_date.cmp(&b.original_request_date))
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        Ok(ops)
    }

    pub async fn get(&self, identifier: &Uuid) -> Result<Option<PendingOperation>> {
        let key = keys::pending_key(&self.record_id, &identifier.to_string());
        match self.db.get(&key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Operations targeting thing `id`, in queue order.
    pub async fn for_thing(&self, id: &str) -> Result<Vec<PendingOperation>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|op| op.thing_id == id)
            .collect())
    }

    pub async fn has_pending_for_type(&self, type_id: &str) -> Result<bool> {
        Ok(self.type_ids().await?.contains(type_id))
    }

    /// Ids of every thing with at least one operation, in any state.
    pub async fn thing_ids(&self) -> Result<HashSet<String>> {
        Ok(self.list().await?.into_iter().map(|op| op.thing_id).collect())
    }

    /// Type ids of every thing with at least one operation, in any state.
    pub async fn type_ids(&self) -> Result<HashSet<String>> {
        Ok(self.list().await?.into_iter().map(|op| op.type_id).collect())
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    /// Insert or overwrite `op`, keeping its queue position.
    pub async fn put(&self, op: &PendingOperation) -> Result<()> {
        let mut txn = self.db.transaction().await?;
        self.stage_put(txn.as_mut(), op)?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn remove(&self, identifier: &Uuid) -> Result<()> {
        let mut txn = self.db.transaction().await?;
        self.stage_remove(txn.as_mut(), identifier);
        txn.commit().await?;
        Ok(())
    }

    /// Give `op` the next queue position and add it to a transaction owned by
    /// the caller.
    ///
    /// Positions only grow, so operations queued later always sort later even
    /// when their request dates tie.
    pub(crate) async fn stage_insert(
        &self,
        txn: &mut (dyn KeyValueDbTransaction + Send),
        op: &mut PendingOperation,
    ) -> Result<()> {
        let mut next = self.next_sequence.lock().await;
        let sequence = match *next {
            Some(sequence) => sequence,
            None => {
                self.list()
                    .await?
                    .iter()
                    .map(|op| op.sequence)
                    .max()
                    .unwrap_or(0)
                    + 1
            }
        };
        op.sequence = sequence;
        *next = Some(sequence + 1);
        self.stage_put(txn, op)
    }

    pub(crate) fn stage_put(
        &self,
        txn: &mut (dyn KeyValueDbTransaction + Send),
        op: &PendingOperation,
    ) -> Result<()> {
        let key = keys::pending_key(&self.record_id, &op.identifier.to_string());
        txn.set(key, serde_json::to_vec(op)?);
        Ok(())
    }

    pub(crate) fn stage_remove(&self, txn: &mut (dyn KeyValueDbTransaction + Send), identifier: &Uuid) {
        txn.del(keys::pending_key(&self.record_id, &identifier.to_string()));
    }
}
