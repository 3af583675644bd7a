//! In-memory key-value database.
//!
//! Used for ephemeral caches and in tests. Commits take a single write lock,
//! so they are atomic with respect to readers.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::key_value_db::{
    find_pending, KeyValueDb, KeyValueDbTransaction, KeyValueEntry, Result, WriteOp,
};

/// An in-memory implementation of [`KeyValueDb`].
#[derive(Default)]
pub struct MemoryKeyValueDb {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKeyValueDb {
    /// Create a new empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueDb for MemoryKeyValueDb {
    async fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.read().unwrap().contains_key(key))
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    async fn list_entries(&self, prefix: &[u8]) -> Result<Vec<KeyValueEntry>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValueEntry::new(k.clone(), v.clone()))
            .collect())
    }

    async fn transaction(&self) -> Result<Box<dyn KeyValueDbTransaction + Send>> {
        Ok(Box::new(MemoryTransaction {
            entries: self.entries.clone(),
            pending: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    pending: Vec<WriteOp>,
}

#[async_trait]
impl KeyValueDbTransaction for MemoryTransaction {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(op) = find_pending(&self.pending, key) {
            return Ok(match op {
                WriteOp::Set { value, .. } => Some(value.clone()),
                WriteOp::Del { .. } => None,
            });
        }
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    fn set(&mut self, key: Vec<u8>, val: Vec<u8>) {
        self.pending.push(WriteOp::Set { key, value: val });
    }

    fn del(&mut self, key: Vec<u8>) {
        self.pending.push(WriteOp::Del { key });
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        for op in self.pending {
            match op {
                WriteOp::Set { key, value } => {
                    entries.insert(key, value);
                }
                WriteOp::Del { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_scan_stops_at_prefix_end() {
        let db = MemoryKeyValueDb::new();
        let mut txn = db.transaction().await.unwrap();
        txn.set(b"a/1".to_vec(), b"x".to_vec());
        txn.set(b"a/2".to_vec(), b"y".to_vec());
        txn.set(b"b/1".to_vec(), b"z".to_vec());
        txn.commit().await.unwrap();

        let entries = db.list_entries(b"a/").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(db.len(), 3);
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_is_discarded() {
        let db = MemoryKeyValueDb::new();
        {
            let mut txn = db.transaction().await.unwrap();
            txn.set(b"k".to_vec(), b"v".to_vec());
        }
        assert!(!db.exists(b"k").await.unwrap());
    }
}
