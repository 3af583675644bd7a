//! LMDB-based key-value database implementation.
//!
//! Uses the heed crate to provide a persistent key-value store backed by LMDB.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use super::key_value_db::{
    find_pending, KeyValueDb, KeyValueDbError, KeyValueDbTransaction, KeyValueEntry, Result,
    WriteOp,
};

fn db_err(e: impl std::fmt::Display) -> KeyValueDbError {
    KeyValueDbError::Database(e.to_string())
}

// =============================================================================
// LmdbKeyValueDb
// =============================================================================

/// An LMDB-backed key-value database.
///
/// Blocking LMDB calls run on the tokio blocking pool.
pub struct LmdbKeyValueDb {
    env: Arc<Env>,
    db: Database<Bytes, Bytes>,
}

impl LmdbKeyValueDb {
    /// Create a new LMDB database at the given path.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(1024 * 1024 * 1024) // 1GB max size
                .max_dbs(1)
                .open(path)
                .map_err(db_err)?
        };

        let mut wtxn = env.write_txn().map_err(db_err)?;
        let db: Database<Bytes, Bytes> = env.create_database(&mut wtxn, None).map_err(db_err)?;
        wtxn.commit().map_err(db_err)?;

        Ok(Self {
            env: Arc::new(env),
            db,
        })
    }

    fn read_value(env: &Env, db: Database<Bytes, Bytes>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let rtxn = env.read_txn().map_err(db_err)?;
        let value = db.get(&rtxn, key).map_err(db_err)?.map(|v| v.to_vec());
        Ok(value)
    }
}

#[async_trait]
impl KeyValueDb for LmdbKeyValueDb {
    async fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let env = self.env.clone();
        let db = self.db;
        let key = key.to_vec();

        tokio::task::spawn_blocking(move || Self::read_value(&env, db, &key))
            .await
            .map_err(db_err)?
    }

    async fn list_entries(&self, prefix: &[u8]) -> Result<Vec<KeyValueEntry>> {
        let env = self.env.clone();
        let db = self.db;
        let prefix = prefix.to_vec();

        tokio::task::spawn_blocking(move || {
            let rtxn = env.read_txn().map_err(db_err)?;
            let mut entries = Vec::new();
            for item in db.prefix_iter(&rtxn, &prefix).map_err(db_err)? {
                let (key, value) = item.map_err(db_err)?;
                entries.push(KeyValueEntry::new(key.to_vec(), value.to_vec()));
            }
            Ok(entries)
        })
        .await
        .map_err(db_err)?
    }

    async fn transaction(&self) -> Result<Box<dyn KeyValueDbTransaction + Send>> {
        Ok(Box::new(LmdbTransaction {
            env: self.env.clone(),
            db: self.db,
            pending: Vec::new(),
        }))
    }
}

// =============================================================================
// LmdbTransaction
// =============================================================================

struct LmdbTransaction {
    env: Arc<Env>,
    db: Database<Bytes, Bytes>,
    pending: Vec<WriteOp>,
}

#[async_trait]
impl KeyValueDbTransaction for LmdbTransaction {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(op) = find_pending(&self.pending, key) {
            return Ok(match op {
                WriteOp::Set { value, .. } => Some(value.clone()),
                WriteOp::Del { .. } => None,
            });
        }

        let env = self.env.clone();
        let db = self.db;
        let key = key.to_vec();

        tokio::task::spawn_blocking(move || LmdbKeyValueDb::read_value(&env, db, &key))
            .await
            .map_err(db_err)?
    }

    fn set(&mut self, key: Vec<u8>, val: Vec<u8>) {
        self.pending.push(WriteOp::Set { key, value: val });
    }

    fn del(&mut self, key: Vec<u8>) {
        self.pending.push(WriteOp::Del { key });
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let env = self.env;
        let db = self.db;
        let pending = self.pending;

        tokio::task::spawn_blocking(move || {
            let mut wtxn = env.write_txn().map_err(db_err)?;

            for op in pending {
                match op {
                    WriteOp::Set { key, value } => {
                        db.put(&mut wtxn, &key, &value).map_err(db_err)?;
                    }
                    WriteOp::Del { key } => {
                        db.delete(&mut wtxn, &key).map_err(db_err)?;
                    }
                }
            }

            wtxn.commit().map_err(db_err)?;
            Ok(())
        })
        .await
        .map_err(db_err)?
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let db = LmdbKeyValueDb::new(temp_dir.path()).unwrap();

        assert!(!db.exists(b"key1").await.unwrap());
        assert!(db.get(b"key1").await.unwrap().is_none());

        let mut txn = db.transaction().await.unwrap();
        txn.set(b"key1".to_vec(), b"value1".to_vec());
        txn.commit().await.unwrap();

        assert!(db.exists(b"key1").await.unwrap());
        assert_eq!(db.get(b"key1").await.unwrap(), Some(b"value1".to_vec()));
    }

    #[tokio::test]
    async fn test_transaction_sees_own_writes() {
        let temp_dir = TempDir::new().unwrap();
        let db = LmdbKeyValueDb::new(temp_dir.path()).unwrap();

        let mut txn = db.transaction().await.unwrap();
        txn.set(b"key1".to_vec(), b"value1".to_vec());
        txn.set(b"key2".to_vec(), b"value2".to_vec());
        assert_eq!(txn.get(b"key1").await.unwrap(), Some(b"value1".to_vec()));
        txn.del(b"key1".to_vec());
        assert_eq!(txn.get(b"key1").await.unwrap(), None);

        // Nothing is visible before commit
        assert!(db.get(b"key2").await.unwrap().is_none());

        txn.commit().await.unwrap();

        assert!(db.get(b"key1").await.unwrap().is_none());
        assert_eq!(db.get(b"key2").await.unwrap(), Some(b"value2".to_vec()));
    }

    #[tokio::test]
    async fn test_list_entries_by_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let db = LmdbKeyValueDb::new(temp_dir.path()).unwrap();

        let mut txn = db.transaction().await.unwrap();
        txn.set(b"rec/a/thing/2".to_vec(), b"two".to_vec());
        txn.set(b"rec/a/thing/1".to_vec(), b"one".to_vec());
        txn.set(b"rec/b/thing/1".to_vec(), b"other".to_vec());
        txn.commit().await.unwrap();

        let entries = db.list_entries(b"rec/a/thing/").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key_suffix(b"rec/a/thing/"), Some("1"));
        assert_eq!(entries[1].value, b"two".to_vec());
    }
}
