//! Owner of the key-value database and the record caches inside it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::caches::{KeyValueDb, LmdbKeyValueDb, MemoryKeyValueDb};
use crate::error::Result;

use super::keys;
use super::record_cache::{RecordCache, RecordCacheSettings};

pub struct LocalVault {
    db: Arc<dyn KeyValueDb>,
    settings: RecordCacheSettings,
    records: Mutex<HashMap<String, Arc<RecordCache>>>,
}

impl LocalVault {
    pub fn new(db: Arc<dyn KeyValueDb>, settings: RecordCacheSettings) -> Self {
        Self {
            db,
            settings,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or create) an LMDB-backed vault at `path`.
    pub fn open(path: &Path, settings: RecordCacheSettings) -> Result<Self> {
        let db = LmdbKeyValueDb::new(path)?;
        Ok(Self::new(Arc::new(db), settings))
    }

    /// A vault that lives only as long as the process.
    pub fn in_memory(settings: RecordCacheSettings) -> Self {
        Self::new(Arc::new(MemoryKeyValueDb::new()), settings)
    }

    pub fn db(&self) -> &Arc<dyn KeyValueDb> {
        &self.db
    }

    /// The cache for `record_id`. Repeated calls return the same instance.
    pub fn record_cache(&self, record_id: &str) -> Arc<RecordCache> {
        let mut records = self.records.lock().unwrap();
        records
            .entry(record_id.to_string())
            .or_insert_with(|| Arc::new(RecordCache::new(self.db.clone(), record_id, self.settings)))
            .clone()
    }

    /// Make sure a cache exists for each record id.
    pub async fn setup_cache_for_record_ids(&self, record_ids: &[String]) -> Result<Vec<Arc<RecordCache>>> {
        let mut caches = Vec::with_capacity(record_ids.len());
        for record_id in record_ids {
            let cache = self.record_cache(record_id);
            cache.ensure_status().await?;
            caches.push(cache);
        }
        Ok(caches)
    }

    /// Ids of every record with a cache in the database, sorted.
    pub async fn cached_record_ids(&self) -> Result<Vec<String>> {
        let entries = self.db.list_entries(keys::RECORDS_PREFIX.as_bytes()).await?;
        Ok(entries
            .iter()
            .filter_map(|e| keys::record_id_from_meta_key(&e.key).map(str::to_string))
            .collect())
    }

    pub async fn delete_cache_for_record(&self, record_id: &str) -> Result<()> {
        let cache = self.record_cache(record_id);
        cache.delete_all().await?;
        self.records.lock().unwrap().remove(record_id);
        Ok(())
    }

    /// Delete every record cache.
    pub async fn reset(&self) -> Result<()> {
        let record_ids = self.cached_record_ids().await?;
        for record_id in &record_ids {
            self.delete_cache_for_record(record_id).await?;
        }
        self.records.lock().unwrap().clear();
        info!(records = record_ids.len(), "reset local vault");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_caches_are_memoized_and_listed() {
        let temp_dir = TempDir::new().unwrap();
        let vault = LocalVault::open(temp_dir.path(), RecordCacheSettings::default()).unwrap();

        let a = vault.record_cache("a");
        assert!(Arc::ptr_eq(&a, &vault.record_cache("a")));
        assert!(vault.cached_record_ids().await.unwrap().is_empty());

        vault
            .setup_cache_for_record_ids(&["b".to_string(), "a".to_string()])
            .await
            .unwrap();
        assert_eq!(vault.cached_record_ids().await.unwrap(), vec!["a", "b"]);

        vault.delete_cache_for_record("a").await.unwrap();
        assert_eq!(vault.cached_record_ids().await.unwrap(), vec!["b"]);

        vault.reset().await.unwrap();
        assert!(vault.cached_record_ids().await.unwrap().is_empty());
    }
}
