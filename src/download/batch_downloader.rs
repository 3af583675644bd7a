//! Download of many things in bounded batches.
//!
//! Keys are collected first, then split into batches of at most
//! `batch_size`. Each batch is one server call; batches run concurrently and
//! independently, so one failing batch does not undo or stop the others.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::ThingKey;
use crate::store::RecordCache;
use crate::transport::ThingClient;
use crate::util::{CancelSignal, Task};
use crate::view::TypeView;

/// Largest number of things the service returns in one call.
pub const DEFAULT_BATCH_SIZE: usize = 250;

/// Result of a finished download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Things written to the store.
    pub downloaded: usize,
    /// Number of batches the keys were split into.
    pub batches: usize,
    /// Indexes of batches that failed.
    pub failed_batches: Vec<usize>,
    /// Batches skipped because the download was cancelled first.
    pub not_started: usize,
    /// Error of the lowest-index failed batch.
    pub error: Option<Error>,
}

enum BatchResult {
    Done(usize),
    Failed(Error),
    NotStarted,
}

pub struct BatchDownloader {
    cache: Arc<RecordCache>,
    client: ThingClient,
    batch_size: usize,
    keys: Vec<ThingKey>,
    /// Position of each id in `keys`.
    positions: HashMap<String, usize>,
}

impl BatchDownloader {
    pub fn new(cache: Arc<RecordCache>, client: ThingClient) -> Self {
        Self {
            cache,
            client,
            batch_size: DEFAULT_BATCH_SIZE,
            keys: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Queue `key` for download. A key already queued for the same id is replaced.
    pub fn add_key_to_download(&mut self, key: ThingKey) {
        match self.positions.get(&key.id) {
            Some(&index) => self.keys[index] = key,
            None => {
                self.positions.insert(key.id.clone(), self.keys.len());
                self.keys.push(key);
            }
        }
    }

    /// Queue `key` unless the store already holds a full copy of that version.
    pub async fn add_key_for_thing_to_ensure_downloaded(&mut self, key: ThingKey) -> Result<bool> {
        let stored = self.cache.things().get_item(&key.id).await?;
        if stored.is_some_and(|thing| thing.is_full_copy_of(&key)) {
            return Ok(false);
        }
        self.add_key_to_download(key);
        Ok(true)
    }

    /// Queue the keys in `range` of `view` that are not stored in full.
    pub async fn add_range_of_keys_to_ensure_downloaded(
        &mut self,
        range: Range<usize>,
        view: &TypeView,
    ) -> Result<usize> {
        let keys = view.keys_needing_download(range).await?;
        let count = keys.len();
        for key in keys {
            self.add_key_to_download(key);
        }
        Ok(count)
    }

    /// Start the download. Returns `None` if no keys were queued.
    pub fn download(self) -> Option<Task<DownloadOutcome>> {
        if self.keys.is_empty() {
            return None;
        }
        Some(Task::spawn(move |cancel| self.run(cancel)))
    }

    async fn run(self, cancel: Arc<CancelSignal>) -> DownloadOutcome {
        let batches: Vec<Vec<ThingKey>> = self
            .keys
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        info!(
            record = %self.cache.record_id(),
            keys = self.keys.len(),
            batches = batches.len(),
            "starting download"
        );

        let results = join_all(
            batches
                .iter()
                .enumerate()
                .map(|(index, keys)| self.download_batch(index, keys, &cancel)),
        )
        .await;

        let mut outcome = DownloadOutcome {
            batches: batches.len(),
            ..Default::default()
        };
        for (index, result) in results.into_iter().enumerate() {
            match result {
                BatchResult::Done(count) => outcome.downloaded += count,
                BatchResult::NotStarted => outcome.not_started += 1,
                BatchResult::Failed(e) => {
                    outcome.failed_batches.push(index);
                    if outcome.error.is_none() {
                        outcome.error = Some(e);
                    }
                }
            }
        }
        outcome
    }

    async fn download_batch(&self, index: usize, keys: &[ThingKey], cancel: &CancelSignal) -> BatchResult {
        if cancel.is_cancelled() {
            return BatchResult::NotStarted;
        }
        debug!(record = %self.cache.record_id(), batch = index, keys = keys.len(), "downloading batch");

        let mut things = match self.client.get_things_by_keys(self.cache.record_id(), keys).await {
            Ok(things) => things,
            Err(e) => {
                warn!(record = %self.cache.record_id(), batch = index, error = %e, "batch failed");
                return BatchResult::Failed(e);
            }
        };

        // Apply in request order
        let order: HashMap<&str, usize> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| (key.id.as_str(), i))
            .collect();
        things.sort_by_key(|thing| order.get(thing.id()).copied().unwrap_or(usize::MAX));

        // Things with pending changes or a busy key are skipped, not failed
        match self.cache.store_server_things(things).await {
            Ok(stored) => BatchResult::Done(stored),
            Err(e) => {
                warn!(record = %self.cache.record_id(), batch = index, error = %e, "storing batch failed");
                BatchResult::Failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Thing, ThingQuery};
    use crate::store::{LocalVault, LockRetry, RecordCacheSettings};
    use crate::view::TypeView;
    use std::time::Duration;
    use crate::transport::{Fault, MemoryThingServer, MethodName, ServerStatusCode};
    use chrono::Utc;

    fn thing(id: &str) -> Thing {
        Thing::new(ThingKey::new(id, "1"), "weight", Utc::now(), "{}")
    }

    fn setup(count: usize) -> (Arc<MemoryThingServer>, Arc<RecordCache>) {
        let server = Arc::new(MemoryThingServer::new());
        for i in 0..count {
            server.insert_thing("r1", thing(&format!("t{:03}", i)));
        }
        let vault = LocalVault::in_memory(RecordCacheSettings::default());
        (server, vault.record_cache("r1"))
    }

    #[tokio::test]
    async fn test_empty_download_is_none() {
        let (server, cache) = setup(0);
        let downloader = BatchDownloader::new(cache, ThingClient::new(server));
        assert!(downloader.download().is_none());
    }

    #[tokio::test]
    async fn test_failed_batch_is_isolated() {
        let (server, cache) = setup(600);
        // Fail whichever request carries the first key of the second batch
        server.set_fault(|request| {
            let ids = &request.parameters["queries"][0]["thing_ids"];
            let second_batch = ids
                .as_array()
                .is_some_and(|ids| ids.iter().any(|id| id == "t250"));
            second_batch.then_some(Fault::Status(ServerStatusCode::RequestTimedOut))
        });

        let mut downloader = BatchDownloader::new(cache.clone(), ThingClient::new(server.clone()));
        for i in 0..600 {
            downloader.add_key_to_download(ThingKey::new(format!("t{:03}", i), "1"));
        }
        let outcome = downloader.download().unwrap().wait().await.unwrap();

        assert_eq!(outcome.batches, 3);
        assert_eq!(server.call_count(MethodName::GetThings), 3);
        assert_eq!(outcome.downloaded, 350);
        assert_eq!(outcome.failed_batches, vec![1]);
        assert!(outcome.error.as_ref().is_some_and(|e| e.is_transient()));

        assert!(cache.things().exists_item("t000").await.unwrap());
        assert!(!cache.things().exists_item("t300").await.unwrap());
        assert!(cache.things().exists_item("t599").await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_downloaded_skips_full_copies() {
        let (server, cache) = setup(2);
        cache.store_server_thing(thing("t000")).await.unwrap();

        let mut downloader = BatchDownloader::new(cache.clone(), ThingClient::new(server));
        assert!(!downloader
            .add_key_for_thing_to_ensure_downloaded(ThingKey::new("t000", "1"))
            .await
            .unwrap());
        assert!(downloader
            .add_key_for_thing_to_ensure_downloaded(ThingKey::new("t001", "1"))
            .await
            .unwrap());
        downloader.add_key_to_download(ThingKey::new("t001", "1"));
        assert_eq!(downloader.len(), 1);

        let outcome = downloader.download().unwrap().wait().await.unwrap();
        assert_eq!(outcome.downloaded, 1);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_busy_thing_does_not_fail_batch() {
        let server = Arc::new(MemoryThingServer::new());
        for id in ["t000", "t001", "t002"] {
            server.insert_thing("r1", thing(id));
        }
        let vault = LocalVault::in_memory(RecordCacheSettings {
            lock_retry: LockRetry {
                attempts: 2,
                delay: Duration::from_millis(1),
            },
            ..Default::default()
        });
        let cache = vault.record_cache("r1");
        let held = cache.lock_item("t001").await.unwrap();

        let mut downloader = BatchDownloader::new(cache.clone(), ThingClient::new(server));
        for id in ["t000", "t001", "t002"] {
            downloader.add_key_to_download(ThingKey::new(id, "1"));
        }
        let outcome = downloader.download().unwrap().wait().await.unwrap();
        drop(held);

        assert_eq!(outcome.downloaded, 2);
        assert!(outcome.failed_batches.is_empty());
        assert!(outcome.error.is_none());
        assert!(cache.things().exists_item("t002").await.unwrap());
        assert!(!cache.things().exists_item("t001").await.unwrap());
    }

    #[tokio::test]
    async fn test_range_of_view_keys_is_downloaded() {
        let (server, cache) = setup(4);
        let view = TypeView::new(cache.clone(), "weights", "weight");
        let client = ThingClient::new(server.clone());
        let results = client
            .query("r1", vec![ThingQuery::for_type("weights", "weight")])
            .await
            .unwrap();
        view.replace_keys(&results[0]).await.unwrap();
        assert_eq!(view.len(), 4);
        let first = view.key_at(0).unwrap();
        cache.store_server_thing(thing(&first.id)).await.unwrap();

        let mut downloader = BatchDownloader::new(cache.clone(), client);
        assert_eq!(
            downloader
                .add_range_of_keys_to_ensure_downloaded(0..3, &view)
                .await
                .unwrap(),
            2
        );
        // Out-of-range ends are clamped to the view
        assert_eq!(
            downloader
                .add_range_of_keys_to_ensure_downloaded(2..10, &view)
                .await
                .unwrap(),
            2
        );
        assert_eq!(downloader.len(), 3);

        let outcome = downloader.download().unwrap().wait().await.unwrap();
        assert_eq!(outcome.downloaded, 3);
        assert!(view.keys_needing_download(0..4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_download_starts_no_batches() {
        let (server, cache) = setup(10);
        let mut downloader =
            BatchDownloader::new(cache, ThingClient::new(server.clone())).with_batch_size(5);
        for i in 0..10 {
            downloader.add_key_to_download(ThingKey::new(format!("t{:03}", i), "1"));
        }
        let task = Task::spawn(|cancel| async move {
            cancel.cancel();
            downloader.run(cancel).await
        });
        let outcome = task.wait().await.unwrap();
        assert_eq!(outcome.not_started, 2);
        assert_eq!(outcome.downloaded, 0);
        assert_eq!(server.call_count(MethodName::GetThings), 0);
    }
}
