//! Record-level synchronization with the server.
//!
//! A sync of one record commits queued local changes first, then pulls the
//! server's changes in pages ordered by sequence number. Each page is applied
//! together with the watermark advance in one transaction, so an interrupted
//! pull resumes from the last applied page.
//!
//! Changes to things with pending operations are passed over by the pull and
//! the things are marked stale. Once their operations are gone, the current
//! server copies are fetched by id at the end of a later sync.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::commit::{CommitErrorHandler, CommitReport, CommitScheduler, DEFAULT_RETRY_DELAY};
use crate::download::DEFAULT_BATCH_SIZE;
use crate::error::{Error, Result};
use crate::model::ThingKey;
use crate::store::{LocalVault, RecordCache};
use crate::transport::ThingClient;
use crate::util::Task;

/// Parameters of a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Type ids kept in the cache. Empty disables caching and makes sync a no-op.
    pub type_ids: Vec<String>,
    /// Largest number of changes requested per page.
    pub batch_size: usize,
    pub error_handler: CommitErrorHandler,
    /// Pause before resubmitting after a transient commit failure.
    pub retry_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            type_ids: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            error_handler: CommitErrorHandler::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Things committed, written or removed.
    pub synced_item_count: usize,
    /// One report per commit pass, for updating views of committed things.
    pub commits: Vec<CommitReport>,
    /// First error met. Work done before it stays applied.
    pub error: Option<Error>,
}

impl SyncReport {
    fn merge(&mut self, other: SyncReport) {
        self.synced_item_count += other.synced_item_count;
        self.commits.extend(other.commits);
        if self.error.is_none() {
            self.error = other.error;
        }
    }

    fn note_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// Drives commits and change pulls for every record in a vault.
#[derive(Clone)]
pub struct CacheSynchronizer {
    vault: Arc<LocalVault>,
    client: ThingClient,
    /// One scheduler per record so concurrent syncs share its running flag.
    schedulers: Arc<Mutex<HashMap<String, CommitScheduler>>>,
}

impl CacheSynchronizer {
    pub fn new(vault: Arc<LocalVault>, client: ThingClient) -> Self {
        Self {
            vault,
            client,
            schedulers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn vault(&self) -> &Arc<LocalVault> {
        &self.vault
    }

    /// The commit scheduler of `record_id`, configured from `options`.
    pub fn scheduler(&self, record_id: &str, options: &SyncOptions) -> CommitScheduler {
        let mut schedulers = self.schedulers.lock().unwrap();
        let scheduler = schedulers
            .entry(record_id.to_string())
            .or_insert_with(|| {
                CommitScheduler::new(self.vault.record_cache(record_id), self.client.clone())
            })
            .clone();
        scheduler
            .with_error_handler(options.error_handler.clone())
            .with_retry_delay(options.retry_delay)
    }

    /// Sync every record that has a cache.
    pub async fn sync(&self, options: &SyncOptions) -> SyncReport {
        let mut report = SyncReport::default();
        if options.type_ids.is_empty() {
            debug!("no cached type ids; sync skipped");
            return report;
        }
        let record_ids = match self.vault.cached_record_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                report.note_error(e);
                return report;
            }
        };
        for record_id in &record_ids {
            report.merge(self.sync_record(record_id, options).await);
        }
        info!(
            records = record_ids.len(),
            synced = report.synced_item_count,
            failed = report.error.is_some(),
            "sync finished"
        );
        report
    }

    /// Commit, then pull, one record.
    pub async fn sync_record(&self, record_id: &str, options: &SyncOptions) -> SyncReport {
        let mut report = SyncReport::default();
        if options.type_ids.is_empty() {
            return report;
        }
        let cache = self.vault.record_cache(record_id);
        if let Err(e) = cache.ensure_status().await {
            report.note_error(e);
            return report;
        }

        match self.scheduler(record_id, options).commit_pending().await {
            Ok(Some(task)) => match task.wait().await {
                Ok(commits) => {
                    report.synced_item_count += commits.committed_count();
                    if let Some(e) = commits.first_error() {
                        report.note_error(e.clone());
                    }
                    report.commits.push(commits);
                }
                Err(e) => report.note_error(e),
            },
            Ok(None) => {}
            Err(e) => report.note_error(e),
        }

        // Pull even when commits failed; keys with pending operations are left alone.
        match self.pull_changes(&cache, options).await {
            Ok(count) => report.synced_item_count += count,
            Err(e) => {
                warn!(record = %record_id, error = %e, "pull failed");
                report.note_error(e);
            }
        }

        match self.refresh_stale_things(&cache, options).await {
            Ok(count) => report.synced_item_count += count,
            Err(e) => {
                warn!(record = %record_id, error = %e, "refreshing stale things failed");
                report.note_error(e);
            }
        }
        report
    }

    /// Fetch the current server copies of stale things whose pending
    /// operations have cleared. Returns the number written or removed.
    async fn refresh_stale_things(&self, cache: &RecordCache, options: &SyncOptions) -> Result<usize> {
        let ids = cache.stale_ids_ready_for_refresh().await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut refreshed = 0;
        for chunk in ids.chunks(options.batch_size.max(1)) {
            let keys: Vec<ThingKey> = chunk
                .iter()
                .map(|id| ThingKey::new(id.clone(), String::new()))
                .collect();
            let things = self.client.get_things_by_keys(cache.record_id(), &keys).await?;
            refreshed += cache.apply_refreshed_things(chunk, things).await?;
        }
        Ok(refreshed)
    }

    /// Apply server changes above the watermark. Returns the number of things
    /// written or removed.
    async fn pull_changes(&self, cache: &RecordCache, options: &SyncOptions) -> Result<usize> {
        let record_id = cache.record_id();
        let mut since = cache.status().await?.newest_cache_sequence_number;
        let mut applied = 0;
        let mut caught_up = false;

        for batch_index in 0usize.. {
            let batch = self
                .client
                .get_thing_changes(record_id, since, options.batch_size.max(1), &options.type_ids)
                .await?;
            let count = cache.apply_change_batch(&batch).await?;
            applied += count;
            debug!(
                record = %record_id,
                batch = batch_index,
                applied = count,
                watermark = batch.batch_sequence_number,
                "applied change batch"
            );

            if batch.batch_sequence_number >= batch.latest_sequence_number {
                caught_up = true;
                break;
            }
            if batch.is_empty() || batch.batch_sequence_number <= since {
                break;
            }
            since = batch.batch_sequence_number;
        }

        let now = Utc::now();
        cache
            .update_status(|status| {
                status.last_sync_date = Some(now);
                if caught_up {
                    status.last_consistency_date = Some(now);
                    status.is_valid = true;
                }
            })
            .await?;
        info!(record = %record_id, applied, caught_up, "pulled changes");
        Ok(applied)
    }

    /// Run [`sync`](Self::sync) now and then every `interval` until cancelled.
    pub fn spawn_periodic(&self, options: SyncOptions, interval: Duration) -> Task<()> {
        let synchronizer = self.clone();
        Task::spawn(move |cancel| async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let report = synchronizer.sync(&options).await;
                if let Some(e) = &report.error {
                    warn!(error = %e, "periodic sync reported an error");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("periodic sync stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Thing, ThingKey};
    use crate::store::RecordCacheSettings;
    use crate::transport::{Fault, MemoryThingServer, MethodName, ServerStatusCode};

    fn thing(id: &str) -> Thing {
        Thing::new(ThingKey::new(id, "1"), "weight", Utc::now(), "{\"kg\":70}")
    }

    fn options(batch_size: usize) -> SyncOptions {
        SyncOptions {
            type_ids: vec!["weight".to_string()],
            batch_size,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    async fn setup(count: usize) -> (Arc<MemoryThingServer>, CacheSynchronizer) {
        let server = Arc::new(MemoryThingServer::new());
        for i in 0..count {
            server.insert_thing("r1", thing(&format!("t{}", i)));
        }
        let vault = Arc::new(LocalVault::in_memory(RecordCacheSettings::default()));
        vault
            .setup_cache_for_record_ids(&["r1".to_string()])
            .await
            .unwrap();
        let synchronizer = CacheSynchronizer::new(vault, ThingClient::new(server.clone()));
        (server, synchronizer)
    }

    #[tokio::test]
    async fn test_full_pull_makes_cache_consistent() {
        let (server, synchronizer) = setup(5).await;
        let report = synchronizer.sync(&options(2)).await;
        assert!(report.error.is_none());
        assert_eq!(report.synced_item_count, 5);
        assert_eq!(server.call_count(MethodName::GetThingChanges), 3);

        let cache = synchronizer.vault().record_cache("r1");
        let status = cache.status().await.unwrap();
        assert_eq!(status.newest_cache_sequence_number, 5);
        assert!(status.is_valid);
        assert!(status.last_consistency_date.is_some());
        assert!(status.is_consistent());
        assert_eq!(cache.things().all_keys().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_watermark_stops_at_failed_page() {
        let (server, synchronizer) = setup(5).await;
        server.set_fault(|request| {
            let later_page = request.parameters["since"].as_u64().is_some_and(|since| since > 0);
            later_page.then(|| Fault::Status(ServerStatusCode::RequestTimedOut))
        });

        let report = synchronizer.sync(&options(2)).await;
        assert!(report.error.as_ref().is_some_and(|e| e.is_transient()));
        assert_eq!(report.synced_item_count, 2);

        let cache = synchronizer.vault().record_cache("r1");
        let status = cache.status().await.unwrap();
        assert_eq!(status.newest_cache_sequence_number, 2);
        assert!(!status.is_valid);

        server.clear_fault();
        let report = synchronizer.sync(&options(2)).await;
        assert!(report.error.is_none());
        assert_eq!(report.synced_item_count, 3);
        let status = cache.status().await.unwrap();
        assert_eq!(status.newest_cache_sequence_number, 5);
        assert!(status.is_valid);
    }

    #[tokio::test]
    async fn test_pull_leaves_pending_things_alone() {
        let (server, synchronizer) = setup(1).await;
        server.set_fault(|request| {
            (request.method == MethodName::PutThings)
                .then(|| Fault::Status(ServerStatusCode::AccessDenied))
        });
        let cache = synchronizer.vault().record_cache("r1");
        let mut edited = thing("t0");
        edited.payload = "{\"kg\":71}".to_string();
        cache.track_put(edited).await.unwrap();

        let report = synchronizer.sync(&options(10)).await;
        assert!(matches!(report.error, Some(Error::AccessDenied(_))));
        assert_eq!(report.synced_item_count, 0);

        let local = cache.things().get_item("t0").await.unwrap().unwrap();
        assert_eq!(local.payload, "{\"kg\":71}");
        assert_eq!(cache.pending().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_passed_over_change_is_fetched_after_discard() {
        let (server, synchronizer) = setup(1).await;
        synchronizer.sync(&options(10)).await;
        let cache = synchronizer.vault().record_cache("r1");

        server.set_fault(|request| {
            (request.method == MethodName::PutThings)
                .then(|| Fault::Status(ServerStatusCode::AccessDenied))
        });
        let mut edited = thing("t0");
        edited.payload = "{\"kg\":71}".to_string();
        let op = cache.track_put(edited).await.unwrap();
        server.update_thing("r1", "t0", "{\"kg\":80}").unwrap();

        synchronizer.sync(&options(10)).await;
        let status = cache.status().await.unwrap();
        assert!(status.stale_ids.contains("t0"));
        assert_eq!(status.newest_cache_sequence_number, server.latest_sequence_number("r1"));
        assert_eq!(cache.things().get_item("t0").await.unwrap().unwrap().payload, "{\"kg\":71}");

        assert!(cache.discard(&op.identifier).await.unwrap());
        server.clear_fault();
        let report = synchronizer.sync(&options(10)).await;
        assert!(report.error.is_none());
        assert_eq!(report.synced_item_count, 1);
        let local = cache.things().get_item("t0").await.unwrap().unwrap();
        let current = server.thing("r1", "t0").unwrap();
        assert_eq!(local.key, current.key);
        assert_eq!(local.payload, "{\"kg\":80}");
        assert!(cache.status().await.unwrap().stale_ids.is_empty());
    }

    #[tokio::test]
    async fn test_commits_then_pulls() {
        let (server, synchronizer) = setup(1).await;
        let cache = synchronizer.vault().record_cache("r1");
        cache.track_new(thing("x")).await.unwrap();

        let report = synchronizer.sync(&options(10)).await;
        assert!(report.error.is_none());
        assert_eq!(server.thing_count("r1"), 2);
        assert_eq!(cache.pending().len().await.unwrap(), 0);
        // One commit plus two pulled things
        assert_eq!(report.synced_item_count, 3);
        assert_eq!(report.commits.len(), 1);
        assert_eq!(report.commits[0].committed_count(), 1);
        assert_eq!(cache.things().all_keys().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_server_deletions_are_applied() {
        let (server, synchronizer) = setup(2).await;
        synchronizer.sync(&options(10)).await;
        let cache = synchronizer.vault().record_cache("r1");
        assert!(cache.things().exists_item("t1").await.unwrap());

        server.delete_thing("r1", "t1");
        let report = synchronizer.sync(&options(10)).await;
        assert!(report.error.is_none());
        assert_eq!(report.synced_item_count, 1);
        assert!(!cache.things().exists_item("t1").await.unwrap());
        assert!(cache.things().exists_item("t0").await.unwrap());
    }

    #[tokio::test]
    async fn test_no_type_ids_is_a_no_op() {
        let (server, synchronizer) = setup(2).await;
        let report = synchronizer.sync(&SyncOptions::default()).await;
        assert_eq!(report, SyncReport::default());
        assert_eq!(server.call_count(MethodName::GetThingChanges), 0);
    }

    #[tokio::test]
    async fn test_periodic_sync_stops_on_cancel() {
        let (server, synchronizer) = setup(1).await;
        let task = synchronizer.spawn_periodic(options(10), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.cancel();
        task.wait().await.unwrap();

        let calls = server.call_count(MethodName::GetThingChanges);
        assert!(calls >= 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(server.call_count(MethodName::GetThingChanges), calls);
    }
}
