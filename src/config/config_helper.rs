//! Configuration helper for interpreting config values.
//!
//! The `ConfigHelper` wraps a `Config` and turns its raw values into the
//! settings the cache, commit and transport layers take.

use std::sync::Arc;
use std::time::Duration;

use crate::commit::{CommitErrorHandler, ConflictPolicy};
use crate::store::{LockRetry, RecordCacheSettings};
use crate::sync::SyncOptions;
use crate::transport::{RetryingTransport, Transport};

use super::Config;

#[derive(Debug, Clone)]
pub struct ConfigHelper {
    config: Config,
}

impl ConfigHelper {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Caching is off when disabled outright or when no type ids are configured.
    pub fn caching_enabled(&self) -> bool {
        !self.config.cache.no_cache && !self.config.cache.type_ids.is_empty()
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.cache.max_age_seconds.min(i64::MAX as u64) as i64)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.config.sync.interval_seconds)
    }

    pub fn record_cache_settings(&self) -> RecordCacheSettings {
        RecordCacheSettings {
            max_items_in_memory: self.config.cache.max_items_in_memory,
            lock_retry: LockRetry {
                attempts: self.config.sync.lock_retry_count,
                delay: Duration::from_millis(self.config.sync.lock_retry_delay_ms),
            },
        }
    }

    pub fn error_handler(&self) -> CommitErrorHandler {
        CommitErrorHandler::new(
            self.config.sync.max_attempts_per_change,
            ConflictPolicy {
                on_item_key_not_found: self.config.sync.on_item_key_not_found,
                on_version_conflict: self.config.sync.on_version_conflict,
            },
        )
    }

    /// Options for a sync run. The type list is empty when caching is disabled.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            type_ids: if self.caching_enabled() {
                self.config.cache.type_ids.clone()
            } else {
                Vec::new()
            },
            batch_size: self.config.sync.batch_size,
            error_handler: self.error_handler(),
            retry_delay: Duration::from_millis(self.config.sync.retry_delay_ms),
        }
    }

    /// Wrap `inner` with the configured network retries.
    pub fn retrying_transport(&self, inner: Arc<dyn Transport>) -> Arc<dyn Transport> {
        Arc::new(RetryingTransport::with_settings(
            inner,
            self.config.transport.retry_count,
            Duration::from_secs(self.config.transport.retry_sleep_seconds),
        ))
    }

    pub fn into_config(self) -> Config {
        self.config
    }
}

impl From<Config> for ConfigHelper {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}
