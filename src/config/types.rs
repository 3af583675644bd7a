//! Configuration types for thingcache-rs.
//!
//! This module defines the structures used to represent application configuration
//! as parsed from an INI-format config file.

use std::path::PathBuf;

use crate::commit::ConflictResolution;

/// [cache] section - local thing cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the LMDB database.
    pub path: PathBuf,
    pub no_cache: bool,
    /// Type ids kept in the cache. Empty disables caching.
    pub type_ids: Vec<String>,
    /// Age after which views and stored queries are refreshed.
    pub max_age_seconds: u64,
    /// Entries held in each record's in-memory overlay.
    pub max_items_in_memory: usize,
}

/// [sync] section - commit and pull behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval_seconds: u64,
    pub batch_size: usize,
    pub max_attempts_per_change: u32,
    pub retry_delay_ms: u64,
    pub lock_retry_count: u32,
    pub lock_retry_delay_ms: u64,
    pub on_item_key_not_found: ConflictResolution,
    pub on_version_conflict: ConflictResolution,
}

/// [transport] section - retries of failed round trips.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub retry_count: u32,
    pub retry_sleep_seconds: u64,
}

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub transport: TransportConfig,
}

/// Result of reading configuration, including any warnings.
#[derive(Debug)]
pub struct ConfigResult {
    pub config: Config,
    pub warnings: Vec<String>,
}
