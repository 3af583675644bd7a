//! Synchronization metadata for a record cache.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored under `rec/{record}/meta`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub last_sync_date: Option<DateTime<Utc>>,
    /// When a pull last caught up with the server's newest sequence number.
    pub last_consistency_date: Option<DateTime<Utc>>,
    /// Watermark: every change at or below this number has been applied.
    pub newest_cache_sequence_number: u64,
    /// Newest sequence number the server reported.
    pub newest_health_vault_sequence_number: u64,
    /// False until the first complete pull, or after a reset.
    pub is_valid: bool,
    /// Things whose server changes were passed over because local operations
    /// were pending. They are fetched again once those operations are gone.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub stale_ids: BTreeSet<String>,
}

impl CacheStatus {
    /// Advance the watermark. Never moves it backwards.
    pub fn advance_watermark(&mut self, sequence_number: u64) {
        self.newest_cache_sequence_number = self.newest_cache_sequence_number.max(sequence_number);
    }

    pub fn note_server_sequence_number(&mut self, sequence_number: u64) {
        self.newest_health_vault_sequence_number =
            self.newest_health_vault_sequence_number.max(sequence_number);
    }

    /// Forget `id` as stale, returning true if it was.
    pub fn clear_stale(&mut self, id: &str) -> bool {
        self.stale_ids.remove(id)
    }

    /// True when the cache has applied everything the server last reported.
    pub fn is_consistent(&self) -> bool {
        self.is_valid && self.newest_cache_sequence_number >= self.newest_health_vault_sequence_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_never_regresses() {
        let mut status = CacheStatus::default();
        status.advance_watermark(10);
        status.advance_watermark(4);
        assert_eq!(status.newest_cache_sequence_number, 10);

        status.note_server_sequence_number(12);
        status.is_valid = true;
        assert!(!status.is_consistent());
        status.advance_watermark(12);
        assert!(status.is_consistent());
    }
}
