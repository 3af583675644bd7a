//! Local persistence of cached things, pending operations and sync state.
//!
//! ## Architecture
//!
//! 1. [`LocalVault`] owns the key-value database and one [`RecordCache`] per record.
//! 2. A [`RecordCache`] combines a [`ThingStore`], a [`PendingTable`] and the
//!    record's [`CacheStatus`], and performs the multi-entry transactions
//!    (commit confirmation, server change batches).
//! 3. A [`LockTable`] per record guards read-modify-write of each thing.

mod cache_status;
pub mod keys;
mod local_vault;
mod lock_table;
mod pending_table;
mod record_cache;
mod stored_query;
mod thing_store;

pub use cache_status::CacheStatus;
pub use local_vault::LocalVault;
pub use lock_table::{AutoLock, LockId, LockTable};
pub use pending_table::PendingTable;
pub use record_cache::{RecordCache, RecordCacheSettings};
pub use stored_query::StoredQuery;
pub use thing_store::{LockRetry, ThingStore, DEFAULT_MAX_ITEMS_IN_MEMORY};
