//! Key-value storage underneath the record caches.
//!
//! - [`KeyValueDb`] - async key-value interface with prefix scans and atomic transactions
//! - [`LmdbKeyValueDb`] - LMDB-backed implementation
//! - [`MemoryKeyValueDb`] - in-memory implementation for tests and ephemeral vaults

mod key_value_db;
mod lmdb_key_value_db;
mod memory_key_value_db;

pub use key_value_db::{KeyValueDb, KeyValueDbError, KeyValueDbTransaction, KeyValueEntry, WriteOp};
pub use lmdb_key_value_db::LmdbKeyValueDb;
pub use memory_key_value_db::MemoryKeyValueDb;
