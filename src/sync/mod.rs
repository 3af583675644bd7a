//! Synchronization of record caches with the server.
//!
//! See [`CacheSynchronizer`] for the order of work within one record.

mod synchronizer;

pub use synchronizer::{CacheSynchronizer, SyncOptions, SyncReport};
