//! thingcache-rs - A local cache and sync engine for health-record things.
//!
//! Things are cached per record in a key-value database. Local edits are
//! queued as pending operations and committed to the server by the
//! [`CommitScheduler`]; server changes are pulled by sequence number by the
//! [`CacheSynchronizer`]. [`TypeView`]s keep an ordered index of one type's
//! things and [`BatchDownloader`] fills in their bodies.

pub mod caches;
pub mod cli;
pub mod commit;
pub mod config;
pub mod download;
pub mod error;
pub mod model;
pub mod store;
pub mod sync;
pub mod transport;
pub mod util;
pub mod view;

pub use commit::{CommitReport, CommitScheduler, ConflictPolicy, ConflictResolution};
pub use download::{BatchDownloader, DownloadOutcome};
pub use error::{Error, Result};
pub use model::{PendingOperation, Thing, ThingKey, ThingQuery, ThingQueryResult, ThingTypeRegistry};
pub use store::{LocalVault, RecordCache, RecordCacheSettings};
pub use sync::{CacheSynchronizer, SyncOptions, SyncReport};
pub use transport::{MemoryThingServer, RetryingTransport, ThingClient, Transport};
pub use util::{CancelSignal, Task};
pub use view::{MultipleTypeViewRefresher, TypeView};
