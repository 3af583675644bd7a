//! Batched download of thing bodies into a record cache.

mod batch_downloader;

pub use batch_downloader::{BatchDownloader, DownloadOutcome, DEFAULT_BATCH_SIZE};
