//! Commit of queued local changes to the server.

mod error_handler;
mod scheduler;

pub use error_handler::{
    CommitErrorHandler, ConflictPolicy, ConflictResolution, ErrorDecision, DEFAULT_MAX_ATTEMPTS_PER_CHANGE,
};
pub use scheduler::{CommitOutcome, CommitReport, CommitScheduler, CommitState, DEFAULT_RETRY_DELAY};
