//! Decides what happens to a pending operation whose submission failed.

use crate::error::Error;
use crate::model::{PendingMethod, PendingOperation};

pub const DEFAULT_MAX_ATTEMPTS_PER_CHANGE: u32 = 3;

/// How to resolve a conflict of a given class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Resubmit the change as a new item. The original item is left orphaned.
    CreateNew,
    /// Stop and leave the operation in the `Conflict` state.
    Fail,
}

/// Conflict handling, keyed by error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictPolicy {
    pub on_item_key_not_found: ConflictResolution,
    pub on_version_conflict: ConflictResolution,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            on_item_key_not_found: ConflictResolution::CreateNew,
            on_version_conflict: ConflictResolution::Fail,
        }
    }
}

/// The handler's verdict on one failed submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDecision {
    /// The operation's intent already holds on the server; treat as committed.
    AlreadySatisfied,
    /// Submit the same operation again.
    Retry,
    /// Rewrite the operation as a new item and submit again.
    RetryAsNew,
    Conflict(String),
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct CommitErrorHandler {
    pub max_attempts_per_change: u32,
    pub conflict_policy: ConflictPolicy,
}

impl Default for CommitErrorHandler {
    fn default() -> Self {
        Self {
            max_attempts_per_change: DEFAULT_MAX_ATTEMPTS_PER_CHANGE,
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

impl CommitErrorHandler {
    pub fn new(max_attempts_per_change: u32, conflict_policy: ConflictPolicy) -> Self {
        Self {
            max_attempts_per_change: max_attempts_per_change.max(1),
            conflict_policy,
        }
    }

    /// Classify `error`, returned by the submission that made `op.version` attempts.
    pub fn decide(&self, op: &PendingOperation, error: &Error) -> ErrorDecision {
        let attempts_left = op.version < self.max_attempts_per_change;

        let resolution = match (error, op.method_name) {
            (Error::ItemKeyNotFound(_), PendingMethod::RemoveThings) => {
                return ErrorDecision::AlreadySatisfied;
            }
            (Error::ItemKeyNotFound(_), PendingMethod::PutThings) => {
                Some(self.conflict_policy.on_item_key_not_found)
            }
            (Error::VersionConflict(_), PendingMethod::PutThings) => {
                Some(self.conflict_policy.on_version_conflict)
            }
            (Error::VersionConflict(_), PendingMethod::RemoveThings) => Some(ConflictResolution::Fail),
            _ => None,
        };

        match resolution {
            Some(ConflictResolution::CreateNew) if attempts_left => ErrorDecision::RetryAsNew,
            Some(_) => ErrorDecision::Conflict(error.to_string()),
            None if Self::is_retryable(error) => {
                if attempts_left {
                    ErrorDecision::Retry
                } else {
                    ErrorDecision::Fail(format!("gave up after {} attempts: {}", op.version, error))
                }
            }
            None => ErrorDecision::Fail(error.to_string()),
        }
    }

    fn is_retryable(error: &Error) -> bool {
        error.is_transient() || matches!(error, Error::LockUnavailable(_))
    }
}
