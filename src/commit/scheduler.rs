//! Submission of pending operations to the server.
//!
//! Operations on the same thing are submitted one at a time, oldest first,
//! while holding the thing's key lock. Operations on different things run
//! concurrently. Each operation moves through:
//!
//! ```text
//! Queued -> Submitting -> Committed
//!                      -> Retrying -> Submitting ...
//!                      -> Conflict
//!                      -> Failed
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{PendingOperation, PendingState, Thing};
use crate::store::{AutoLock, RecordCache};
use crate::transport::ThingClient;
use crate::util::{CancelSignal, Task};

use super::error_handler::{CommitErrorHandler, ErrorDecision};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Queued,
    Submitting,
    Committed,
    Retrying,
    Conflict,
    Failed,
}

/// Final state of one operation after a commit pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    pub identifier: Uuid,
    /// Id the operation targeted when the pass started.
    pub thing_id: String,
    pub state: CommitState,
    /// Submission attempts made so far, across passes.
    pub attempts: u32,
    /// The confirmed thing, for a committed put.
    pub thing: Option<Thing>,
    pub error: Option<Error>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub outcomes: Vec<CommitOutcome>,
}

impl CommitReport {
    pub fn committed_count(&self) -> usize {
        self.count(CommitState::Committed)
    }

    pub fn count(&self, state: CommitState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    /// First error in submission order.
    pub fn first_error(&self) -> Option<&Error> {
        self.outcomes.iter().find_map(|o| o.error.as_ref())
    }

    pub fn outcome_for(&self, identifier: &Uuid) -> Option<&CommitOutcome> {
        self.outcomes.iter().find(|o| &o.identifier == identifier)
    }
}

/// Clears the running flag when a commit pass ends, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct CommitScheduler {
    cache: Arc<RecordCache>,
    client: ThingClient,
    handler: CommitErrorHandler,
    retry_delay: Duration,
    running: Arc<AtomicBool>,
}

impl CommitScheduler {
    pub fn new(cache: Arc<RecordCache>, client: ThingClient) -> Self {
        Self {
            cache,
            client,
            handler: CommitErrorHandler::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_error_handler(mut self, handler: CommitErrorHandler) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start submitting every queued operation.
    ///
    /// Returns `None` if a pass is already running or nothing is queued.
    pub async fn commit_pending(&self) -> Result<Option<Task<CommitReport>>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(record = %self.cache.record_id(), "commit already running");
            return Ok(None);
        }
        let guard = RunningGuard(self.running.clone());

        let queued: Vec<PendingOperation> = self
            .cache
            .pending()
            .list()
            .await?
            .into_iter()
            .filter(PendingOperation::is_queued)
            .collect();
        if queued.is_empty() {
            return Ok(None);
        }

        // Group by thing, keeping oldest-first order within each group
        let mut groups: Vec<(String, Vec<Uuid>)> = Vec::new();
        for op in &queued {
            match groups.iter_mut().find(|(id, _)| id == &op.thing_id) {
                Some((_, ids)) => ids.push(op.identifier),
                None => groups.push((op.thing_id.clone(), vec![op.identifier])),
            }
        }

        let scheduler = self.clone();
        Ok(Some(Task::spawn(move |cancel| async move {
            let _guard = guard;
            scheduler.run(groups, cancel).await
        })))
    }

    async fn run(&self, groups: Vec<(String, Vec<Uuid>)>, cancel: Arc<CancelSignal>) -> CommitReport {
        info!(record = %self.cache.record_id(), things = groups.len(), "committing pending operations");
        let results = join_all(groups.into_iter().map(|(thing_id, ids)| {
            let cancel = cancel.clone();
            async move {
                let mut outcomes = Vec::new();
                for identifier in ids {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Some(outcome) = self.commit_operation(&thing_id, identifier).await {
                        outcomes.push(outcome);
                    }
                }
                outcomes
            }
        }))
        .await;

        let report = CommitReport {
            outcomes: results.into_iter().flatten().collect(),
        };
        info!(
            record = %self.cache.record_id(),
            committed = report.committed_count(),
            failed = report.count(CommitState::Failed),
            conflicts = report.count(CommitState::Conflict),
            "commit pass finished"
        );
        report
    }

    /// Lock the operation's thing and re-read the operation under the lock.
    ///
    /// Returns `None` if the operation is gone or no longer queued.
    async fn lock_operation(&self, identifier: Uuid) -> Result<Option<(PendingOperation, AutoLock)>> {
        loop {
            let Some(op) = self.cache.pending().get(&identifier).await? else {
                return Ok(None);
            };
            if !op.is_queued() {
                return Ok(None);
            }
            let lock = self.cache.lock_item(&op.thing_id).await?;
            match self.cache.pending().get(&identifier).await? {
                Some(current) if current.is_queued() && current.thing_id == op.thing_id => {
                    return Ok(Some((current, lock)));
                }
                Some(current) if current.is_queued() => {
                    // Retargeted while we waited for the lock
                    continue;
                }
                _ => return Ok(None),
            }
        }
    }

    async fn commit_operation(&self, thing_id: &str, identifier: Uuid) -> Option<CommitOutcome> {
        let mut outcome = CommitOutcome {
            identifier,
            thing_id: thing_id.to_string(),
            state: CommitState::Queued,
            attempts: 0,
            thing: None,
            error: None,
        };

        let (mut op, lock) = match self.lock_operation(identifier).await {
            Ok(Some(locked)) => locked,
            Ok(None) => return None,
            Err(e) => {
                warn!(record = %self.cache.record_id(), id = thing_id, error = %e, "could not lock pending operation");
                outcome.error = Some(e);
                return Some(outcome);
            }
        };

        if let Err(e) = self.submit_until_settled(&mut op, &lock, &mut outcome).await {
            // Local storage failed; the operation stays queued for the next pass.
            warn!(record = %self.cache.record_id(), id = thing_id, error = %e, "commit interrupted");
            outcome.state = CommitState::Queued;
            outcome.error = Some(e);
        }
        outcome.attempts = op.version;
        Some(outcome)
    }

    async fn submit_until_settled(
        &self,
        op: &mut PendingOperation,
        lock: &AutoLock,
        outcome: &mut CommitOutcome,
    ) -> Result<()> {
        let record_id = self.cache.record_id();
        loop {
            op.version += 1;
            self.cache.pending().put(op).await?;
            outcome.state = CommitState::Submitting;
            debug!(record = %record_id, id = %op.thing_id, attempt = op.version, "submitting");

            let error = match self.client.submit(record_id, op).await {
                Ok(keys) => {
                    outcome.thing = self.cache.apply_commit_success(op, lock, &keys).await?;
                    outcome.state = CommitState::Committed;
                    outcome.error = None;
                    info!(record = %record_id, id = %op.thing_id, attempt = op.version, "committed");
                    return Ok(());
                }
                Err(e) => e,
            };

            match self.handler.decide(op, &error) {
                ErrorDecision::AlreadySatisfied => {
                    outcome.thing = self.cache.apply_commit_success(op, lock, &[]).await?;
                    outcome.state = CommitState::Committed;
                    outcome.error = None;
                    return Ok(());
                }
                ErrorDecision::Retry => {
                    outcome.state = CommitState::Retrying;
                    outcome.error = Some(error);
                    tokio::time::sleep(self.retry_delay).await;
                }
                ErrorDecision::RetryAsNew => {
                    info!(record = %record_id, id = %op.thing_id, "resubmitting as a new item");
                    outcome.state = CommitState::Retrying;
                    outcome.error = Some(error);
                    op.rewrite_as_new_item()?;
                }
                ErrorDecision::Conflict(reason) => {
                    warn!(record = %record_id, id = %op.thing_id, %reason, "commit conflict");
                    op.state = PendingState::Conflict { reason };
                    self.cache.pending().put(op).await?;
                    outcome.state = CommitState::Conflict;
                    outcome.error = Some(error);
                    return Ok(());
                }
                ErrorDecision::Fail(reason) => {
                    warn!(record = %record_id, id = %op.thing_id, %reason, "commit failed");
                    op.state = PendingState::Failed { reason };
                    self.cache.pending().put(op).await?;
                    outcome.state = CommitState::Failed;
                    outcome.error = Some(error);
                    return Ok(());
                }
            }
        }
    }

    /// Put a failed or conflicted operation back in the queue.
    pub async fn requeue(&self, identifier: &Uuid) -> Result<bool> {
        self.cache.requeue(identifier).await
    }
}
