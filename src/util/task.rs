//! Handles for spawned network operations.
//!
//! Operations that talk to the server return `Option<Task<T>>`. `None` means
//! there was nothing to do; otherwise the caller may await the result with
//! [`Task::wait`] or request cancellation with [`Task::cancel`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

// =============================================================================
// CancelSignal
// =============================================================================

/// A cancellation flag shared between a [`Task`] and the work it runs.
///
/// Cancellation is cooperative: the work checks [`CancelSignal::is_cancelled`]
/// between units (batches, commits) and stops issuing new ones.
pub struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Signal cancellation.
    ///
    /// Any current or future calls to `cancelled()` will return.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is signaled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Task
// =============================================================================

/// A spawned operation that produces a `T`.
pub struct Task<T> {
    handle: JoinHandle<T>,
    cancel: Arc<CancelSignal>,
}

impl<T: Send + 'static> Task<T> {
    /// Spawn `f` on the runtime, handing it a fresh cancel signal.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Arc<CancelSignal>) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let cancel = Arc::new(CancelSignal::new());
        let handle = tokio::spawn(f(cancel.clone()));
        Self { handle, cancel }
    }

    /// Request cancellation. Work already applied stays applied.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_signal(&self) -> Arc<CancelSignal> {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the operation to finish.
    ///
    /// A panicked or aborted task surfaces as [`Error::Cancelled`].
    pub async fn wait(self) -> Result<T> {
        self.handle.await.map_err(|_| Error::Cancelled)
    }
}
