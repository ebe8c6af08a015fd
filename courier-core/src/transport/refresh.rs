//! Single-flight coordination of access-token refreshes.
//!
//! Every request records the refresh epoch it was dispatched under. A request
//! that comes back 401 queues on the refresh lock; once it holds the lock it
//! either finds that a refresh finished after its dispatch (epoch moved, so it
//! reuses that outcome) or it runs the refresh itself. At most one refresh call
//! is ever in flight.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Mutex;

/// How a refresh attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New tokens were stored.
    Refreshed,
    /// The refresh failed and credentials were cleared.
    Expired,
    /// The session was torn down while waiting.
    Cancelled,
}

#[derive(Debug, Default)]
struct RefreshState {
    epoch: u64,
    last_outcome: Option<RefreshOutcome>,
}

/// Guards the refresh critical section.
#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    epoch: AtomicU64,
    in_progress: AtomicBool,
}

struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    fn start(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of refreshes completed so far. Read without locking.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether a refresh call is currently in flight.
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Runs `refresh` unless a refresh already completed after `seen_epoch`,
    /// in which case that refresh's outcome is returned instead.
    pub async fn refresh_after<F, Fut>(&self, seen_epoch: u64, refresh: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome>,
    {
        let mut state = self.state.lock().await;
        if state.epoch != seen_epoch {
            if let Some(outcome) = state.last_outcome {
                tracing::debug!(?outcome, "reusing completed token refresh");
                return outcome;
            }
        }

        let outcome = {
            let _flag = InProgress::start(&self.in_progress);
            refresh().await
        };

        state.epoch += 1;
        state.last_outcome = Some(outcome);
        self.epoch.store(state.epoch, Ordering::SeqCst);
        outcome
    }

    /// Wakes every queued waiter with [`RefreshOutcome::Cancelled`]. Waits for
    /// an in-flight refresh to finish first.
    pub async fn cancel_waiters(&self) {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        state.last_outcome = Some(RefreshOutcome::Cancelled);
        self.epoch.store(state.epoch, Ordering::SeqCst);
    }
}
