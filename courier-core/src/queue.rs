//! Durable queue of pending order mutations and its drain pass.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::api::{OrderApi, OrderLookup};
use crate::conflict::{ConflictResolver, ConflictResult};
use crate::events::{DiscardReason, EventBus, SyncEvent};
use crate::models::{ActionPayload, DeadLetter, OrderId, PendingAction, ValidationError};
use crate::retry::RetryPolicy;
use crate::store::{ActionRepository, StoreError};
use crate::transport::ErrorClass;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid action: {0}")]
    Invalid(#[from] ValidationError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Counts from one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub discarded: usize,
    pub failed_permanently: usize,
    /// Sent and failed; retry state was advanced.
    pub retried: usize,
    /// Left untouched this pass (backoff, lookup failure or an earlier
    /// blocked action for the same order).
    pub deferred: usize,
    /// Another pass was already running, nothing was done.
    pub skipped_reentrant: bool,
    /// The pass stopped early because the session ended.
    pub halted: bool,
}

impl DrainReport {
    fn reentrant() -> Self {
        Self {
            skipped_reentrant: true,
            ..Self::default()
        }
    }

    /// Number of actions that left the queue during the pass.
    pub fn resolved(&self) -> usize {
        self.succeeded + self.discarded + self.failed_permanently
    }
}

enum Step {
    Succeeded,
    Discarded,
    FailedPermanently,
    Retried,
    Deferred,
    Halted,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Persist-then-send queue of order mutations.
pub struct ActionQueue {
    repo: ActionRepository,
    api: OrderApi,
    policy: RetryPolicy,
    events: EventBus,
    draining: AtomicBool,
}

impl ActionQueue {
    pub fn new(repo: ActionRepository, api: OrderApi, policy: RetryPolicy, events: EventBus) -> Self {
        Self {
            repo,
            api,
            policy,
            events,
            draining: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persists an action. When no snapshot is given, the last observed
    /// `updated_at` of the order is used as the conflict baseline.
    pub async fn enqueue(&self, mut action: PendingAction) -> QueueResult<PendingAction> {
        action.validate()?;
        if action.server_snapshot_updated_at.is_none() {
            action.server_snapshot_updated_at = self.repo.snapshot(action.order_id).await?;
        }

        self.repo.insert(&action).await?;
        info!(
            action_id = %action.id,
            kind = %action.kind(),
            order_id = action.order_id,
            "action queued"
        );
        Ok(action)
    }

    /// Builds and persists an action for `order_id`.
    pub async fn enqueue_action(
        &self,
        order_id: OrderId,
        payload: ActionPayload,
    ) -> QueueResult<PendingAction> {
        self.enqueue(PendingAction::new(order_id, payload)).await
    }

    /// Records a server `updated_at` seen outside the queue, for example
    /// when the order list is fetched.
    pub async fn observe_order(&self, order_id: OrderId, updated_at: DateTime<Utc>) -> QueueResult<()> {
        self.repo.record_snapshot(order_id, updated_at).await?;
        Ok(())
    }

    pub async fn pending(&self) -> QueueResult<Vec<PendingAction>> {
        Ok(self.repo.list_pending().await?)
    }

    pub async fn len(&self) -> QueueResult<usize> {
        Ok(self.repo.count().await?)
    }

    pub async fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
        Ok(self.repo.list_dead_letters().await?)
    }

    pub async fn clear_dead_letters(&self) -> QueueResult<u64> {
        Ok(self.repo.clear_dead_letters().await?)
    }

    /// Deletes all queued actions, dead letters and snapshots.
    pub async fn purge(&self) -> QueueResult<()> {
        self.repo.purge().await?;
        info!("action queue purged");
        Ok(())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Runs one pass over the queue in creation order. A call made while
    /// another pass is running returns immediately.
    pub async fn drain(&self) -> QueueResult<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in progress, skipping");
            return Ok(DrainReport::reentrant());
        }
        let _guard = DrainGuard(&self.draining);

        let ids: Vec<_> = self
            .repo
            .list_pending()
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect();
        if ids.is_empty() {
            return Ok(DrainReport::default());
        }
        debug!(pending = ids.len(), "draining action queue");

        let mut report = DrainReport::default();
        let mut blocked = HashSet::new();
        for id in ids {
            // Re-read so rebased snapshots and concurrent purges are seen
            let Some(action) = self.repo.get(id).await? else {
                continue;
            };
            match self.process(action, &mut blocked).await? {
                Step::Succeeded => report.succeeded += 1,
                Step::Discarded => report.discarded += 1,
                Step::FailedPermanently => report.failed_permanently += 1,
                Step::Retried => report.retried += 1,
                Step::Deferred => report.deferred += 1,
                Step::Halted => {
                    report.halted = true;
                    break;
                }
            }
        }

        info!(
            succeeded = report.succeeded,
            discarded = report.discarded,
            failed = report.failed_permanently,
            retried = report.retried,
            deferred = report.deferred,
            halted = report.halted,
            "drain pass complete"
        );
        Ok(report)
    }

    async fn process(
        &self,
        mut action: PendingAction,
        blocked: &mut HashSet<OrderId>,
    ) -> QueueResult<Step> {
        let now = Utc::now();
        let touched = touched_orders(&action);

        if action.is_exhausted(&self.policy) {
            self.fail_permanently(&action, "retries exhausted").await?;
            return Ok(Step::FailedPermanently);
        }

        if touched.iter().any(|order| blocked.contains(order)) {
            debug!(action_id = %action.id, order_id = action.order_id, "earlier action for order pending, deferring");
            blocked.extend(touched);
            return Ok(Step::Deferred);
        }

        if !action.can_retry(&self.policy, now) {
            debug!(action_id = %action.id, retry_count = action.retry_count, "backing off");
            blocked.extend(touched);
            return Ok(Step::Deferred);
        }

        let lookup = self.api.lookup(action.order_id).await;
        match &lookup {
            OrderLookup::Failed(err) if err.ends_session() => {
                warn!(action_id = %action.id, error = %err, "session ended, stopping drain");
                return Ok(Step::Halted);
            }
            OrderLookup::Found(Some(updated_at)) => {
                self.repo.record_snapshot(action.order_id, *updated_at).await?;
            }
            _ => {}
        }

        match ConflictResolver::check(&action, &lookup) {
            ConflictResult::NoConflict => {}
            ConflictResult::ServerWins => {
                self.discard(&action, DiscardReason::ServerWins).await?;
                return Ok(Step::Discarded);
            }
            ConflictResult::ResourceNotFound => {
                self.discard(&action, DiscardReason::ResourceNotFound).await?;
                return Ok(Step::Discarded);
            }
            ConflictResult::NetworkError => {
                if let OrderLookup::Failed(err) = &lookup {
                    warn!(action_id = %action.id, order_id = action.order_id, error = %err, "order lookup failed, will retry");
                }
                blocked.extend(touched);
                return Ok(Step::Deferred);
            }
        }

        let err = match self.api.submit(&action).await {
            Ok(ack) => {
                self.repo.remove(action.id).await?;
                for (order_id, updated_at) in ack.stamps(&touched) {
                    self.repo.record_snapshot(order_id, updated_at).await?;
                    let rebased = self.repo.rebase_snapshots(order_id, updated_at).await?;
                    if rebased > 0 {
                        debug!(order_id, rebased, "rebased queued actions");
                    }
                }
                info!(action_id = %action.id, kind = %action.kind(), order_id = action.order_id, "action delivered");
                self.events.emit(SyncEvent::ActionSucceeded {
                    action_id: action.id,
                    kind: action.kind(),
                    order_id: action.order_id,
                });
                return Ok(Step::Succeeded);
            }
            Err(err) => err,
        };

        if err.ends_session() {
            warn!(action_id = %action.id, error = %err, "session ended, stopping drain");
            return Ok(Step::Halted);
        }

        match err.class() {
            ErrorClass::Unauthorized => {
                warn!(action_id = %action.id, "still unauthorized after refresh, stopping drain");
                Ok(Step::Halted)
            }
            ErrorClass::Conflict => {
                self.discard(&action, DiscardReason::ServerWins).await?;
                Ok(Step::Discarded)
            }
            ErrorClass::NotFound => {
                self.discard(&action, DiscardReason::ResourceNotFound).await?;
                Ok(Step::Discarded)
            }
            _ if !err.is_retryable() => {
                self.fail_permanently(&action, &err.to_string()).await?;
                Ok(Step::FailedPermanently)
            }
            class => {
                action.record_failure(now);
                self.repo.update_retry(&action).await?;
                blocked.extend(touched);
                if class == ErrorClass::Unknown {
                    error!(action_id = %action.id, retry_count = action.retry_count, error = %err, "unexpected failure sending action");
                } else {
                    warn!(action_id = %action.id, retry_count = action.retry_count, error = %err, "failed to send action");
                }
                Ok(Step::Retried)
            }
        }
    }

    async fn discard(&self, action: &PendingAction, reason: DiscardReason) -> QueueResult<()> {
        self.repo.remove(action.id).await?;
        warn!(
            action_id = %action.id,
            kind = %action.kind(),
            order_id = action.order_id,
            %reason,
            "action discarded"
        );
        self.events.emit(SyncEvent::ActionDiscarded {
            action_id: action.id,
            kind: action.kind(),
            order_id: action.order_id,
            reason,
        });
        Ok(())
    }

    async fn fail_permanently(&self, action: &PendingAction, reason: &str) -> QueueResult<()> {
        let letter = DeadLetter::from_action(action, reason);
        self.repo.move_to_dead_letter(&letter).await?;
        error!(
            action_id = %action.id,
            kind = %action.kind(),
            order_id = action.order_id,
            retry_count = action.retry_count,
            reason,
            "action failed permanently"
        );
        self.events.emit(SyncEvent::ActionFailedPermanently {
            action_id: action.id,
            kind: action.kind(),
            order_id: action.order_id,
            retry_count: action.retry_count,
        });
        Ok(())
    }
}

fn touched_orders(action: &PendingAction) -> Vec<OrderId> {
    let mut orders = vec![action.order_id];
    for &order_id in action.payload.batch_orders() {
        if !orders.contains(&order_id) {
            orders.push(order_id);
        }
    }
    orders
}
