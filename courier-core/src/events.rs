//! Events surfaced to the UI layer.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{ActionKind, OrderId};

const DEFAULT_CAPACITY: usize = 64;

/// Why a queued action was dropped without being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The order changed on the server after the action was queued.
    ServerWins,
    /// The order no longer exists.
    ResourceNotFound,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::ServerWins => write!(f, "order was already updated elsewhere"),
            DiscardReason::ResourceNotFound => write!(f, "order no longer exists"),
        }
    }
}

/// Sync outcome notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ActionSucceeded {
        action_id: Uuid,
        kind: ActionKind,
        order_id: OrderId,
    },
    ActionDiscarded {
        action_id: Uuid,
        kind: ActionKind,
        order_id: OrderId,
        reason: DiscardReason,
    },
    ActionFailedPermanently {
        action_id: Uuid,
        kind: ActionKind,
        order_id: OrderId,
        retry_count: u32,
    },
    /// The refresh token was rejected. The app must force re-authentication.
    SessionExpired,
}

impl std::fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncEvent::ActionSucceeded { kind, order_id, .. } => {
                write!(f, "{} for order #{} sent", kind, order_id)
            }
            SyncEvent::ActionDiscarded {
                kind,
                order_id,
                reason,
                ..
            } => write!(f, "{} for order #{} discarded: {}", kind, order_id, reason),
            SyncEvent::ActionFailedPermanently {
                kind,
                order_id,
                retry_count,
                ..
            } => write!(
                f,
                "{} for order #{} failed after {} retries",
                kind, order_id, retry_count
            ),
            SyncEvent::SessionExpired => write!(f, "session expired, please log in again"),
        }
    }
}

/// Broadcast fan-out of [`SyncEvent`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        tracing::debug!(?event, "sync event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
