use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::order::{OrderId, OrderStatus};
use super::ValidationError;
use crate::retry::RetryPolicy;

/// The closed set of mutations the queue can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    StatusUpdate,
    DeliveryComplete,
    Rejection,
    BatchPickup,
    BatchDelivery,
}

impl ActionKind {
    pub fn is_batch(self) -> bool {
        matches!(self, ActionKind::BatchPickup | ActionKind::BatchDelivery)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::StatusUpdate => write!(f, "status_update"),
            ActionKind::DeliveryComplete => write!(f, "delivery_complete"),
            ActionKind::Rejection => write!(f, "rejection"),
            ActionKind::BatchPickup => write!(f, "batch_pickup"),
            ActionKind::BatchDelivery => write!(f, "batch_delivery"),
        }
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "status_update" => Ok(ActionKind::StatusUpdate),
            "delivery_complete" => Ok(ActionKind::DeliveryComplete),
            "rejection" => Ok(ActionKind::Rejection),
            "batch_pickup" => Ok(ActionKind::BatchPickup),
            "batch_delivery" => Ok(ActionKind::BatchDelivery),
            _ => Err(format!(
                "Invalid action kind '{}'. Valid options: status_update, delivery_complete, rejection, batch_pickup, batch_delivery",
                s
            )),
        }
    }
}

/// Proof of delivery for one order in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryProof {
    pub order_id: OrderId,
    pub url: String,
}

/// Typed payload of a queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    StatusUpdate {
        status: OrderStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
    },
    DeliveryComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proof: Option<String>,
    },
    Rejection {
        reason: String,
    },
    BatchPickup {
        order_ids: Vec<OrderId>,
    },
    BatchDelivery {
        order_ids: Vec<OrderId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proofs: Option<Vec<DeliveryProof>>,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::StatusUpdate { .. } => ActionKind::StatusUpdate,
            ActionPayload::DeliveryComplete { .. } => ActionKind::DeliveryComplete,
            ActionPayload::Rejection { .. } => ActionKind::Rejection,
            ActionPayload::BatchPickup { .. } => ActionKind::BatchPickup,
            ActionPayload::BatchDelivery { .. } => ActionKind::BatchDelivery,
        }
    }

    /// Orders touched by a batch payload, empty for single-order kinds.
    pub fn batch_orders(&self) -> &[OrderId] {
        match self {
            ActionPayload::BatchPickup { order_ids }
            | ActionPayload::BatchDelivery { order_ids, .. } => order_ids,
            _ => &[],
        }
    }

    /// First order of a batch. Conflict checks run against it.
    pub fn primary_order(&self) -> Option<OrderId> {
        self.batch_orders().first().copied()
    }

    /// Checks the payload against the order it is queued for.
    pub fn validate(&self, order_id: OrderId) -> Result<(), ValidationError> {
        match self {
            ActionPayload::Rejection { reason } if reason.trim().is_empty() => {
                Err(ValidationError::MissingReason)
            }
            ActionPayload::BatchPickup { order_ids }
            | ActionPayload::BatchDelivery { order_ids, .. } => {
                let Some(&first) = order_ids.first() else {
                    return Err(ValidationError::EmptyBatch);
                };
                if first != order_id {
                    return Err(ValidationError::BatchOrderMismatch {
                        expected: first,
                        actual: order_id,
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// A server mutation waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: Uuid,
    pub order_id: OrderId,
    pub payload: ActionPayload,
    pub created_at: DateTime<Utc>,
    /// Server `updated_at` of the order when the action was queued.
    pub server_snapshot_updated_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl PendingAction {
    pub fn new(order_id: OrderId, payload: ActionPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            payload,
            created_at: Utc::now(),
            server_snapshot_updated_at: None,
            retry_count: 0,
            last_retry_at: None,
        }
    }

    /// Creates a batch action keyed on the batch's first order.
    pub fn batch(payload: ActionPayload) -> Result<Self, ValidationError> {
        let order_id = payload.primary_order().ok_or(ValidationError::EmptyBatch)?;
        Ok(Self::new(order_id, payload))
    }

    pub fn with_snapshot(mut self, updated_at: DateTime<Utc>) -> Self {
        self.server_snapshot_updated_at = Some(updated_at);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.payload.validate(self.order_id)
    }

    /// Whether the backoff since the last failure has elapsed.
    pub fn can_retry(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
        policy.can_retry(self.retry_count, self.last_retry_at, now)
    }

    /// Whether the action has used up its retries.
    pub fn is_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.retry_count >= policy.max_retries()
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_retry_at = Some(now);
    }
}

impl fmt::Display for PendingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} order #{}", self.kind(), self.order_id)?;
        let batch = self.payload.batch_orders();
        if batch.len() > 1 {
            write!(f, " (+{} more)", batch.len() - 1)?;
        }
        if self.retry_count > 0 {
            write!(f, " [retries: {}]", self.retry_count)?;
        }
        Ok(())
    }
}

/// A terminally failed action kept for surfacing to the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub order_id: OrderId,
    pub payload: ActionPayload,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetter {
    pub fn from_action(action: &PendingAction, reason: impl Into<String>) -> Self {
        Self {
            id: action.id,
            order_id: action.order_id,
            payload: action.payload.clone(),
            created_at: action.created_at,
            retry_count: action.retry_count,
            failed_at: Utc::now(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}
