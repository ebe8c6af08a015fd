mod action;
mod location;
mod order;

pub use action::{ActionKind, ActionPayload, DeadLetter, DeliveryProof, PendingAction};
pub use location::{GpsFix, LocationSample};
pub use order::{DriverId, OrderId, OrderStatus};

use thiserror::Error;

/// Errors raised when a queued item is malformed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("batch must contain at least one order")]
    EmptyBatch,

    #[error("batch action must be keyed on its first order #{expected}, got #{actual}")]
    BatchOrderMismatch { expected: OrderId, actual: OrderId },

    #[error("rejection requires a reason")]
    MissingReason,

    #[error("invalid {field}: {value}")]
    InvalidCoordinate { field: &'static str, value: f64 },
}
