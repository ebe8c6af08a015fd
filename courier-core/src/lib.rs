//! Courier Core Library
//!
//! Offline resilience for the courier driver client: a durable action queue
//! with conflict checks, a buffered location uploader, and an HTTP transport
//! that refreshes expired sessions transparently.

pub mod api;
pub mod config;
pub mod conflict;
pub mod credentials;
pub mod events;
pub mod location;
pub mod models;
pub mod queue;
pub mod retry;
pub mod service;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use api::{MutationAck, OrderApi, OrderLookup, OrderView};
pub use config::{ClientConfig, LocationConfig};
pub use conflict::{ConflictResolver, ConflictResult};
pub use credentials::{
    keys, CredentialError, CredentialResult, CredentialStore, FileCredentialStore,
    MemoryCredentialStore,
};
pub use events::{DiscardReason, EventBus, SyncEvent};
pub use location::{FlushReport, LocationBuffer, LocationError, LocationResult};
pub use models::{
    ActionKind, ActionPayload, DeadLetter, DeliveryProof, DriverId, GpsFix, LocationSample,
    OrderId, OrderStatus, PendingAction, ValidationError,
};
pub use queue::{ActionQueue, DrainReport, QueueError, QueueResult};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{ServiceError, ServiceResult, SyncReport, SyncService, SyncTrigger};
pub use store::{init_db, ActionRepository, LocationRepository, StoreError, StoreResult};
pub use transport::{ErrorClass, Request, Response, Transport, TransportError, TransportResult};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
