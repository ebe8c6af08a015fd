//! Decides whether a queued action is still valid against live server state.

use crate::api::OrderLookup;
use crate::models::PendingAction;

/// Verdict for a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResult {
    /// Safe to send.
    NoConflict,
    /// The order changed after the action was queued; discard the action.
    ServerWins,
    /// The order no longer exists; discard the action.
    ResourceNotFound,
    /// The lookup failed; leave the action for a later pass.
    NetworkError,
}

/// Pure comparison of a queued snapshot with live state.
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn check(action: &PendingAction, live: &OrderLookup) -> ConflictResult {
        let live_updated_at = match live {
            OrderLookup::Failed(_) => return ConflictResult::NetworkError,
            OrderLookup::NotFound => return ConflictResult::ResourceNotFound,
            OrderLookup::Found(updated_at) => updated_at,
        };

        let Some(snapshot) = action.server_snapshot_updated_at else {
            return ConflictResult::NoConflict;
        };

        match live_updated_at {
            Some(live) if *live > snapshot => ConflictResult::ServerWins,
            _ => ConflictResult::NoConflict,
        }
    }
}
