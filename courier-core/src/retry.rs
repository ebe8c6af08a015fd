//! Retry policy shared by the transport and the action queue.
//!
//! Backoff is exponential with a base of one second and a factor of two,
//! giving delays of 1s, 2s and 4s for attempts 0, 1 and 2. Attempt 3 gives up.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::transport::ErrorClass;

/// Maximum number of retries before an operation is abandoned.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
const BACKOFF_FACTOR: u32 = 2;

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after waiting the given delay.
    Retry(Duration),
    /// Stop retrying and surface the failure.
    GiveUp,
}

/// Exponential backoff schedule keyed by error class and attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_retries: u32,
}

impl RetryPolicy {
    /// Creates a policy with the given base delay and retry ceiling.
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    /// Sets the base delay, keeping the retry ceiling.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides whether attempt `attempt` (0-indexed) that failed with `class`
    /// should be retried, and after how long.
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
        if !class.is_retryable() || attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for_attempt(attempt))
    }

    /// Backoff delay following failed attempt `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(BACKOFF_FACTOR.saturating_pow(attempt))
    }

    /// Earliest instant at which an item that has failed `retry_count` times,
    /// most recently at `last_retry_at`, becomes eligible again. `None` means
    /// it is eligible now.
    pub fn ready_at(
        &self,
        retry_count: u32,
        last_retry_at: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let last = last_retry_at?;
        if retry_count == 0 {
            return None;
        }
        let wait = chrono::Duration::from_std(self.delay_for_attempt(retry_count - 1))
            .unwrap_or_else(|_| chrono::Duration::zero());
        Some(last + wait)
    }

    /// Whether the backoff for an item has elapsed by `now`.
    pub fn can_retry(
        &self,
        retry_count: u32,
        last_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        match self.ready_at(retry_count, last_retry_at) {
            Some(ready) => now >= ready,
            None => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES)
    }
}
