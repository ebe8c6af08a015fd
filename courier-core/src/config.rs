//! Configuration for the sync core.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Configuration for the location buffer and its background tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationConfig {
    /// Maximum samples uploaded per flush.
    pub batch_size: usize,
    /// Maximum unsynced samples kept before the oldest are dropped.
    pub max_buffered: usize,
    /// Unsynced samples older than this are dropped.
    pub max_age: Duration,
    /// Minimum spacing between recorded samples while tracking.
    pub sampling_interval: Duration,
    /// How often the uploader flushes while tracking.
    pub upload_interval: Duration,
}

impl LocationConfig {
    /// Sets the upload batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the retention bounds.
    pub fn with_retention(mut self, max_buffered: usize, max_age: Duration) -> Self {
        self.max_buffered = max_buffered;
        self.max_age = max_age;
        self
    }

    /// Sets the producer sampling interval.
    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = interval;
        self
    }

    /// Sets the uploader interval.
    pub fn with_upload_interval(mut self, interval: Duration) -> Self {
        self.upload_interval = interval;
        self
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_buffered: 5000,
            max_age: Duration::from_secs(24 * 60 * 60),
            sampling_interval: Duration::from_secs(10),
            upload_interval: Duration::from_secs(30),
        }
    }
}

/// Configuration for the transport, queue and background scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Backend base URL.
    pub base_url: String,
    /// Per-attempt connect timeout.
    pub connect_timeout: Duration,
    /// Per-attempt receive timeout.
    pub receive_timeout: Duration,
    /// Retries applied inside a single `send`.
    pub transport_retry: RetryPolicy,
    /// Retries applied across drain passes.
    pub queue_retry: RetryPolicy,
    /// Periodic drain timer.
    pub drain_interval: Duration,
    /// Location buffer settings.
    pub location: LocationConfig,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl ClientConfig {
    /// Creates a configuration for the given backend with default settings.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(30),
            transport_retry: RetryPolicy::default(),
            queue_retry: RetryPolicy::default(),
            drain_interval: Duration::from_secs(60),
            location: LocationConfig::default(),
            event_capacity: 64,
        }
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the receive timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Sets the transport-level retry policy.
    pub fn with_transport_retry(mut self, policy: RetryPolicy) -> Self {
        self.transport_retry = policy;
        self
    }

    /// Sets the queue-level retry policy.
    pub fn with_queue_retry(mut self, policy: RetryPolicy) -> Self {
        self.queue_retry = policy;
        self
    }

    /// Sets the periodic drain interval.
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Sets the location settings.
    pub fn with_location(mut self, location: LocationConfig) -> Self {
        self.location = location;
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}
