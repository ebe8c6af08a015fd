//! Durable GPS sample buffer and its background uploader.
//!
//! Samples are persisted before anything touches the network and uploaded in
//! capture order. A batch stops at the first failed sample so a later sample
//! never reaches the server ahead of an earlier one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::OrderApi;
use crate::config::LocationConfig;
use crate::models::{DriverId, GpsFix, LocationSample, ValidationError};
use crate::retry::RetryPolicy;
use crate::store::{LocationRepository, StoreError};
use crate::transport::TransportError;

const MIN_RETRY_WAIT: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum LocationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid location sample: {0}")]
    Invalid(#[from] ValidationError),

    #[error("location tracking is already running for driver {0}")]
    AlreadyTracking(DriverId),
}

pub type LocationResult<T> = Result<T, LocationError>;

/// Outcome of one upload cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub uploaded: usize,
    /// Samples dropped by the retention bound since the previous flush.
    pub dropped: u64,
    /// Unsynced samples left after the cycle.
    pub remaining: usize,
    /// Tracking stopped mid-cycle and the results were thrown away.
    pub discarded: bool,
    /// The failure that ended the batch early, if any.
    pub error: Option<TransportError>,
}

struct TrackingHandle {
    driver_id: DriverId,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TrackingHandle {
    fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

pub struct LocationBuffer {
    repo: LocationRepository,
    api: OrderApi,
    config: LocationConfig,
    policy: RetryPolicy,
    flushing: tokio::sync::Mutex<()>,
    tracking: Mutex<Option<TrackingHandle>>,
    generation: AtomicU64,
    dropped: AtomicU64,
}

impl LocationBuffer {
    pub fn new(
        repo: LocationRepository,
        api: OrderApi,
        config: LocationConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            api,
            config,
            policy,
            flushing: tokio::sync::Mutex::new(()),
            tracking: Mutex::new(None),
            generation: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LocationConfig {
        &self.config
    }

    /// Persists a sample. Never waits on the network.
    pub async fn record(&self, sample: LocationSample) -> LocationResult<LocationSample> {
        sample.validate()?;
        self.repo.insert(&sample).await?;
        debug!(driver_id = sample.driver_id, sample_id = %sample.id, "location sample recorded");

        let dropped = self.enforce_retention().await?;
        self.dropped.fetch_add(dropped, Ordering::SeqCst);
        Ok(sample)
    }

    pub async fn unsynced_count(&self) -> LocationResult<usize> {
        Ok(self.repo.unsynced_count().await?)
    }

    /// Unsynced samples for a driver, oldest first.
    pub async fn pending(&self, driver_id: DriverId) -> LocationResult<Vec<LocationSample>> {
        Ok(self.repo.pending_for_driver(driver_id).await?)
    }

    pub async fn purge(&self) -> LocationResult<u64> {
        Ok(self.repo.purge().await?)
    }

    /// Runs one upload cycle.
    pub async fn flush(&self) -> LocationResult<FlushReport> {
        let _flushing = self.flushing.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);

        let dropped = self.enforce_retention().await? + self.dropped.swap(0, Ordering::SeqCst);
        let batch = self.repo.unsynced_batch(self.config.batch_size).await?;

        let mut uploaded = Vec::with_capacity(batch.len());
        let mut error = None;
        for sample in &batch {
            match self.api.upload_location(sample).await {
                Ok(()) => uploaded.push(sample.id),
                Err(err) => {
                    warn!(
                        sample_id = %sample.id,
                        captured_at = %sample.captured_at,
                        error = %err,
                        "location upload failed, holding remaining samples"
                    );
                    error = Some(err);
                    break;
                }
            }
        }

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("tracking stopped during upload, discarding results");
            return Ok(FlushReport {
                dropped,
                discarded: true,
                ..FlushReport::default()
            });
        }

        if !uploaded.is_empty() {
            self.repo.mark_synced(&uploaded).await?;
            self.repo.prune_synced().await?;
        }
        let remaining = self.repo.unsynced_count().await?;

        if !uploaded.is_empty() {
            debug!(uploaded = uploaded.len(), remaining, "location samples uploaded");
        }
        Ok(FlushReport {
            uploaded: uploaded.len(),
            dropped,
            remaining,
            discarded: false,
            error,
        })
    }

    /// Drops unsynced samples past the age and size bounds.
    async fn enforce_retention(&self) -> LocationResult<u64> {
        let mut dropped = 0;

        let max_age = chrono::Duration::from_std(self.config.max_age).ok();
        if let Some(cutoff) = max_age.and_then(|age| Utc::now().checked_sub_signed(age)) {
            let stale = self.repo.drop_older_than(cutoff).await?;
            if stale > 0 {
                warn!(
                    dropped = stale,
                    max_age_secs = self.config.max_age.as_secs(),
                    "dropped location samples older than retention window"
                );
            }
            dropped += stale;
        }

        let overflow = self.repo.drop_oldest_unsynced(self.config.max_buffered).await?;
        if overflow > 0 {
            warn!(
                dropped = overflow,
                max_buffered = self.config.max_buffered,
                "location buffer full, dropped oldest samples"
            );
        }
        Ok(dropped + overflow)
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(TrackingHandle::is_running)
    }

    pub fn tracking_driver(&self) -> Option<DriverId> {
        self.tracking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|handle| handle.is_running())
            .map(|handle| handle.driver_id)
    }

    /// Starts the GPS producer and the uploader for `driver_id`.
    pub fn start_tracking(
        self: &Arc<Self>,
        driver_id: DriverId,
        fixes: mpsc::Receiver<GpsFix>,
    ) -> LocationResult<()> {
        let mut tracking = self.tracking.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = tracking.as_ref().filter(|h| h.is_running()) {
            return Err(LocationError::AlreadyTracking(handle.driver_id));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let producer = tokio::spawn(run_producer(
            self.clone(),
            driver_id,
            fixes,
            shutdown_rx.clone(),
        ));
        let uploader = tokio::spawn(run_uploader(self.clone(), shutdown_rx));

        *tracking = Some(TrackingHandle {
            driver_id,
            shutdown,
            tasks: vec![producer, uploader],
        });
        info!(driver_id, "location tracking started");
        Ok(())
    }

    /// Stops the producer and uploader, keeping buffered samples. Returns the
    /// driver that was being tracked.
    pub fn stop_tracking(&self) -> Option<DriverId> {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let handle = self
            .tracking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let _ = handle.shutdown.send(true);
        info!(driver_id = handle.driver_id, "location tracking stopped");
        Some(handle.driver_id)
    }

    /// Stops tracking and deletes the active driver's buffered samples. An
    /// upload already in flight may finish but its result is ignored.
    pub async fn stop_tracking_and_clear(&self) -> LocationResult<u64> {
        let Some(driver_id) = self.stop_tracking() else {
            return Ok(0);
        };
        let purged = self.repo.purge_driver(driver_id).await?;
        info!(driver_id, purged, "cleared buffered location samples");
        Ok(purged)
    }
}

async fn run_producer(
    buffer: Arc<LocationBuffer>,
    driver_id: DriverId,
    mut fixes: mpsc::Receiver<GpsFix>,
    mut shutdown: watch::Receiver<bool>,
) {
    let spacing = chrono::Duration::from_std(buffer.config.sampling_interval)
        .unwrap_or_else(|_| chrono::Duration::zero());
    let mut last_recorded: Option<DateTime<Utc>> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            fix = fixes.recv() => {
                let Some(fix) = fix else { break };
                if let Some(last) = last_recorded {
                    if fix.captured_at < last + spacing {
                        continue;
                    }
                }
                match buffer.record(fix.into_sample(driver_id)).await {
                    Ok(sample) => last_recorded = Some(sample.captured_at),
                    Err(e) => warn!(driver_id, error = %e, "failed to record location fix"),
                }
            }
        }
    }
    debug!(driver_id, "location producer stopped");
}

async fn run_uploader(buffer: Arc<LocationBuffer>, mut shutdown: watch::Receiver<bool>) {
    let mut failures: u32 = 0;

    loop {
        let wait = if failures == 0 {
            buffer.config.upload_interval
        } else {
            let attempt = (failures - 1).min(buffer.policy.max_retries().saturating_sub(1));
            buffer.policy.delay_for_attempt(attempt).max(MIN_RETRY_WAIT)
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        match buffer.flush().await {
            Ok(report) if report.discarded => break,
            Ok(FlushReport { error: Some(_), .. }) => failures = failures.saturating_add(1),
            Ok(_) => failures = 0,
            Err(e) => {
                warn!(error = %e, "location flush failed");
                failures = failures.saturating_add(1);
            }
        }
    }
    debug!("location uploader stopped");
}
