//! Facade that wires the queue, location buffer and transport together and
//! owns the background sync tasks.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::OrderApi;
use crate::config::ClientConfig;
use crate::credentials::{keys, CredentialError, CredentialStore};
use crate::events::{EventBus, SyncEvent};
use crate::location::{FlushReport, LocationBuffer, LocationError};
use crate::models::{ActionPayload, DriverId, GpsFix, LocationSample, OrderId, PendingAction};
use crate::queue::{ActionQueue, DrainReport, QueueError};
use crate::store::{init_db, ActionRepository, LocationRepository, StoreError};
use crate::transport::{Transport, TransportError};

const TRIGGER_CAPACITY: usize = 8;
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// What asked for a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    ConnectivityRestored,
    Foreground,
    Timer,
    ActionQueued,
    /// Runs even while offline.
    Manual,
}

/// Outcome of one drain pass followed by one location flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub actions: DrainReport,
    /// `None` when the drain halted on an expired session.
    pub locations: Option<FlushReport>,
}

struct Scheduler {
    triggers: mpsc::Sender<SyncTrigger>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct SyncService {
    config: ClientConfig,
    transport: Arc<Transport>,
    queue: Arc<ActionQueue>,
    locations: Arc<LocationBuffer>,
    events: EventBus,
    online: Arc<AtomicBool>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl SyncService {
    /// Opens (or creates) the database at `db_path` and builds the service.
    pub async fn open(
        config: ClientConfig,
        db_path: &Path,
        credentials: Arc<dyn CredentialStore>,
    ) -> ServiceResult<Self> {
        let pool = init_db(db_path).await?;
        Self::new(config, pool, credentials)
    }

    pub fn new(
        config: ClientConfig,
        pool: SqlitePool,
        credentials: Arc<dyn CredentialStore>,
    ) -> ServiceResult<Self> {
        let events = EventBus::new(config.event_capacity);
        let transport = Arc::new(Transport::new(&config, credentials, events.clone())?);

        let queue = ActionQueue::new(
            ActionRepository::new(pool.clone()),
            OrderApi::new(transport.clone()),
            config.queue_retry,
            events.clone(),
        );
        let locations = LocationBuffer::new(
            LocationRepository::new(pool),
            OrderApi::new(transport.clone()),
            config.location.clone(),
            config.queue_retry,
        );

        Ok(Self {
            config,
            transport,
            queue: Arc::new(queue),
            locations: Arc::new(locations),
            events,
            online: Arc::new(AtomicBool::new(true)),
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn locations(&self) -> &Arc<LocationBuffer> {
        &self.locations
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.lock_scheduler().is_some()
    }

    /// Persists an action and nudges the drain loop.
    pub async fn enqueue(&self, action: PendingAction) -> ServiceResult<PendingAction> {
        let action = self.queue.enqueue(action).await?;
        self.nudge(SyncTrigger::ActionQueued);
        Ok(action)
    }

    pub async fn enqueue_action(
        &self,
        order_id: OrderId,
        payload: ActionPayload,
    ) -> ServiceResult<PendingAction> {
        let action = self.queue.enqueue_action(order_id, payload).await?;
        self.nudge(SyncTrigger::ActionQueued);
        Ok(action)
    }

    pub async fn record_location(&self, sample: LocationSample) -> ServiceResult<LocationSample> {
        Ok(self.locations.record(sample).await?)
    }

    /// Runs one drain pass and one location flush right now.
    pub async fn sync_now(&self) -> ServiceResult<SyncReport> {
        sync_pass(&self.queue, &self.locations).await
    }

    /// Starts the drain loop and periodic timer. Returns `false` if they are
    /// already running.
    pub fn start(&self) -> bool {
        let mut slot = self.lock_scheduler();
        if slot.is_some() {
            return false;
        }

        let (triggers, trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let drain = tokio::spawn(run_drain_loop(
            self.queue.clone(),
            self.locations.clone(),
            self.online.clone(),
            trigger_rx,
            shutdown_rx.clone(),
        ));
        let timer = tokio::spawn(run_timer(
            triggers.clone(),
            self.config.drain_interval,
            shutdown_rx,
        ));

        *slot = Some(Scheduler {
            triggers,
            shutdown,
            tasks: vec![drain, timer],
        });
        info!(
            interval_secs = self.config.drain_interval.as_secs(),
            "sync service started"
        );
        true
    }

    /// Records a connectivity change. Coming back online triggers a pass.
    pub fn notify_connectivity(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }
        if online {
            info!("connectivity restored");
            self.nudge(SyncTrigger::ConnectivityRestored);
        } else {
            info!("connectivity lost");
        }
    }

    pub fn notify_foreground(&self) {
        self.nudge(SyncTrigger::Foreground);
    }

    /// Asks the running drain loop for a pass, even while offline.
    pub fn request_sync(&self) {
        self.nudge(SyncTrigger::Manual);
    }

    /// Probes the backend and records the result as the connectivity state.
    pub async fn probe_connectivity(&self) -> bool {
        let online = self.transport.probe().await;
        self.notify_connectivity(online);
        online
    }

    pub fn start_tracking(
        &self,
        driver_id: DriverId,
        fixes: mpsc::Receiver<GpsFix>,
    ) -> ServiceResult<()> {
        self.locations.start_tracking(driver_id, fixes)?;
        self.transport
            .credentials()
            .write(keys::ACTIVE_DRIVER_ID, &driver_id.to_string())?;
        Ok(())
    }

    pub async fn stop_tracking_and_clear(&self) -> ServiceResult<u64> {
        let purged = self.locations.stop_tracking_and_clear().await?;
        self.transport.credentials().delete(keys::ACTIVE_DRIVER_ID)?;
        Ok(purged)
    }

    /// Sends the availability toggle directly, bypassing the queue, and
    /// stores the acknowledged value.
    pub async fn set_availability(&self, available: bool) -> ServiceResult<bool> {
        let acknowledged = OrderApi::new(self.transport.clone())
            .set_availability(available)
            .await?;
        self.transport
            .credentials()
            .write(keys::ONLINE_STATUS, if acknowledged { "true" } else { "false" })?;
        info!(available = acknowledged, "driver availability updated");
        Ok(acknowledged)
    }

    pub fn login(
        &self,
        access_token: &str,
        refresh_token: &str,
        driver_id: Option<DriverId>,
    ) -> ServiceResult<()> {
        let credentials = self.transport.credentials();
        credentials.write(keys::ACCESS_TOKEN, access_token)?;
        credentials.write(keys::REFRESH_TOKEN, refresh_token)?;
        if let Some(driver_id) = driver_id {
            credentials.write(keys::ACTIVE_DRIVER_ID, &driver_id.to_string())?;
        }
        info!(driver_id = ?driver_id, "credentials stored");
        Ok(())
    }

    /// Stops every background task, drops credentials and purges both stores.
    pub async fn logout(&self) -> ServiceResult<()> {
        let tasks = self.stop_scheduler();
        self.locations.stop_tracking();
        self.transport.cancel_pending_refresh().await;
        futures::future::join_all(tasks).await;

        self.transport.credentials().clear_all()?;
        self.queue.purge().await?;
        let purged = self.locations.purge().await?;
        info!(purged_samples = purged, "logged out");
        Ok(())
    }

    /// Stops the scheduler and tracking, keeping all stored data.
    pub async fn shutdown(&self) {
        let tasks = self.stop_scheduler();
        self.locations.stop_tracking();
        futures::future::join_all(tasks).await;
        info!("sync service stopped");
    }

    fn nudge(&self, trigger: SyncTrigger) {
        let slot = self.lock_scheduler();
        let Some(scheduler) = slot.as_ref() else {
            return;
        };
        match scheduler.triggers.try_send(trigger) {
            Ok(()) => debug!(?trigger, "sync pass requested"),
            Err(TrySendError::Full(_)) => debug!(?trigger, "sync pass already pending"),
            Err(TrySendError::Closed(_)) => debug!(?trigger, "drain loop is gone"),
        }
    }

    fn stop_scheduler(&self) -> Vec<JoinHandle<()>> {
        match self.lock_scheduler().take() {
            Some(scheduler) => {
                let _ = scheduler.shutdown.send(true);
                scheduler.tasks
            }
            None => Vec::new(),
        }
    }

    fn lock_scheduler(&self) -> std::sync::MutexGuard<'_, Option<Scheduler>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn sync_pass(queue: &ActionQueue, locations: &LocationBuffer) -> ServiceResult<SyncReport> {
    let actions = queue.drain().await?;
    if actions.halted {
        return Ok(SyncReport {
            actions,
            locations: None,
        });
    }
    let locations = locations.flush().await?;
    Ok(SyncReport {
        actions,
        locations: Some(locations),
    })
}

async fn run_drain_loop(
    queue: Arc<ActionQueue>,
    locations: Arc<LocationBuffer>,
    online: Arc<AtomicBool>,
    mut triggers: mpsc::Receiver<SyncTrigger>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let trigger = tokio::select! {
            _ = shutdown.changed() => break,
            trigger = triggers.recv() => match trigger {
                Some(trigger) => trigger,
                None => break,
            },
        };

        if trigger != SyncTrigger::Manual && !online.load(Ordering::SeqCst) {
            debug!(?trigger, "offline, skipping sync pass");
            continue;
        }

        match sync_pass(&queue, &locations).await {
            Ok(report) => debug!(
                ?trigger,
                resolved = report.actions.resolved(),
                halted = report.actions.halted,
                "sync pass finished"
            ),
            Err(e) => warn!(?trigger, error = %e, "sync pass failed"),
        }
    }
    debug!("drain loop stopped");
}

async fn run_timer(
    triggers: mpsc::Sender<SyncTrigger>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period.max(MIN_TIMER_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(TrySendError::Closed(_)) = triggers.try_send(SyncTrigger::Timer) {
                    break;
                }
            }
        }
    }
}
