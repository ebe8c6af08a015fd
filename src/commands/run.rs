use std::time::Duration;

use clap::Args;
use courier_core::{SyncEvent, SyncService};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Run the background sync service until interrupted
#[derive(Args)]
pub struct RunCommand {
    /// Seconds between connectivity probes
    #[arg(long, default_value_t = 15)]
    pub probe_interval: u64,
}

impl RunCommand {
    pub async fn run(&self, service: &SyncService) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = service.subscribe();

        service.probe_connectivity().await;
        service.start();
        info!(
            online = service.is_online(),
            "courier service running, press Ctrl-C to stop"
        );

        let mut probe = tokio::time::interval(Duration::from_secs(self.probe_interval.max(1)));
        probe.tick().await;

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => break,
                _ = probe.tick() => {
                    service.probe_connectivity().await;
                }
                event = events.recv() => match event {
                    Ok(SyncEvent::SessionExpired) => {
                        warn!("session expired, log in again to resume syncing");
                        break;
                    }
                    Ok(event) => info!("{}", event),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed sync events"),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        service.shutdown().await;
        Ok(())
    }
}
