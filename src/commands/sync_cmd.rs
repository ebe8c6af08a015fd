//! One-shot sync: drain the action queue and flush buffered locations.

use clap::Args;
use courier_core::{SyncEvent, SyncReport, SyncService};
use tokio::sync::broadcast::error::TryRecvError;

/// Send queued actions and location samples now
#[derive(Args)]
pub struct SyncCommand;

impl SyncCommand {
    pub async fn run(&self, service: &SyncService) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = service.subscribe();

        println!("Syncing with {}...", service.transport().base_url());
        println!();

        let report = service.sync_now().await?;
        print_report(&report);

        let mut printed_header = false;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    if !printed_header {
                        println!();
                        printed_header = true;
                    }
                    println!("  {} {}", marker(&event), event);
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    println!("  ... {} earlier event(s) not shown", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        Ok(())
    }
}

fn print_report(report: &SyncReport) {
    let actions = &report.actions;
    if actions.skipped_reentrant {
        println!("Another sync pass is already running.");
        return;
    }
    println!(
        "Actions:   {} sent, {} discarded, {} failed, {} retrying, {} waiting",
        actions.succeeded,
        actions.discarded,
        actions.failed_permanently,
        actions.retried,
        actions.deferred
    );
    if actions.halted {
        println!("Session expired. Log in again to continue syncing.");
    }

    match &report.locations {
        Some(flush) => {
            println!(
                "Locations: {} uploaded, {} remaining",
                flush.uploaded, flush.remaining
            );
            if flush.dropped > 0 {
                println!("  {} old sample(s) dropped by the retention limit", flush.dropped);
            }
            if let Some(err) = &flush.error {
                println!("  upload stopped: {}", err);
            }
        }
        None => println!("Locations: skipped"),
    }
}

fn marker(event: &SyncEvent) -> &'static str {
    match event {
        SyncEvent::ActionSucceeded { .. } => "✓",
        SyncEvent::ActionDiscarded { .. } => "-",
        SyncEvent::ActionFailedPermanently { .. } | SyncEvent::SessionExpired => "✗",
    }
}
