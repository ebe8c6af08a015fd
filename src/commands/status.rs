use clap::Args;
use courier_core::{keys, CredentialStore, SyncService};

use crate::config::Config;

/// Show queued work and session state
#[derive(Args)]
pub struct StatusCommand {
    /// List every pending action and dead letter
    #[arg(long, short)]
    pub verbose: bool,
}

impl StatusCommand {
    pub async fn run(
        &self,
        service: &SyncService,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let credentials = service.transport().credentials();
        let pending = service.queue().pending().await?;
        let dead_letters = service.queue().dead_letters().await?;
        let unsynced = service.locations().unsynced_count().await?;

        println!("Courier Status");
        println!("==============");
        println!();
        println!("Server:      {}", config.server.url.value);
        println!(
            "Session:     {}",
            if credentials.read(keys::ACCESS_TOKEN).is_some() {
                "logged in"
            } else {
                "logged out"
            }
        );
        if let Some(driver) = credentials.read(keys::ACTIVE_DRIVER_ID) {
            println!("Driver:      {}", driver);
        }
        if let Some(online) = credentials.read(keys::ONLINE_STATUS) {
            println!(
                "Available:   {}",
                if online == "true" { "yes" } else { "no" }
            );
        }
        println!();
        println!("Pending actions:    {}", pending.len());
        println!("Failed actions:     {}", dead_letters.len());
        println!("Unsent locations:   {}", unsynced);

        if self.verbose {
            if !pending.is_empty() {
                println!();
                println!("Pending:");
                for action in &pending {
                    println!(
                        "  {}  {}",
                        action.created_at.format("%Y-%m-%d %H:%M:%S"),
                        action
                    );
                }
            }
            if !dead_letters.is_empty() {
                println!();
                println!("Failed:");
                for letter in &dead_letters {
                    println!(
                        "  {}  {} order #{}: {}",
                        letter.failed_at.format("%Y-%m-%d %H:%M:%S"),
                        letter.kind(),
                        letter.order_id,
                        letter.reason
                    );
                }
            }
        }

        Ok(())
    }
}
