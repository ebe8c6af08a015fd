use clap::Args;
use courier_core::{DriverId, SyncService};

/// Store session tokens issued by the backend
#[derive(Args)]
pub struct LoginCommand {
    /// Access token
    #[arg(long)]
    pub access_token: String,

    /// Refresh token
    #[arg(long)]
    pub refresh_token: String,

    /// Driver this device acts for
    #[arg(long)]
    pub driver_id: Option<DriverId>,
}

impl LoginCommand {
    pub fn run(&self, service: &SyncService) -> Result<(), Box<dyn std::error::Error>> {
        service.login(&self.access_token, &self.refresh_token, self.driver_id)?;
        println!("Credentials saved.");
        if let Some(driver_id) = self.driver_id {
            println!("Active driver: {}", driver_id);
        }
        Ok(())
    }
}

/// Drop credentials and all locally queued data
#[derive(Args)]
pub struct LogoutCommand;

impl LogoutCommand {
    pub async fn run(&self, service: &SyncService) -> Result<(), Box<dyn std::error::Error>> {
        let pending = service.queue().len().await?;
        let samples = service.locations().unsynced_count().await?;

        service.logout().await?;

        println!("Logged out.");
        if pending > 0 || samples > 0 {
            println!(
                "Discarded {} queued action(s) and {} unsent location sample(s).",
                pending, samples
            );
        }
        Ok(())
    }
}
