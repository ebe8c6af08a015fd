use clap::{Args, ValueEnum};
use courier_core::SyncService;

#[derive(Clone, Copy, ValueEnum)]
pub enum Availability {
    On,
    Off,
}

/// Toggle whether the driver accepts new orders
#[derive(Args)]
pub struct AvailabilityCommand {
    #[arg(value_enum)]
    pub state: Availability,
}

impl AvailabilityCommand {
    pub async fn run(&self, service: &SyncService) -> Result<(), Box<dyn std::error::Error>> {
        let requested = matches!(self.state, Availability::On);
        let acknowledged = service.set_availability(requested).await?;
        println!(
            "Driver is now {}.",
            if acknowledged { "available" } else { "unavailable" }
        );
        Ok(())
    }
}
