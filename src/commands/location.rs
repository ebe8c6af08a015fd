use clap::{Args, Subcommand};
use courier_core::{keys, CredentialStore, DriverId, LocationSample, SyncService};

use crate::config::Config;

/// Record and inspect buffered GPS samples
#[derive(Args)]
pub struct LocationCommand {
    #[command(subcommand)]
    pub command: LocationSubcommand,
}

#[derive(Subcommand)]
pub enum LocationSubcommand {
    /// Buffer one GPS sample for upload
    Record {
        /// Latitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        /// Longitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lng: f64,

        /// Horizontal accuracy in meters
        #[arg(long)]
        accuracy: Option<f64>,

        /// Speed in meters per second
        #[arg(long)]
        speed: Option<f64>,

        /// Heading in degrees
        #[arg(long)]
        heading: Option<f64>,

        /// Driver ID (defaults to the configured or logged-in driver)
        #[arg(long)]
        driver: Option<DriverId>,
    },

    /// List samples not yet uploaded for a driver
    Pending {
        /// Driver ID (defaults to the configured or logged-in driver)
        #[arg(long)]
        driver: Option<DriverId>,
    },
}

impl LocationCommand {
    pub async fn run(
        &self,
        service: &SyncService,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            LocationSubcommand::Record {
                lat,
                lng,
                accuracy,
                speed,
                heading,
                driver,
            } => {
                let driver_id = resolve_driver(*driver, service, config)?;
                let mut sample = LocationSample::new(driver_id, *lat, *lng);
                if let Some(meters) = accuracy {
                    sample = sample.with_accuracy(*meters);
                }
                if let Some(mps) = speed {
                    sample = sample.with_speed(*mps);
                }
                if let Some(degrees) = heading {
                    sample = sample.with_heading(*degrees);
                }

                let sample = service.record_location(sample).await?;
                let unsynced = service.locations().unsynced_count().await?;
                println!(
                    "Recorded {:.6}, {:.6} for driver {} ({} awaiting upload)",
                    sample.latitude, sample.longitude, driver_id, unsynced
                );
            }
            LocationSubcommand::Pending { driver } => {
                let driver_id = resolve_driver(*driver, service, config)?;
                let samples = service.locations().pending(driver_id).await?;
                if samples.is_empty() {
                    println!("No samples awaiting upload for driver {}.", driver_id);
                    return Ok(());
                }
                for sample in samples {
                    println!(
                        "{}  {:.6}, {:.6}",
                        sample.captured_at.format("%Y-%m-%d %H:%M:%S"),
                        sample.latitude,
                        sample.longitude
                    );
                }
            }
        }
        Ok(())
    }
}

/// Picks the driver from the flag, then the config, then the stored session.
fn resolve_driver(
    flag: Option<DriverId>,
    service: &SyncService,
    config: &Config,
) -> Result<DriverId, Box<dyn std::error::Error>> {
    if let Some(id) = flag.or(config.driver_id.as_ref().map(|d| d.value)) {
        return Ok(id);
    }
    service
        .transport()
        .credentials()
        .read(keys::ACTIVE_DRIVER_ID)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| "No driver ID. Pass --driver, set COURIER_DRIVER_ID, or log in with --driver-id".into())
}
