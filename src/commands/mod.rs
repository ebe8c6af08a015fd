mod auth;
mod availability;
mod config_cmd;
mod enqueue;
mod location;
mod run;
mod status;
mod sync_cmd;

pub use auth::{LoginCommand, LogoutCommand};
pub use availability::AvailabilityCommand;
pub use config_cmd::ConfigCommand;
pub use enqueue::EnqueueCommand;
pub use location::LocationCommand;
pub use run::RunCommand;
pub use status::StatusCommand;
pub use sync_cmd::SyncCommand;

use std::sync::Arc;

use courier_core::{FileCredentialStore, SyncService};

use crate::config::Config;

/// Opens the credential file and database named by the configuration.
pub async fn open_service(config: &Config) -> Result<SyncService, Box<dyn std::error::Error>> {
    let credentials = FileCredentialStore::open(config.credentials_path.value.clone())?;
    let service = SyncService::open(
        config.client_config(),
        &config.database_path.value,
        Arc::new(credentials),
    )
    .await?;
    Ok(service)
}
