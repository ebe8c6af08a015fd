use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::{
    open_service, AvailabilityCommand, ConfigCommand, EnqueueCommand, LocationCommand,
    LoginCommand, LogoutCommand, RunCommand, StatusCommand, SyncCommand,
};
use config::Config;

#[derive(Parser)]
#[command(name = "courier")]
#[command(version)]
#[command(about = "Offline-first sync client for courier drivers", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Store session tokens
    Login(LoginCommand),

    /// Clear credentials and local queues
    Logout(LogoutCommand),

    /// Queue an order mutation
    Enqueue(EnqueueCommand),

    /// Record or list GPS samples
    Location(LocationCommand),

    /// Send queued work now
    Sync(SyncCommand),

    /// Show queued work and session state
    Status(StatusCommand),

    /// Set driver availability
    Availability(AvailabilityCommand),

    /// Run the background sync service
    Run(RunCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=info,courier_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Config::load(cli.config)?;

    let command = match cli.command {
        Some(command) => command,
        None => {
            println!("Use --help to see available commands");
            return Ok(());
        }
    };

    // Config inspection must work without a database or credential file
    if let Commands::Config(cmd) = &command {
        return cmd.run(&config);
    }

    let service = open_service(&config).await?;
    match command {
        Commands::Login(cmd) => cmd.run(&service)?,
        Commands::Logout(cmd) => cmd.run(&service).await?,
        Commands::Enqueue(cmd) => cmd.run(&service).await?,
        Commands::Location(cmd) => cmd.run(&service, &config).await?,
        Commands::Sync(cmd) => cmd.run(&service).await?,
        Commands::Status(cmd) => cmd.run(&service, &config).await?,
        Commands::Availability(cmd) => cmd.run(&service).await?,
        Commands::Run(cmd) => cmd.run(&service).await?,
        Commands::Config(cmd) => cmd.run(&config)?,
    }

    Ok(())
}
