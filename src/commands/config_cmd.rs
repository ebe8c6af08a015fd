use clap::{Args, Subcommand, ValueEnum};

use crate::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("database_path: {}", config.database_path.value.display());
                        println!("  source: {}", config.database_path.source);
                        println!();

                        println!(
                            "credentials_path: {}",
                            config.credentials_path.value.display()
                        );
                        println!("  source: {}", config.credentials_path.source);
                        println!();

                        println!("server.url: {}", config.server.url.value);
                        println!("  source: {}", config.server.url.source);
                        println!(
                            "server timeouts: connect {}s, receive {}s",
                            config.server.connect_timeout_secs, config.server.receive_timeout_secs
                        );
                        println!();

                        if let Some(driver) = &config.driver_id {
                            println!("driver_id: {}", driver.value);
                            println!("  source: {}", driver.source);
                            println!();
                        }

                        let sync = &config.sync;
                        println!("sync:");
                        println!("  drain_interval_secs: {}", sync.drain_interval_secs);
                        println!("  batch_size: {}", sync.batch_size);
                        println!("  max_buffered: {}", sync.max_buffered);
                        println!("  max_age_hours: {}", sync.max_age_hours);
                        println!("  sampling_interval_secs: {}", sync.sampling_interval_secs);
                        println!("  upload_interval_secs: {}", sync.upload_interval_secs);
                    }
                }
                Ok(())
            }
        }
    }
}
