use courier_core::{ClientConfig, DriverId, LocationConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Backend connection settings
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub url: ConfigValue<String>,
    pub connect_timeout_secs: u64,
    pub receive_timeout_secs: u64,
}

/// Background sync and location buffering settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub drain_interval_secs: u64,
    pub batch_size: usize,
    pub max_buffered: usize,
    pub max_age_hours: u64,
    pub sampling_interval_secs: u64,
    pub upload_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            drain_interval_secs: 60,
            batch_size: 50,
            max_buffered: 5000,
            max_age_hours: 24,
            sampling_interval_secs: 10,
            upload_interval_secs: 30,
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite database holding queued actions and samples
    pub database_path: ConfigValue<PathBuf>,
    /// Path to the JSON credential file
    pub credentials_path: ConfigValue<PathBuf>,
    /// Driver used when a command doesn't name one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<ConfigValue<DriverId>>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub server: ServerConfig,
    pub sync: SyncSettings,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    credentials_path: Option<PathBuf>,
    driver_id: Option<DriverId>,
    server: Option<ServerFile>,
    sync: Option<SyncSettings>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ServerFile {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
    receive_timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let data_dir = Self::default_data_dir();

        let mut database_path =
            ConfigValue::new(data_dir.join("courier.db"), ConfigSource::Default);
        let mut credentials_path =
            ConfigValue::new(data_dir.join("credentials.json"), ConfigSource::Default);
        let mut server_url = ConfigValue::new(DEFAULT_SERVER_URL.to_string(), ConfigSource::Default);
        let mut driver_id = None;
        let mut connect_timeout_secs = 10;
        let mut receive_timeout_secs = 30;
        let mut config_file = None;
        let mut sync = SyncSettings::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                database_path = ConfigValue::new(resolve(&path, db_path), ConfigSource::File);
            }
            if let Some(creds_path) = file_config.credentials_path {
                credentials_path = ConfigValue::new(resolve(&path, creds_path), ConfigSource::File);
            }
            if let Some(id) = file_config.driver_id {
                driver_id = Some(ConfigValue::new(id, ConfigSource::File));
            }
            if let Some(server) = file_config.server {
                if let Some(url) = server.url {
                    server_url = ConfigValue::new(url, ConfigSource::File);
                }
                connect_timeout_secs = server.connect_timeout_secs.unwrap_or(connect_timeout_secs);
                receive_timeout_secs = server.receive_timeout_secs.unwrap_or(receive_timeout_secs);
            }
            if let Some(sync_settings) = file_config.sync {
                sync = sync_settings;
            }
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("COURIER_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(creds_path) = std::env::var("COURIER_CREDENTIALS_PATH") {
            credentials_path =
                ConfigValue::new(PathBuf::from(creds_path), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("COURIER_SERVER_URL") {
            server_url = ConfigValue::new(url, ConfigSource::Environment);
        }
        if let Ok(raw) = std::env::var("COURIER_DRIVER_ID") {
            let id = raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue("COURIER_DRIVER_ID", raw.clone()))?;
            driver_id = Some(ConfigValue::new(id, ConfigSource::Environment));
        }

        Ok(Self {
            database_path,
            credentials_path,
            driver_id,
            config_file,
            server: ServerConfig {
                url: server_url,
                connect_timeout_secs,
                receive_timeout_secs,
            },
            sync,
        })
    }

    /// Builds the core client configuration from these settings.
    pub fn client_config(&self) -> ClientConfig {
        let location = LocationConfig::default()
            .with_batch_size(self.sync.batch_size)
            .with_retention(
                self.sync.max_buffered,
                Duration::from_secs(self.sync.max_age_hours.saturating_mul(3600)),
            )
            .with_sampling_interval(Duration::from_secs(self.sync.sampling_interval_secs))
            .with_upload_interval(Duration::from_secs(self.sync.upload_interval_secs));

        ClientConfig::new(self.server.url.value.clone())
            .with_connect_timeout(Duration::from_secs(self.server.connect_timeout_secs))
            .with_receive_timeout(Duration::from_secs(self.server.receive_timeout_secs))
            .with_drain_interval(Duration::from_secs(self.sync.drain_interval_secs))
            .with_location(location)
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/courier/
    /// - macOS: ~/Library/Application Support/courier/
    /// - Windows: %APPDATA%/courier/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("courier")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/courier/
    /// - macOS: ~/Library/Application Support/courier/
    /// - Windows: %APPDATA%/courier/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("courier")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

// Relative paths resolve against the config file's directory
fn resolve(config_path: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() {
        config_path
            .parent()
            .map(|p| p.join(&path))
            .unwrap_or(path)
    } else {
        path
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(name, value) => {
                write!(f, "Invalid value for {}: '{}'", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
