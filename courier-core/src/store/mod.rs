//! Durable SQLite storage for the action queue and location buffer.

mod action_repo;
mod location_repo;

pub use action_repo::ActionRepository;
pub use location_repo::LocationRepository;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

/// Errors raised by the durable stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("failed to encode payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to create database directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt row in {table}: {message}")]
    Corrupt {
        table: &'static str,
        message: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Opens the database at `path`, creating it if needed, and runs migrations.
pub async fn init_db(path: &Path) -> StoreResult<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());
    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    tracing::debug!(path = %path.display(), "database ready");
    Ok(pool)
}

pub(crate) fn encode_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode_time(table: &'static str, value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            message: format!("bad timestamp '{}': {}", value, e),
        })
}

pub(crate) fn decode_optional_time(
    table: &'static str,
    value: Option<&str>,
) -> StoreResult<Option<DateTime<Utc>>> {
    value.map(|v| decode_time(table, v)).transpose()
}

pub(crate) fn decode_uuid(table: &'static str, value: &str) -> StoreResult<uuid::Uuid> {
    uuid::Uuid::parse_str(value).map_err(|e| StoreError::Corrupt {
        table,
        message: format!("bad id '{}': {}", value, e),
    })
}
