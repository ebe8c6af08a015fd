//! Credential storage.
//!
//! The platform keystore is an external collaborator; the core talks to it
//! through [`CredentialStore`]. Reads are served from memory and never block
//! on a lock held across I/O by the refresh path.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

/// Well-known credential keys.
pub mod keys {
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    /// Driver availability as last acknowledged by the server ("true"/"false").
    pub const ONLINE_STATUS: &str = "is_online";
    pub const ACTIVE_DRIVER_ID: &str = "active_driver_id";

    pub const ALL: [&str; 4] = [ACCESS_TOKEN, REFRESH_TOKEN, ONLINE_STATUS, ACTIVE_DRIVER_ID];
}

/// Errors raised while persisting credentials.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("failed to access credential file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential file '{path}' is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type CredentialResult<T> = Result<T, CredentialError>;

/// Durable key-value store for tokens and small session flags.
pub trait CredentialStore: Send + Sync {
    fn read(&self, key: &str) -> Option<String>;
    fn write(&self, key: &str, value: &str) -> CredentialResult<()>;
    fn delete(&self, key: &str) -> CredentialResult<()>;

    /// Removes the access and refresh tokens.
    fn clear_tokens(&self) -> CredentialResult<()> {
        self.delete(keys::ACCESS_TOKEN)?;
        self.delete(keys::REFRESH_TOKEN)
    }

    /// Removes every well-known key.
    fn clear_all(&self) -> CredentialResult<()> {
        for key in keys::ALL {
            self.delete(key)?;
        }
        Ok(())
    }
}

/// In-memory store, used in tests and for ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with an access and refresh token.
    pub fn with_tokens(access: &str, refresh: &str) -> Self {
        let store = Self::new();
        {
            let mut values = store.values.write().unwrap_or_else(PoisonError::into_inner);
            values.insert(keys::ACCESS_TOKEN.to_string(), access.to_string());
            values.insert(keys::REFRESH_TOKEN.to_string(), refresh.to_string());
        }
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn read(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn write(&self, key: &str, value: &str) -> CredentialResult<()> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> CredentialResult<()> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// JSON file store. Every write rewrites the file atomically.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    values: RwLock<HashMap<String, String>>,
}

impl FileCredentialStore {
    /// Opens the store at `path`, creating parent directories as needed.
    /// A missing file is treated as an empty store.
    pub fn open(path: impl Into<PathBuf>) -> CredentialResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CredentialError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let values = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => HashMap::new(),
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|source| CredentialError::Corrupt {
                    path: path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => {
                return Err(CredentialError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &HashMap<String, String>) -> CredentialResult<()> {
        let io_err = |source| CredentialError::Io {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_string_pretty(values).map_err(|source| {
            CredentialError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;

        let tmp = self.path.with_extension("tmp");
        let mut file = create_private(&tmp).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

/// Opens `path` for writing, truncated and readable by the owner only,
/// before any content goes in.
fn create_private(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options.open(path)?;

    // mode only applies on creation; a leftover file keeps its old bits
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

impl CredentialStore for FileCredentialStore {
    fn read(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn write(&self, key: &str, value: &str) -> CredentialResult<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn delete(&self, key: &str) -> CredentialResult<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::with_tokens("access", "refresh");
        assert_eq!(store.read(keys::ACCESS_TOKEN).as_deref(), Some("access"));

        store.clear_tokens().unwrap();
        assert!(store.read(keys::ACCESS_TOKEN).is_none());
        assert!(store.read(keys::REFRESH_TOKEN).is_none());
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("credentials.json");

        let store = FileCredentialStore::open(&path).unwrap();
        store.write(keys::ACCESS_TOKEN, "a1").unwrap();
        store.write(keys::ACTIVE_DRIVER_ID, "42").unwrap();
        drop(store);

        let reopened = FileCredentialStore::open(&path).unwrap();
        assert_eq!(reopened.read(keys::ACCESS_TOKEN).as_deref(), Some("a1"));
        assert_eq!(reopened.read(keys::ACTIVE_DRIVER_ID).as_deref(), Some("42"));

        reopened.clear_all().unwrap();
        let reopened = FileCredentialStore::open(&path).unwrap();
        assert!(reopened.read(keys::ACCESS_TOKEN).is_none());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("credentials.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileCredentialStore::open(&path).unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("credentials.json");
        let store = FileCredentialStore::open(&path).unwrap();
        store.write(keys::REFRESH_TOKEN, "r1").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_temp_file_is_private_before_tokens_are_written() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let fresh = temp_dir.path().join("fresh.tmp");
        create_private(&fresh).unwrap();
        let mode = std::fs::metadata(&fresh).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::metadata(&fresh).unwrap().len(), 0);

        // A world-readable leftover from an earlier crash is tightened too
        let path = temp_dir.path().join("credentials.json");
        let leftover = path.with_extension("tmp");
        std::fs::write(&leftover, "stale").unwrap();
        std::fs::set_permissions(&leftover, std::fs::Permissions::from_mode(0o644)).unwrap();
        create_private(&leftover).unwrap();
        let mode = std::fs::metadata(&leftover).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::metadata(&leftover).unwrap().len(), 0);

        let store = FileCredentialStore::open(&path).unwrap();
        store.write(keys::ACCESS_TOKEN, "a1").unwrap();
        assert!(!leftover.exists());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
