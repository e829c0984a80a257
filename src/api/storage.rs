//! Persistence backends for the access/refresh token pair.
//!
//! Tokens live under two well-known keys. The default backend is the OS
//! keychain via the `keyring` crate; a JSON file in the user data directory
//! and an in-memory map are available for hosts without a keychain and for
//! tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use keyring::Entry;
use thiserror::Error;
use zeroize::Zeroize;

/// Keychain service name for stored portal credentials.
const SERVICE_NAME: &str = "edu.student-portal.client";

/// Storage key of the access token.
pub const ACCESS_TOKEN_KEY: &str = "student_portal_access_token";

/// Storage key of the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "student_portal_refresh_token";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Keychain operation failed: {0}")]
    Keychain(String),

    #[error("Token file {path} could not be accessed: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Token file {0} is corrupt")]
    Corrupt(PathBuf),

    #[error("Token storage is unavailable")]
    Unavailable,
}

impl From<keyring::Error> for StorageError {
    fn from(err: keyring::Error) -> Self {
        StorageError::Keychain(err.to_string())
    }
}

/// A string key/value medium for tokens.
///
/// `get` returns `Ok(None)` when the key was never written; `remove` is
/// idempotent.
pub trait TokenStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// OS keychain backend (macOS Keychain, Windows Credential Manager, Linux keyutils).
#[derive(Debug, Default)]
pub struct KeychainStorage;

impl TokenStorage for KeychainStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entry = Entry::new(SERVICE_NAME, key)?;
        match entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StorageError::from(e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let entry = Entry::new(SERVICE_NAME, key)?;
        entry.set_password(value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let entry = Entry::new(SERVICE_NAME, key)?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted, idempotent
            Err(e) => Err(StorageError::from(e)),
        }
    }
}

/// JSON map of key to token stored in a single file.
///
/// Every operation re-reads the file so separate CLI invocations observe
/// each other's writes.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data_dir>/student-portal/tokens.json`, if the platform has a data dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("student-portal").join("tokens.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_error(&self, source: std::io::Error) -> StorageError {
        StorageError::File {
            path: self.path.clone(),
            source,
        }
    }

    fn load(&self) -> Result<HashMap<String, String>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|_| StorageError::Corrupt(self.path.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(self.file_error(e)),
        }
    }

    fn save(&self, map: &HashMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.file_error(e))?;
        }
        let bytes = serde_json::to_vec(map).map_err(|_| StorageError::Corrupt(self.path.clone()))?;

        // Replaced through a sibling temp file; readers never see a partial map.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(|e| self.file_error(e))?;
        restrict_permissions(&tmp);
        std::fs::rename(&tmp, &self.path).map_err(|e| self.file_error(e))
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        log::warn!("Could not restrict token file permissions: {}", e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

impl TokenStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Unavailable)?;
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Unavailable)?;
        let mut map = self.load()?;
        map.insert(key.to_string(), value.to_string());
        self.save(&map)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Unavailable)?;
        let mut map = self.load()?;
        if map.remove(key).is_none() {
            return Ok(());
        }
        self.save(&map)
    }
}

/// In-process storage. Values do not survive the process and are zeroed
/// when removed.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl TokenStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.values.lock().map_err(|_| StorageError::Unavailable)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().map_err(|_| StorageError::Unavailable)?;
        if let Some(mut old) = values.insert(key.to_string(), value.to_string()) {
            old.zeroize();
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().map_err(|_| StorageError::Unavailable)?;
        if let Some(mut old) = values.remove(key) {
            old.zeroize();
        }
        Ok(())
    }
}

/// A medium that is never available, e.g. no keychain service on a headless host.
#[derive(Debug, Default)]
pub struct UnavailableStorage;

impl TokenStorage for UnavailableStorage {
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Unavailable)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable)
    }

    fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_round_trip() {
        let storage = MemoryStorage::default();
        assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap(), None);

        storage.set(ACCESS_TOKEN_KEY, "a").unwrap();
        assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("a"));

        storage.remove(ACCESS_TOKEN_KEY).unwrap();
        storage.remove(ACCESS_TOKEN_KEY).unwrap();
        assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap(), None);
    }

    #[test]
    fn test_file_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.json");

        let first = FileStorage::new(&path);
        first.set(ACCESS_TOKEN_KEY, "a").unwrap();
        first.set(REFRESH_TOKEN_KEY, "b").unwrap();

        let second = FileStorage::new(&path);
        assert_eq!(second.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("a"));
        assert_eq!(second.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("b"));

        second.remove(ACCESS_TOKEN_KEY).unwrap();
        assert_eq!(first.get(ACCESS_TOKEN_KEY).unwrap(), None);
        assert_eq!(first.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_file_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("absent.json"));
        assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap(), None);
        storage.remove(ACCESS_TOKEN_KEY).unwrap();
        assert!(!storage.path().exists());
    }

    #[test]
    fn test_file_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, b"{not json").unwrap();

        let storage = FileStorage::new(&path);
        assert!(matches!(
            storage.get(ACCESS_TOKEN_KEY),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn test_unavailable_always_fails() {
        let storage = UnavailableStorage;
        assert!(storage.get(ACCESS_TOKEN_KEY).is_err());
        assert!(storage.set(ACCESS_TOKEN_KEY, "a").is_err());
        assert!(storage.remove(ACCESS_TOKEN_KEY).is_err());
    }
}
