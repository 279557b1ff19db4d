//! Durable key-value persistence.
//!
//! The firmware keeps a handful of small settings (device UUID, plant
//! profile, polling interval) in a key-value substrate that survives reboot.
//! [`FileStore`] maps that substrate onto one file per key inside a
//! directory; [`MemoryStore`] is the session-only fallback.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

/// Storage namespace shared by all persisted settings.
pub const STORAGE_NAMESPACE: &str = "plant_monitor";

/// Key holding the device UUID.
pub const KEY_UUID: &str = "uuid";

/// Key holding the plant name.
pub const KEY_PLANT_NAME: &str = "plant_name";

/// Key holding the plant variety.
pub const KEY_PLANT_VARIETY: &str = "plant_variety";

/// Key holding the plant location.
pub const KEY_PLANT_LOCATION: &str = "plant_location";

/// Key holding a polling interval override in milliseconds.
pub const KEY_POLLING_INTERVAL: &str = "polling_interval";

/// Errors that can occur while persisting a value.
#[derive(Debug)]
pub enum StorageError {
    /// The underlying filesystem operation failed
    Io(std::io::Error),

    /// The key contains characters that cannot be stored
    InvalidKey(String),

    /// The store is not available at all
    Unavailable(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "Storage I/O error: {}", e),
            StorageError::InvalidKey(key) => write!(f, "Invalid storage key: '{}'", key),
            StorageError::Unavailable(e) => write!(f, "Storage unavailable: {}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

/// Persistence collaborator: values written with `set` survive reboot.
pub trait KeyValueStore {
    /// Load a value. A missing key and an unreadable store both yield `None`.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Persist a value, replacing any previous one.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        (**self).set(key, value)
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !key.starts_with('.');

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Directory-backed store: one file per key, written atomically.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Opened key-value store");
        Ok(Self { dir })
    }

    /// Directory holding the key files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        validate_key(key).ok()?;
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(key = key, error = %e, "Failed to read stored value");
                None
            }
        }
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        let path = self.path_for(key);
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&value)?;
        file.sync_data()?;
        drop(file);
        fs::rename(&temp_path, &path)?;

        debug!(key = key, bytes = value.len(), "Persisted value");
        Ok(())
    }
}

/// Session-only store; contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut values = self
            .values
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))?;
        values.insert(key.to_string(), value);
        Ok(())
    }
}

/// Read a UTF-8 string value, treating empty or undecodable values as absent.
pub fn get_string(store: &impl KeyValueStore, key: &str) -> Option<String> {
    let bytes = store.get(key)?;
    match String::from_utf8(bytes) {
        Ok(value) => {
            let value = value.trim().to_string();
            if value.is_empty() {
                None
            } else {
                Some(value)
            }
        }
        Err(_) => {
            warn!(key = key, "Stored value is not valid UTF-8, ignoring");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Unique scratch directory under the system temp dir.
    pub(crate) fn scratch_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("plant-telemetry-{}-{}", label, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_file_store_round_trip_and_restart() {
        let dir = scratch_dir("kv");
        let store = FileStore::open(&dir).unwrap();
        assert!(store.get(KEY_UUID).is_none());

        store.set(KEY_UUID, b"abc".to_vec()).unwrap();
        assert_eq!(store.get(KEY_UUID), Some(b"abc".to_vec()));

        // A fresh handle on the same directory sees the persisted value
        let reopened = FileStore::open(&dir).unwrap();
        assert_eq!(reopened.get(KEY_UUID), Some(b"abc".to_vec()));

        reopened.set(KEY_UUID, b"def".to_vec()).unwrap();
        assert_eq!(store.get(KEY_UUID), Some(b"def".to_vec()));
        assert!(!dir.join("uuid.tmp").exists());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_overwrite_with_shorter_value_is_exact() {
        let dir = scratch_dir("kv-overwrite");
        let store = FileStore::open(&dir).unwrap();

        store.set(KEY_POLLING_INTERVAL, b"3600000".to_vec()).unwrap();
        store.set(KEY_POLLING_INTERVAL, b"5000".to_vec()).unwrap();

        assert_eq!(fs::read(dir.join(KEY_POLLING_INTERVAL)).unwrap(), b"5000".to_vec());
        assert!(!dir.join("polling_interval.tmp").exists());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.set("../escape", vec![1]),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(store.set("", vec![1]), Err(StorageError::InvalidKey(_))));

        let dir = scratch_dir("kv-invalid");
        let file_store = FileStore::open(&dir).unwrap();
        assert!(file_store.set("a/b", vec![1]).is_err());
        assert!(file_store.get("a/b").is_none());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_memory_store_shared_through_arc() {
        let store = Arc::new(MemoryStore::new());
        let other = store.clone();
        store.set(KEY_PLANT_NAME, b"Fern".to_vec()).unwrap();
        assert_eq!(other.get(KEY_PLANT_NAME), Some(b"Fern".to_vec()));
    }

    #[test]
    fn test_get_string_treats_blank_and_binary_as_absent() {
        let store = MemoryStore::new();
        store.set(KEY_PLANT_NAME, b"  Monstera \n".to_vec()).unwrap();
        store.set(KEY_PLANT_VARIETY, b"   ".to_vec()).unwrap();
        store.set(KEY_PLANT_LOCATION, vec![0xff, 0xfe]).unwrap();

        assert_eq!(get_string(&store, KEY_PLANT_NAME), Some("Monstera".to_string()));
        assert_eq!(get_string(&store, KEY_PLANT_VARIETY), None);
        assert_eq!(get_string(&store, KEY_PLANT_LOCATION), None);
        assert_eq!(get_string(&store, KEY_POLLING_INTERVAL), None);
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::InvalidKey("x/y".to_string());
        assert_eq!(err.to_string(), "Invalid storage key: 'x/y'");
        let err = StorageError::Unavailable("no flash".to_string());
        assert!(err.to_string().contains("no flash"));
    }
}
