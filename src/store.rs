//! Persistence of the last connected peripheral.
//!
//! The state machine remembers the identity of every peripheral it tries to
//! connect to, so that it can reconnect after link loss and restore the
//! connection on the next start.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ble::transport::DeviceId;
use crate::error::Result;

/// Single-slot, last-write-wins storage for the remembered peripheral.
#[cfg_attr(test, mockall::automock)]
pub trait IdentityStore: Send + Sync {
    /// Read the remembered identity.
    fn load(&self) -> Result<Option<DeviceId>>;

    /// Replace the remembered identity.
    fn save(&self, identity: &DeviceId) -> Result<()>;
}

/// Identity store kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    slot: Mutex<Option<DeviceId>>,
}

impl MemoryIdentityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already remembers `identity`.
    pub fn with_identity(identity: impl Into<DeviceId>) -> Self {
        Self {
            slot: Mutex::new(Some(identity.into())),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<DeviceId>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, identity: &DeviceId) -> Result<()> {
        *self.slot.lock() = Some(identity.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredPreferences {
    last_connected_device: Option<DeviceId>,
}

/// Identity store backed by a small JSON file.
///
/// The file holds `{"last_connected_device": "<address>"}`. A missing file
/// reads as "nothing remembered".
#[derive(Debug, Clone)]
pub struct JsonFileIdentityStore {
    path: PathBuf,
}

impl JsonFileIdentityStore {
    /// Use the file at `path`. The file is created on the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for JsonFileIdentityStore {
    fn load(&self) -> Result<Option<DeviceId>> {
        if !self.path.exists() {
            debug!("No identity file at {}", self.path.display());
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)?;
        let stored: StoredPreferences = serde_json::from_str(&text)?;
        Ok(stored.last_connected_device)
    }

    fn save(&self, identity: &DeviceId) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let stored = StoredPreferences {
            last_connected_device: Some(identity.clone()),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&stored)?)?;
        debug!("Remembered {} in {}", identity, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("smart-bottle-ble-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn test_memory_store_last_write_wins() {
        let store = MemoryIdentityStore::new();
        assert_eq!(store.load().unwrap(), None);

        store.save(&DeviceId::from("AA")).unwrap();
        store.save(&DeviceId::from("BB")).unwrap();
        assert_eq!(store.load().unwrap(), Some(DeviceId::from("BB")));
    }

    #[test]
    fn test_json_store_roundtrip() {
        let path = scratch_path("roundtrip.json");
        let _ = std::fs::remove_file(&path);
        let store = JsonFileIdentityStore::new(&path);

        assert_eq!(store.load().unwrap(), None);
        store.save(&DeviceId::from("AA:BB:CC:DD:EE:FF")).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"last_connected_device\""));
        assert_eq!(
            JsonFileIdentityStore::new(&path).load().unwrap(),
            Some(DeviceId::from("AA:BB:CC:DD:EE:FF"))
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let path = scratch_path("garbage.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        let err = JsonFileIdentityStore::new(&path).load().unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let _ = std::fs::remove_file(&path);
    }
}
