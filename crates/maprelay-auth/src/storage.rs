//! Persistent storage for registered devices
//!
//! Uses JSON file storage in ~/.config/maprelay/devices.json

use chrono::{DateTime, Utc};
use maprelay_core::RegistrationBundle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Device not found: {0}")]
    NotFound(String),
    #[error("Configuration directory not found")]
    NoConfigDir,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Unique identifier for a stored device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    /// Generate a new random device ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered device and its credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDevice {
    pub id: DeviceId,
    pub bundle: RegistrationBundle,
    /// When the bundle was stored
    pub created_at: DateTime<Utc>,
}

/// Credential-free view of a stored device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub device_name: String,
    pub device_serial_number: String,
    pub locale_code: String,
    pub expires: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&StoredDevice> for DeviceSummary {
    fn from(device: &StoredDevice) -> Self {
        Self {
            id: device.id,
            device_name: device.bundle.device_name().to_string(),
            device_serial_number: device.bundle.device_info.device_serial_number.clone(),
            locale_code: device.bundle.locale_code.clone(),
            expires: device.bundle.expires,
            created_at: device.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredData {
    /// Devices indexed by ID
    devices: HashMap<String, StoredDevice>,
}

/// Registration bundle store with file persistence
pub struct BundleStore {
    path: PathBuf,
    data: Arc<RwLock<StoredData>>,
}

impl BundleStore {
    /// Open the store at the default location
    pub async fn new() -> StorageResult<Self> {
        let path = Self::default_path()?;
        Self::with_path(path).await
    }

    /// Open the store at a specific path
    ///
    /// Loads existing data from disk if present. An unreadable store is moved
    /// to `<path>.bak` and a fresh one started.
    pub async fn with_path(path: PathBuf) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(data) => {
                    info!("Loaded device store from {:?}", path);
                    data
                }
                Err(e) => {
                    let backup = Self::backup_path(&path);
                    std::fs::rename(&path, &backup)?;
                    warn!(
                        "Failed to parse device store ({}), moved it to {:?} and starting fresh",
                        e, backup
                    );
                    StoredData::default()
                }
            }
        } else {
            debug!("No existing device store, creating new");
            StoredData::default()
        };

        Ok(Self {
            path,
            data: Arc::new(RwLock::new(data)),
        })
    }

    /// Default store path (~/.config/maprelay/devices.json)
    pub fn default_path() -> StorageResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Ok(config_dir.join("maprelay").join("devices.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.as_os_str().to_owned();
        backup.push(".bak");
        PathBuf::from(backup)
    }

    async fn save(&self) -> StorageResult<()> {
        let data = self.data.read().await;
        let json = serde_json::to_string_pretty(&*data)?;
        std::fs::write(&self.path, json)?;
        debug!("Saved device store to {:?}", self.path);
        Ok(())
    }

    /// Store a bundle under a fresh device id
    pub async fn save_bundle(&self, bundle: RegistrationBundle) -> StorageResult<StoredDevice> {
        let device = StoredDevice {
            id: DeviceId::new(),
            bundle,
            created_at: Utc::now(),
        };
        {
            let mut data = self.data.write().await;
            data.devices.insert(device.id.to_string(), device.clone());
        }
        self.save().await?;
        info!("Stored device {} ({})", device.id, device.bundle.device_name());
        Ok(device)
    }

    pub async fn get(&self, id: &DeviceId) -> Option<StoredDevice> {
        let data = self.data.read().await;
        data.devices.get(&id.to_string()).cloned()
    }

    /// All stored devices, oldest first
    pub async fn list(&self) -> Vec<StoredDevice> {
        let data = self.data.read().await;
        let mut devices: Vec<StoredDevice> = data.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.created_at);
        devices
    }

    pub async fn remove(&self, id: &DeviceId) -> StorageResult<()> {
        let id_str = id.to_string();
        {
            let mut data = self.data.write().await;
            if data.devices.remove(&id_str).is_none() {
                return Err(StorageError::NotFound(id_str));
            }
        }
        self.save().await?;
        info!("Removed device {}", id_str);
        Ok(())
    }

    pub async fn count(&self) -> usize {
        let data = self.data.read().await;
        data.devices.len()
    }
}
