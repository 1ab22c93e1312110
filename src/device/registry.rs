//! Device and vehicle registries.
//!
//! The orchestrator owns the authoritative in-memory maps and is the only
//! mutator; everything else reads snapshots. Persistence goes through the
//! narrow [`RegistryStore`] contract as versioned JSON documents.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::transport::DiscoveryHints;
use crate::types::{normalize_address, DeviceKind, DeviceLifecycle};

pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("vehicle {0} not found")]
    VehicleNotFound(String),

    #[error("device {0} already registered")]
    DuplicateDevice(String),

    #[error("unsupported document version {0}")]
    UnsupportedVersion(u32),

    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("store format: {0}")]
    Format(#[from] serde_json::Error),
}

/// How a device's link is retried; part of the persistent record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionPolicy {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_s: u64,
    /// Delay before reconnecting after an unexpected drop.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_s: u64,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_interval_s: default_retry_interval(),
            reconnect_delay_s: default_reconnect_delay(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_retry_interval() -> u64 {
    1
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    3600
}

/// Persistent device record. Identity (`address`) is immutable once
/// registered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRecord {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub name: String,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    pub status: DeviceLifecycle,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub configured_at: Option<DateTime<Utc>>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_s: u64,
    #[serde(default)]
    pub connection: ConnectionPolicy,
    #[serde(default)]
    pub hints: DiscoveryHints,
}

impl DeviceRecord {
    pub fn discovered(address: String, kind: DeviceKind, hints: DiscoveryHints) -> Self {
        let name = hints
            .local_name
            .clone()
            .unwrap_or_else(|| format!("Device_{address}"));
        Self {
            address,
            kind,
            name,
            vehicle_id: None,
            status: DeviceLifecycle::Discovered,
            discovered_at: Utc::now(),
            configured_at: None,
            poll_interval_s: default_poll_interval(),
            connection: ConnectionPolicy::default(),
            hints,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VehicleRecord {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Versioned on-disk document shapes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub vehicles: BTreeMap<String, VehicleRecord>,
}

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

/// Load/save contract against external persistence.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn load(&self) -> Result<(DeviceDocument, VehicleDocument), RegistryError>;
    async fn save_devices(&self, document: &DeviceDocument) -> Result<(), RegistryError>;
    async fn save_vehicles(&self, document: &VehicleDocument) -> Result<(), RegistryError>;
}

/// JSON files in a directory: `devices.json` and `vehicles.json`.
pub struct JsonRegistryStore {
    directory: PathBuf,
}

impl JsonRegistryStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn devices_path(&self) -> PathBuf {
        self.directory.join("devices.json")
    }

    fn vehicles_path(&self) -> PathBuf {
        self.directory.join("vehicles.json")
    }
}

#[async_trait]
impl RegistryStore for JsonRegistryStore {
    async fn load(&self) -> Result<(DeviceDocument, VehicleDocument), RegistryError> {
        let devices = match tokio::fs::read(self.devices_path()).await {
            Ok(bytes) => {
                let document: DeviceDocument = serde_json::from_slice(&bytes)?;
                if document.version > DOCUMENT_VERSION {
                    return Err(RegistryError::UnsupportedVersion(document.version));
                }
                document
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DeviceDocument::default(),
            Err(e) => return Err(e.into()),
        };
        let vehicles = match tokio::fs::read(self.vehicles_path()).await {
            Ok(bytes) => {
                let document: VehicleDocument = serde_json::from_slice(&bytes)?;
                if document.version > DOCUMENT_VERSION {
                    return Err(RegistryError::UnsupportedVersion(document.version));
                }
                document
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VehicleDocument::default(),
            Err(e) => return Err(e.into()),
        };
        Ok((devices, vehicles))
    }

    async fn save_devices(&self, document: &DeviceDocument) -> Result<(), RegistryError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let bytes = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(self.devices_path(), bytes).await?;
        Ok(())
    }

    async fn save_vehicles(&self, document: &VehicleDocument) -> Result<(), RegistryError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let bytes = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(self.vehicles_path(), bytes).await?;
        Ok(())
    }
}

/// Volatile store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryRegistryStore {
    state: std::sync::Mutex<(DeviceDocument, VehicleDocument)>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn load(&self) -> Result<(DeviceDocument, VehicleDocument), RegistryError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn save_devices(&self, document: &DeviceDocument) -> Result<(), RegistryError> {
        self.state.lock().unwrap().0 = document.clone();
        Ok(())
    }

    async fn save_vehicles(&self, document: &VehicleDocument) -> Result<(), RegistryError> {
        self.state.lock().unwrap().1 = document.clone();
        Ok(())
    }
}

/// In-memory device registry. Clones share the map; only the orchestrator
/// mutates it.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<BTreeMap<String, DeviceRecord>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hydrate(&self, document: DeviceDocument) {
        let mut devices = self.devices.write().unwrap();
        *devices = document.devices;
        info!("device registry hydrated: {} devices", devices.len());
    }

    pub fn document(&self) -> DeviceDocument {
        DeviceDocument {
            version: DOCUMENT_VERSION,
            devices: self.devices.read().unwrap().clone(),
        }
    }

    /// Register a scan sighting. Returns the record when the address is new.
    pub fn register_discovered(
        &self,
        address: &str,
        kind: DeviceKind,
        hints: DiscoveryHints,
    ) -> Option<DeviceRecord> {
        let address = normalize_address(address).ok()?;
        let mut devices = self.devices.write().unwrap();
        if devices.contains_key(&address) {
            return None;
        }
        let record = DeviceRecord::discovered(address.clone(), kind, hints);
        devices.insert(address.clone(), record.clone());
        debug!("registered discovered device {}", address);
        Some(record)
    }

    /// Operator action: mark a device configured and set its cadence.
    pub fn configure(
        &self,
        address: &str,
        name: Option<String>,
        poll_interval_s: Option<u64>,
    ) -> Result<DeviceRecord, RegistryError> {
        let mut devices = self.devices.write().unwrap();
        let record = devices
            .get_mut(address)
            .ok_or_else(|| RegistryError::DeviceNotFound(address.to_string()))?;
        record.status = DeviceLifecycle::Configured;
        record.configured_at = Some(Utc::now());
        if let Some(name) = name {
            record.name = name;
        }
        if let Some(interval) = poll_interval_s {
            record.poll_interval_s = interval.max(1);
        }
        Ok(record.clone())
    }

    /// Operator action: add a device that was never discovered by a scan.
    pub fn add(&self, record: DeviceRecord) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().unwrap();
        if devices.contains_key(&record.address) {
            return Err(RegistryError::DuplicateDevice(record.address));
        }
        devices.insert(record.address.clone(), record);
        Ok(())
    }

    pub fn remove(&self, address: &str) -> Result<DeviceRecord, RegistryError> {
        self.devices
            .write()
            .unwrap()
            .remove(address)
            .ok_or_else(|| RegistryError::DeviceNotFound(address.to_string()))
    }

    pub fn get(&self, address: &str) -> Option<DeviceRecord> {
        self.devices.read().unwrap().get(address).cloned()
    }

    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.devices.read().unwrap().values().cloned().collect()
    }

    /// Devices eligible for polling.
    pub fn configured(&self) -> Vec<DeviceRecord> {
        self.devices
            .read()
            .unwrap()
            .values()
            .filter(|r| r.status == DeviceLifecycle::Configured)
            .cloned()
            .collect()
    }

    pub fn members_of(&self, vehicle_id: &str) -> Vec<DeviceRecord> {
        self.devices
            .read()
            .unwrap()
            .values()
            .filter(|r| r.vehicle_id.as_deref() == Some(vehicle_id))
            .cloned()
            .collect()
    }

    /// Associate a device with a vehicle (or clear with `None`). Metadata
    /// only; historical readings are untouched.
    pub fn associate(
        &self,
        address: &str,
        vehicle_id: Option<String>,
    ) -> Result<DeviceRecord, RegistryError> {
        let mut devices = self.devices.write().unwrap();
        let record = devices
            .get_mut(address)
            .ok_or_else(|| RegistryError::DeviceNotFound(address.to_string()))?;
        record.vehicle_id = vehicle_id;
        Ok(record.clone())
    }

    pub fn mark_error(&self, address: &str) {
        if let Some(record) = self.devices.write().unwrap().get_mut(address) {
            record.status = DeviceLifecycle::Error;
        }
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().unwrap().is_empty()
    }
}

/// In-memory vehicle registry.
#[derive(Clone, Default)]
pub struct VehicleRegistry {
    vehicles: Arc<RwLock<BTreeMap<String, VehicleRecord>>>,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hydrate(&self, document: VehicleDocument) {
        let mut vehicles = self.vehicles.write().unwrap();
        *vehicles = document.vehicles;
        info!("vehicle registry hydrated: {} vehicles", vehicles.len());
    }

    pub fn document(&self) -> VehicleDocument {
        VehicleDocument {
            version: DOCUMENT_VERSION,
            vehicles: self.vehicles.read().unwrap().clone(),
        }
    }

    pub fn add(&self, id: &str, name: &str) -> VehicleRecord {
        let record = VehicleRecord {
            id: id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.vehicles
            .write()
            .unwrap()
            .insert(id.to_string(), record.clone());
        record
    }

    pub fn remove(&self, id: &str) -> Result<VehicleRecord, RegistryError> {
        self.vehicles
            .write()
            .unwrap()
            .remove(id)
            .ok_or_else(|| RegistryError::VehicleNotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<VehicleRecord> {
        self.vehicles.read().unwrap().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<VehicleRecord> {
        self.vehicles.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.vehicles.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.read().unwrap().is_empty()
    }
}

/// Guess the protocol family from advertisement hints.
pub fn detect_kind(hints: &DiscoveryHints) -> DeviceKind {
    match hints.local_name.as_deref() {
        Some(name) if name.to_ascii_uppercase().starts_with("BM6") => DeviceKind::Bm6,
        Some(name) if name.to_ascii_uppercase().starts_with("BM2") => DeviceKind::Bm2,
        Some(name) if name.to_ascii_uppercase().contains("BATTERY") => DeviceKind::Generic,
        _ => DeviceKind::Generic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    fn hints(name: &str) -> DiscoveryHints {
        DiscoveryHints {
            local_name: Some(name.to_string()),
            manufacturer_data: BTreeMap::new(),
        }
    }

    #[test]
    fn discovery_then_configuration() {
        let registry = DeviceRegistry::new();
        let record = registry
            .register_discovered(ADDR, DeviceKind::Bm6, hints("BM6 Monitor"))
            .unwrap();
        assert_eq!(record.status, DeviceLifecycle::Discovered);
        assert!(registry.configured().is_empty());

        // A second sighting is not a new registration.
        assert!(registry
            .register_discovered(ADDR, DeviceKind::Bm6, hints("BM6 Monitor"))
            .is_none());

        let configured = registry
            .configure(ADDR, Some("Starter battery".into()), Some(60))
            .unwrap();
        assert_eq!(configured.status, DeviceLifecycle::Configured);
        assert_eq!(configured.poll_interval_s, 60);
        assert!(configured.configured_at.is_some());
        assert_eq!(registry.configured().len(), 1);
    }

    #[test]
    fn association_is_metadata_only() {
        let registry = DeviceRegistry::new();
        registry
            .register_discovered(ADDR, DeviceKind::Bm2, hints("BM2"))
            .unwrap();

        registry.associate(ADDR, Some("van".into())).unwrap();
        assert_eq!(registry.members_of("van").len(), 1);

        registry.associate(ADDR, Some("truck".into())).unwrap();
        assert!(registry.members_of("van").is_empty());
        assert_eq!(registry.members_of("truck").len(), 1);
    }

    #[test]
    fn kind_detection_from_hints() {
        assert_eq!(detect_kind(&hints("BM6 Pro")), DeviceKind::Bm6);
        assert_eq!(detect_kind(&hints("bm2 sensor")), DeviceKind::Bm2);
        assert_eq!(detect_kind(&hints("Battery Monitor")), DeviceKind::Generic);
        assert_eq!(detect_kind(&DiscoveryHints::default()), DeviceKind::Generic);
    }

    #[tokio::test]
    async fn json_store_round_trip() {
        let directory = std::env::temp_dir().join(format!("batwatch-test-{}", std::process::id()));
        let store = JsonRegistryStore::new(&directory);

        let registry = DeviceRegistry::new();
        registry
            .register_discovered(ADDR, DeviceKind::Bm6, hints("BM6"))
            .unwrap();
        let vehicles = VehicleRegistry::new();
        vehicles.add("van", "Camper van");

        store.save_devices(&registry.document()).await.unwrap();
        store.save_vehicles(&vehicles.document()).await.unwrap();

        let (devices, loaded_vehicles) = store.load().await.unwrap();
        assert_eq!(devices.version, DOCUMENT_VERSION);
        assert!(devices.devices.contains_key(ADDR));
        assert!(loaded_vehicles.vehicles.contains_key("van"));

        let _ = tokio::fs::remove_dir_all(&directory).await;
    }

    #[tokio::test]
    async fn missing_files_load_as_empty() {
        let store = JsonRegistryStore::new("/nonexistent/batwatch-registry");
        let (devices, vehicles) = store.load().await.unwrap();
        assert!(devices.devices.is_empty());
        assert!(vehicles.vehicles.is_empty());
    }
}
