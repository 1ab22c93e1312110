//! Runtime status tracking.
//!
//! Holds the live, non-persisted view of every device: connected flag, last
//! error, protocol version, last command, latest reading. Updated by
//! sessions on every transport operation; read by health snapshots and MQTT
//! status publications.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::types::{Reading, RuntimeStatus};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceRuntime {
    pub status: RuntimeStatus,
    pub latest_reading: Option<Reading>,
    pub last_reading_at: Option<DateTime<Utc>>,
    pub reading_count: u64,
    pub consecutive_errors: u32,
}

/// Concurrent map of device runtime state. Clones share storage.
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    inner: std::sync::Arc<DashMap<String, DeviceRuntime>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, address: &str, connected: bool) {
        let mut entry = self.inner.entry(address.to_string()).or_default();
        entry.status.connected = connected;
        if connected {
            entry.status.error_code = None;
            entry.status.error_message = None;
        }
    }

    pub fn record_reading(&self, address: &str, reading: &Reading) {
        let mut entry = self.inner.entry(address.to_string()).or_default();
        entry.latest_reading = Some(reading.clone());
        entry.last_reading_at = Some(reading.timestamp);
        entry.reading_count += 1;
        entry.consecutive_errors = 0;
        entry.status.error_code = None;
        entry.status.error_message = None;
    }

    pub fn record_error(&self, address: &str, code: i32, message: &str) {
        let mut entry = self.inner.entry(address.to_string()).or_default();
        entry.status.error_code = Some(code);
        entry.status.error_message = Some(message.to_string());
        entry.consecutive_errors += 1;
    }

    pub fn set_protocol_version(&self, address: &str, version: &str) {
        let mut entry = self.inner.entry(address.to_string()).or_default();
        entry.status.protocol_version = Some(version.to_string());
    }

    pub fn set_last_command(&self, address: &str, command: &str) {
        let mut entry = self.inner.entry(address.to_string()).or_default();
        entry.status.last_command = Some(command.to_string());
    }

    pub fn status(&self, address: &str) -> RuntimeStatus {
        self.inner
            .get(address)
            .map(|e| e.status.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, address: &str) -> Option<DeviceRuntime> {
        self.inner.get(address).map(|e| e.clone())
    }

    pub fn latest_reading(&self, address: &str) -> Option<Reading> {
        self.inner.get(address).and_then(|e| e.latest_reading.clone())
    }

    pub fn remove(&self, address: &str) {
        self.inner.remove(address);
    }

    pub fn connected_count(&self) -> usize {
        self.inner.iter().filter(|e| e.status.connected).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    #[test]
    fn reading_clears_error_state() {
        let registry = RuntimeRegistry::new();
        registry.record_error(ADDR, 408, "command timed out");
        registry.record_error(ADDR, 408, "command timed out");
        assert_eq!(registry.snapshot(ADDR).unwrap().consecutive_errors, 2);

        let reading = Reading::new(12.6, 0.0, 25.0, 80.0, "BM6");
        registry.record_reading(ADDR, &reading);

        let runtime = registry.snapshot(ADDR).unwrap();
        assert_eq!(runtime.consecutive_errors, 0);
        assert_eq!(runtime.reading_count, 1);
        assert!(runtime.status.error_code.is_none());
        assert_eq!(registry.latest_reading(ADDR).unwrap().voltage, 12.6);
    }

    #[test]
    fn unknown_device_defaults() {
        let registry = RuntimeRegistry::new();
        assert!(!registry.status(ADDR).connected);
        assert!(registry.snapshot(ADDR).is_none());
    }
}
