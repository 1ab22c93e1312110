//! BLE transport abstraction.
//!
//! The pool and everything above it talk to a [`BleTransport`], never to the
//! OS adapter directly. [`btle::BtleTransport`] is the production
//! implementation; [`mock::MockTransport`] emulates connect/disconnect,
//! writes, and synthetic notifications so the whole core is exercisable
//! without hardware.

pub mod btle;
pub mod mock;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Called with each notification payload for a subscribed characteristic.
/// Handlers must not block; heavy work belongs behind a channel.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// What a scan learned about a peripheral.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: String,
    pub local_name: Option<String>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

impl Advertisement {
    pub fn hints(&self) -> DiscoveryHints {
        DiscoveryHints {
            local_name: self.local_name.clone(),
            manufacturer_data: self.manufacturer_data.clone(),
        }
    }
}

/// Advertisement-derived hints kept on a device record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryHints {
    #[serde(default)]
    pub local_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

/// Transport error taxonomy. [`TransportError::is_fatal`] splits the
/// recoverable conditions (handed to the reconnection controller) from the
/// ones that need an operator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("not connected to {0}")]
    NotConnected(String),

    #[error("peer {0} disconnected")]
    PeerDisconnected(String),

    #[error("adapter busy")]
    AdapterBusy,

    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("unknown peripheral {0}")]
    UnknownPeripheral(String),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("I/O failure: {0}")]
    Io(String),
}

impl TransportError {
    /// Fatal errors are not retried; the device goes to `ERROR` and waits
    /// for the operator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidArgument(_)
                | TransportError::AdapterUnavailable(_)
                | TransportError::UnknownPeripheral(_)
                | TransportError::CharacteristicNotFound(_)
        )
    }
}

/// Adapter-level operations against peripherals.
///
/// Scanning and connecting contend for the adapter; the orchestrator
/// mutually excludes them, the transport does not.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Establish a link. Idempotent for an already-connected peripheral.
    async fn connect(&self, address: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Drop a link. Idempotent.
    async fn disconnect(&self, address: &str) -> Result<(), TransportError>;

    /// Whether the OS still reports the link up.
    async fn is_connected(&self, address: &str) -> bool;

    /// GATT write to a characteristic.
    async fn write(
        &self,
        address: &str,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Subscribe to notifications on a characteristic. At most one handler
    /// per (address, characteristic); a second subscribe replaces it.
    async fn subscribe(
        &self,
        address: &str,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError>;

    /// Remove a notification subscription. Idempotent.
    async fn unsubscribe(&self, address: &str, characteristic: Uuid)
        -> Result<(), TransportError>;

    /// Scan for `duration`, yielding advertisements lazily as they arrive.
    /// The channel closes when the scan window ends.
    async fn scan(&self, duration: Duration) -> Result<mpsc::Receiver<Advertisement>, TransportError>;
}

/// Reject empty operation arguments up front.
pub(crate) fn require(value: &str, name: &str) -> Result<(), TransportError> {
    if value.trim().is_empty() {
        return Err(TransportError::InvalidArgument(format!("{name} is empty")));
    }
    Ok(())
}

pub(crate) fn require_payload(payload: &[u8]) -> Result<(), TransportError> {
    if payload.is_empty() {
        return Err(TransportError::InvalidArgument("payload is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_split() {
        assert!(TransportError::UnknownPeripheral("X".into()).is_fatal());
        assert!(TransportError::AdapterUnavailable("gone".into()).is_fatal());
        assert!(!TransportError::Timeout(Duration::from_secs(5)).is_fatal());
        assert!(!TransportError::PeerDisconnected("X".into()).is_fatal());
        assert!(!TransportError::AdapterBusy.is_fatal());
    }

    #[test]
    fn argument_validation() {
        assert!(require("AA:BB", "address").is_ok());
        assert!(require("", "address").is_err());
        assert!(require("   ", "address").is_err());
        assert!(require_payload(&[1]).is_ok());
        assert!(require_payload(&[]).is_err());
    }
}
