use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::pool::PoolError;
use crate::device::registry::RegistryError;
use crate::device::session::SessionError;
use crate::mqtt::MqttError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Protocol family a monitor speaks.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceKind {
    Bm6,
    Bm2,
    Generic,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Bm6 => write!(f, "BM6"),
            DeviceKind::Bm2 => write!(f, "BM2"),
            DeviceKind::Generic => write!(f, "GENERIC"),
        }
    }
}

/// Where a device record sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceLifecycle {
    /// Seen during a scan, not yet configured for polling.
    Discovered,
    /// Operator-configured; eligible for polling.
    Configured,
    /// Requires operator intervention.
    Error,
}

impl fmt::Display for DeviceLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceLifecycle::Discovered => write!(f, "discovered"),
            DeviceLifecycle::Configured => write!(f, "configured"),
            DeviceLifecycle::Error => write!(f, "error"),
        }
    }
}

/// One canonical battery measurement.
///
/// Readings are produced by the protocol parsers, validated against the
/// acceptance ranges below, and are immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Battery terminal voltage in volts.
    pub voltage: f64,
    /// Current in amperes; positive while charging.
    pub current: f64,
    /// Temperature in degrees Celsius.
    pub temperature: f64,
    /// State of charge, percent.
    pub state_of_charge: f64,
    /// Capacity in ampere-hours, when the protocol reports it.
    pub capacity: Option<f64>,
    /// Charge/discharge cycle count, when reported.
    pub cycles: Option<u32>,
    /// Tag of the protocol that produced this reading, e.g. "BM6".
    pub protocol: String,
    pub timestamp: DateTime<Utc>,
    /// Protocol-specific fields that have no canonical slot.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Reading {
    pub const VOLTAGE_RANGE: (f64, f64) = (0.0, 100.0);
    pub const CURRENT_LIMIT: f64 = 1000.0;
    pub const TEMPERATURE_RANGE: (f64, f64) = (-40.0, 125.0);
    pub const SOC_RANGE: (f64, f64) = (0.0, 100.0);

    pub fn new(
        voltage: f64,
        current: f64,
        temperature: f64,
        state_of_charge: f64,
        protocol: &str,
    ) -> Self {
        Self {
            voltage,
            current,
            temperature,
            state_of_charge,
            capacity: None,
            cycles: None,
            protocol: protocol.to_string(),
            timestamp: Utc::now(),
            extra: BTreeMap::new(),
        }
    }

    /// Check the acceptance ranges. Returns the first violated field.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let fields = [
            ("voltage", self.voltage, Self::VOLTAGE_RANGE),
            ("temperature", self.temperature, Self::TEMPERATURE_RANGE),
            ("state_of_charge", self.state_of_charge, Self::SOC_RANGE),
            (
                "current",
                self.current,
                (-Self::CURRENT_LIMIT, Self::CURRENT_LIMIT),
            ),
        ];
        for (name, value, (lo, hi)) in fields {
            if value.is_nan() {
                return Err(format!("{name} is NaN"));
            }
            if value < lo || value > hi {
                return Err(format!("{name} {value} outside [{lo}, {hi}]"));
            }
        }
        Ok(())
    }

    /// Instantaneous power in watts, derived.
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }
}

/// Runtime status of a device, updated on every transport operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub connected: bool,
    pub error_code: Option<i32>,
    pub error_message: Option<String>,
    pub protocol_version: Option<String>,
    pub last_command: Option<String>,
}

/// Normalize a hardware address to the canonical form: six hex octets,
/// colon-separated, uppercase. Accepts `-` separators on input.
pub fn normalize_address(raw: &str) -> Result<String> {
    let cleaned = raw.trim().replace('-', ":");
    let octets: Vec<&str> = cleaned.split(':').collect();
    if octets.len() != 6
        || octets
            .iter()
            .any(|o| o.len() != 2 || !o.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return Err(Error::InvalidAddress(raw.to_string()));
    }
    Ok(cleaned.to_ascii_uppercase())
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("engine is shut down")]
    ShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_normalization() {
        assert_eq!(
            normalize_address("aa:bb:cc:dd:ee:01").unwrap(),
            "AA:BB:CC:DD:EE:01"
        );
        assert_eq!(
            normalize_address("AA-BB-CC-DD-EE-01").unwrap(),
            "AA:BB:CC:DD:EE:01"
        );
        assert!(normalize_address("AA:BB:CC:DD:EE").is_err());
        assert!(normalize_address("AA:BB:CC:DD:EE:GG").is_err());
        assert!(normalize_address("").is_err());
    }

    #[test]
    fn reading_range_validation() {
        let mut r = Reading::new(12.6, 1.5, 25.1, 85.0, "BM6");
        assert!(r.validate().is_ok());

        r.state_of_charge = 250.0;
        assert!(r.validate().is_err());

        r.state_of_charge = 85.0;
        r.voltage = f64::NAN;
        assert!(r.validate().is_err());

        r.voltage = 12.6;
        r.temperature = -41.0;
        assert!(r.validate().is_err());

        r.temperature = 25.1;
        r.current = -1200.0;
        assert!(r.validate().is_err());
    }

    #[test]
    fn reading_power_is_derived() {
        let r = Reading::new(12.0, 2.0, 20.0, 80.0, "BM6");
        assert!((r.power() - 24.0).abs() < f64::EPSILON);
    }
}
