//! Configuration sections for the core service.
//!
//! File loading and hot-reload live outside the core; callers hand a fully
//! formed [`CoreConfig`] to the engine. Every section has serde defaults so a
//! partial document deserializes into a runnable configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration handed to the engine at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CoreConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults. Only the handful of knobs that matter for ad-hoc runs are
    /// exposed this way:
    ///
    /// - `BATWATCH_ADAPTER`: Bluetooth adapter name
    /// - `BATWATCH_MAX_CONNECTIONS`: connection cap
    /// - `BATWATCH_MQTT_BROKER`, `BATWATCH_MQTT_PORT`: enable MQTT against a broker
    /// - `BATWATCH_LOG_LEVEL`: log level string
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(adapter) = std::env::var("BATWATCH_ADAPTER") {
            config.bluetooth.adapter = Some(adapter);
        }
        if let Some(cap) = std::env::var("BATWATCH_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.bluetooth.max_concurrent_connections = cap;
        }
        if let Ok(broker) = std::env::var("BATWATCH_MQTT_BROKER") {
            config.mqtt.enabled = true;
            config.mqtt.broker = broker;
        }
        if let Some(port) = std::env::var("BATWATCH_MQTT_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.mqtt.port = port;
        }
        if let Ok(level) = std::env::var("BATWATCH_LOG_LEVEL") {
            config.logging.level = level;
        }

        config
    }
}

/// Discovery scan cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Run a scan immediately at startup.
    #[serde(default = "default_true")]
    pub initial_scan: bool,
    /// Seconds between periodic scans.
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval_s: u64,
    /// Duration of a single scan window in seconds.
    #[serde(default = "default_scan_duration")]
    pub scan_duration_s: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            initial_scan: true,
            periodic_interval_s: default_periodic_interval(),
            scan_duration_s: default_scan_duration(),
        }
    }
}

impl DiscoveryConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_s)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_s)
    }
}

/// BLE adapter limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothConfig {
    /// Cap on simultaneously open links (1 is the safe default for a single
    /// adapter).
    #[serde(default = "default_max_connections")]
    pub max_concurrent_connections: usize,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_s: u64,
    /// Adapter name, when the host has more than one. `None` picks the first.
    #[serde(default)]
    pub adapter: Option<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: default_max_connections(),
            connection_timeout_s: default_connection_timeout(),
            adapter: None,
        }
    }
}

impl BluetoothConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_s)
    }
}

/// MQTT broker link and resilience knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_s: f64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_s: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_s: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_s: u64,
    #[serde(default = "default_queue_size")]
    pub message_queue_size: usize,
    #[serde(default = "default_message_retry_limit")]
    pub message_retry_limit: u32,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: default_broker(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            max_retries: default_max_retries(),
            initial_retry_delay_s: default_initial_retry_delay(),
            max_retry_delay_s: default_max_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            connection_timeout_s: default_connection_timeout(),
            health_check_interval_s: default_health_check_interval(),
            message_queue_size: default_queue_size(),
            message_retry_limit: default_message_retry_limit(),
        }
    }
}

impl MqttSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_s)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_s)
    }
}

/// Time-series storage toggle. The writer itself is external; the core only
/// decides whether to feed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_periodic_interval() -> u64 {
    43_200
}

fn default_scan_duration() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_broker() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "batwatch".to_string()
}

fn default_max_retries() -> u32 {
    10
}

fn default_initial_retry_delay() -> f64 {
    1.0
}

fn default_max_retry_delay() -> f64 {
    300.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_queue_size() -> usize {
    1000
}

fn default_message_retry_limit() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CoreConfig::default();
        assert!(config.discovery.initial_scan);
        assert_eq!(config.discovery.periodic_interval_s, 43_200);
        assert_eq!(config.bluetooth.max_concurrent_connections, 1);
        assert!(!config.mqtt.enabled);
        assert_eq!(config.mqtt.message_queue_size, 1000);
        assert_eq!(config.mqtt.message_retry_limit, 3);
    }

    #[test]
    fn partial_document_deserializes() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"bluetooth": {"max_concurrent_connections": 3}}"#).unwrap();
        assert_eq!(config.bluetooth.max_concurrent_connections, 3);
        assert_eq!(config.discovery.scan_duration_s, 10);
        assert_eq!(config.mqtt.topic_prefix, "batwatch");
    }
}
