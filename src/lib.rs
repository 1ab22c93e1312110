//! batwatch - BLE battery monitor fleet service
//!
//! Continuously samples a fleet of BLE battery monitors, normalizes their
//! readings, and fans state changes out to subscribers:
//! - Connection pool with a concurrency cap and per-device state machines
//! - Encrypted (BM6-class) and legacy framed (BM2/generic) protocol codecs
//! - Poll scheduler with independent per-device cadences
//! - Reconnection controller with bounded exponential backoff
//! - Resilient MQTT publisher with a bounded retry queue
//! - Typed in-process event bus

pub mod bus;
pub mod config;
pub mod connection;
pub mod device;
pub mod engine;
pub mod events;
pub mod mqtt;
pub mod protocol;
pub mod scheduler;
pub mod storage;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use bus::EventBus;
pub use config::CoreConfig;
pub use engine::CoreEngine;
pub use events::{Event, Topic};
pub use types::{DeviceKind, Error, Reading, Result};
