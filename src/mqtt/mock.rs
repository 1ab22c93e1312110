//! MQTT connector double.
//!
//! Scriptable broker: flip it up and down, inspect everything published.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{MqttConnection, MqttConnector, MqttError, QosLevel};
use crate::config::MqttSettings;

#[derive(Default)]
struct MockBroker {
    up: AtomicBool,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    retained: Mutex<Vec<(String, bool)>>,
    connections: AtomicU64,
}

/// Shared-state connector double.
#[derive(Clone)]
pub struct MockMqttConnector {
    broker: Arc<MockBroker>,
}

impl MockMqttConnector {
    pub fn new() -> Self {
        let broker = MockBroker {
            up: AtomicBool::new(true),
            ..MockBroker::default()
        };
        Self {
            broker: Arc::new(broker),
        }
    }

    pub fn set_broker_up(&self, up: bool) {
        self.broker.up.store(up, Ordering::SeqCst);
    }

    /// Everything published, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.broker.published.lock().unwrap().clone()
    }

    /// (topic, retain) pairs, in publish order.
    pub fn retain_flags(&self) -> Vec<(String, bool)> {
        self.broker.retained.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> u64 {
        self.broker.connections.load(Ordering::Relaxed)
    }
}

impl Default for MockMqttConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MqttConnector for MockMqttConnector {
    async fn connect(&self, _settings: &MqttSettings) -> Result<Box<dyn MqttConnection>, MqttError> {
        if !self.broker.up.load(Ordering::SeqCst) {
            return Err(MqttError::Connect("broker unreachable".into()));
        }
        self.broker.connections.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockMqttConnection {
            broker: self.broker.clone(),
        }))
    }
}

struct MockMqttConnection {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl MqttConnection for MockMqttConnection {
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        _qos: QosLevel,
        retain: bool,
    ) -> Result<(), MqttError> {
        if !self.broker.up.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionLost);
        }
        self.broker
            .published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        self.broker
            .retained
            .lock()
            .unwrap()
            .push((topic.to_string(), retain));
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.broker.up.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {}
}
