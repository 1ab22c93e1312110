//! MQTT resilience client.
//!
//! A bus subscriber that publishes readings, statuses, vehicle summaries and
//! discovery notices to an external broker. While the broker is unreachable,
//! messages collect in a bounded FIFO (oldest dropped on overflow); each
//! message carries a retry budget. The broker link itself lives behind the
//! [`MqttConnector`] seam so tests run against a double.

pub mod mock;
pub mod payload;
pub mod rumqtt;
pub mod topics;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::MqttSettings;
use crate::connection::reconnect::{backoff_delay, ReconnectPolicy};
use crate::device::registry::DeviceRegistry;
use crate::events::{Event, Topic};
use self::topics::Topics;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MqttError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("operation timed out")]
    Timeout,

    #[error("client is in FAILED state; operator re-enable required")]
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for MqttState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MqttState::Disconnected => "disconnected",
            MqttState::Connecting => "connecting",
            MqttState::Connected => "connected",
            MqttState::Reconnecting => "reconnecting",
            MqttState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// One live broker link.
#[async_trait]
pub trait MqttConnection: Send {
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), MqttError>;

    /// Liveness as last observed by the underlying client.
    fn is_alive(&self) -> bool;

    async fn close(&mut self);
}

/// Factory for broker links; the injection seam for tests.
#[async_trait]
pub trait MqttConnector: Send + Sync {
    async fn connect(&self, settings: &MqttSettings) -> Result<Box<dyn MqttConnection>, MqttError>;
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    topic: String,
    payload: Vec<u8>,
    qos: QosLevel,
    retain: bool,
    retry_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttStats {
    pub state: MqttState,
    pub total_connections: u64,
    pub total_reconnections: u64,
    pub messages_published: u64,
    pub messages_queued: u64,
    pub messages_failed: u64,
    pub messages_dropped: u64,
    pub consecutive_failures: u64,
    pub queue_size: usize,
    pub last_attempt: Option<DateTime<Utc>>,
}

struct ClientShared {
    settings: MqttSettings,
    connector: Arc<dyn MqttConnector>,
    topics: Topics,
    state: Mutex<MqttState>,
    queue: Mutex<VecDeque<QueuedMessage>>,
    connection: tokio::sync::Mutex<Option<Box<dyn MqttConnection>>>,
    wake: Notify,
    enabled: AtomicBool,
    shutdown: CancellationToken,

    total_connections: AtomicU64,
    total_reconnections: AtomicU64,
    messages_published: AtomicU64,
    messages_queued: AtomicU64,
    messages_failed: AtomicU64,
    messages_dropped: AtomicU64,
    consecutive_failures: AtomicU64,
    last_attempt: Mutex<Option<DateTime<Utc>>>,
}

/// The resilience client. Cheap to clone.
#[derive(Clone)]
pub struct MqttResilienceClient {
    shared: Arc<ClientShared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MqttResilienceClient {
    pub fn new(settings: MqttSettings, connector: Arc<dyn MqttConnector>) -> Self {
        let topics = Topics::new(&settings.topic_prefix);
        Self {
            shared: Arc::new(ClientShared {
                settings,
                connector,
                topics,
                state: Mutex::new(MqttState::Disconnected),
                queue: Mutex::new(VecDeque::new()),
                connection: tokio::sync::Mutex::new(None),
                wake: Notify::new(),
                enabled: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
                total_connections: AtomicU64::new(0),
                total_reconnections: AtomicU64::new(0),
                messages_published: AtomicU64::new(0),
                messages_queued: AtomicU64::new(0),
                messages_failed: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
                consecutive_failures: AtomicU64::new(0),
                last_attempt: Mutex::new(None),
            }),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.shared.topics
    }

    pub fn state(&self) -> MqttState {
        *self.shared.state.lock().unwrap()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn stats(&self) -> MqttStats {
        let shared = &self.shared;
        MqttStats {
            state: self.state(),
            total_connections: shared.total_connections.load(Ordering::Relaxed),
            total_reconnections: shared.total_reconnections.load(Ordering::Relaxed),
            messages_published: shared.messages_published.load(Ordering::Relaxed),
            messages_queued: shared.messages_queued.load(Ordering::Relaxed),
            messages_failed: shared.messages_failed.load(Ordering::Relaxed),
            messages_dropped: shared.messages_dropped.load(Ordering::Relaxed),
            consecutive_failures: shared.consecutive_failures.load(Ordering::Relaxed),
            queue_size: self.queue_len(),
            last_attempt: *shared.last_attempt.lock().unwrap(),
        }
    }

    /// Start the connection worker and the liveness checker.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();

        let shared = self.shared.clone();
        tasks.push(tokio::spawn(async move { worker_loop(shared).await }));

        let shared = self.shared.clone();
        tasks.push(tokio::spawn(async move { health_loop(shared).await }));
    }

    /// Subscribe to the bus and translate events into broker publications.
    pub fn start_bridge(&self, bus: &EventBus, devices: DeviceRegistry) {
        let specs = [
            Topic::DeviceReading,
            Topic::DeviceStatus,
            Topic::VehicleSummary,
            Topic::DeviceDiscovered,
        ];
        let mut tasks = self.tasks.lock().unwrap();
        for topic in specs {
            let mut subscription = bus.subscribe(topic);
            let client = self.clone();
            let devices = devices.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    client.bridge_event(event, &devices);
                }
            }));
        }
    }

    fn bridge_event(&self, event: Event, devices: &DeviceRegistry) {
        let topics = &self.shared.topics;
        match event {
            Event::ReadingProduced { address, reading } => {
                let record = devices.get(&address);
                let value = payload::reading(
                    &address,
                    &reading,
                    record.as_ref().and_then(|r| r.vehicle_id.as_deref()),
                    record.as_ref().map(|r| r.kind.to_string()).as_deref(),
                );
                self.publish_json(topics.device_reading(&address), &value);
            }
            Event::StatusChanged {
                address,
                status,
                timestamp,
            } => {
                let value = payload::status(&address, &status, timestamp);
                self.publish_json(topics.device_status(&address), &value);
            }
            Event::VehicleSummaryUpdated { vehicle_id, summary } => {
                let value = payload::vehicle_summary(&summary);
                self.publish_json(topics.vehicle_summary(&vehicle_id), &value);
            }
            Event::DeviceDiscovered {
                address,
                hints,
                timestamp,
            } => {
                let value = payload::discovery(&address, hints.local_name.as_deref(), timestamp);
                self.publish_json(topics.discovery_found(), &value);
            }
            _ => {}
        }
    }

    /// Enqueue a JSON payload for a scheme topic. QoS and retain follow the
    /// topic class. Never blocks.
    pub fn publish_json(&self, topic: String, value: &serde_json::Value) {
        let (qos, retain) = self.shared.topics.delivery(&topic);
        let payload = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("unserializable MQTT payload for {}: {}", topic, e);
                return;
            }
        };
        self.enqueue(QueuedMessage {
            topic,
            payload,
            qos,
            retain,
            retry_count: 0,
        });
    }

    fn enqueue(&self, message: QueuedMessage) {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= self.shared.settings.message_queue_size {
            if let Some(dropped) = queue.pop_front() {
                self.shared.messages_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("MQTT queue full, dropping oldest message to {}", dropped.topic);
            }
        }
        queue.push_back(message);
        self.shared.messages_queued.fetch_add(1, Ordering::Relaxed);
        drop(queue);
        self.shared.wake.notify_one();
    }

    /// Operator re-enable after a terminal `FAILED`.
    pub fn enable(&self) {
        self.shared.enabled.store(true, Ordering::SeqCst);
        let mut state = self.shared.state.lock().unwrap();
        if *state == MqttState::Failed {
            *state = MqttState::Disconnected;
        }
        drop(state);
        self.shared.wake.notify_one();
        info!("MQTT client re-enabled");
    }

    /// Flush the queue for up to `grace`, then tear everything down.
    pub async fn stop(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline
            && self.queue_len() > 0
            && self.state() == MqttState::Connected
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if self.queue_len() > 0 {
            warn!(
                "stopping MQTT client with {} unflushed messages",
                self.queue_len()
            );
        }

        self.shared.shutdown.cancel();
        self.shared.wake.notify_waiters();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        if let Some(mut connection) = self.shared.connection.lock().await.take() {
            connection.close().await;
        }
        *self.shared.state.lock().unwrap() = MqttState::Disconnected;
        info!("MQTT client stopped");
    }
}

fn retry_policy(settings: &MqttSettings) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: settings.max_retries,
        initial_delay: Duration::from_secs_f64(settings.initial_retry_delay_s.max(0.01)),
        max_delay: Duration::from_secs_f64(settings.max_retry_delay_s.max(0.01)),
        multiplier: settings.backoff_multiplier,
        jitter_factor: settings.jitter_factor,
    }
}

impl ClientShared {
    fn set_state(&self, next: MqttState) {
        *self.state.lock().unwrap() = next;
    }

    fn state(&self) -> MqttState {
        *self.state.lock().unwrap()
    }

    /// `Connected -> Reconnecting`, counted once per episode.
    fn trip_reconnect(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == MqttState::Connected {
            *state = MqttState::Reconnecting;
            self.total_reconnections.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

async fn worker_loop(shared: Arc<ClientShared>) {
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        match shared.state() {
            MqttState::Connected => {
                drain_queue(&shared).await;
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
                let alive = {
                    let guard = shared.connection.lock().await;
                    guard.as_ref().map(|c| c.is_alive()).unwrap_or(false)
                };
                if !alive && shared.trip_reconnect() {
                    warn!("MQTT connection lost, reconnecting");
                }
            }
            MqttState::Failed => {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = shared.wake.notified() => {}
                }
            }
            state => {
                let reconnecting = state == MqttState::Reconnecting;
                if connect_episode(&shared, reconnecting).await {
                    drain_queue(&shared).await;
                }
            }
        }
    }
    debug!("MQTT worker stopped");
}

async fn health_loop(shared: Arc<ClientShared>) {
    let interval = shared.settings.health_check_interval();
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if shared.state() != MqttState::Connected {
            continue;
        }
        let alive = {
            let guard = shared.connection.lock().await;
            guard.as_ref().map(|c| c.is_alive()).unwrap_or(false)
        };
        if !alive && shared.trip_reconnect() {
            warn!("MQTT health check failed, reconnecting");
            shared.wake.notify_one();
        }
    }
}

/// One bounded run of connect attempts. Returns true on success; on
/// exhaustion the client goes terminal `FAILED`.
async fn connect_episode(shared: &Arc<ClientShared>, reconnecting: bool) -> bool {
    let policy = retry_policy(&shared.settings);
    if !reconnecting {
        shared.set_state(MqttState::Connecting);
    }

    // Drop the stale link before dialing a new one.
    if let Some(mut old) = shared.connection.lock().await.take() {
        old.close().await;
    }

    for attempt in 0..=policy.max_attempts {
        if shared.shutdown.is_cancelled() {
            return false;
        }
        *shared.last_attempt.lock().unwrap() = Some(Utc::now());

        let dial = shared.connector.connect(&shared.settings);
        match tokio::time::timeout(shared.settings.connection_timeout(), dial).await {
            Ok(Ok(connection)) => {
                *shared.connection.lock().await = Some(connection);
                shared.set_state(MqttState::Connected);
                shared.total_connections.fetch_add(1, Ordering::Relaxed);
                shared.consecutive_failures.store(0, Ordering::Relaxed);
                info!(
                    "connected to MQTT broker {}:{}",
                    shared.settings.broker, shared.settings.port
                );
                return true;
            }
            Ok(Err(e)) => {
                shared.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "MQTT connect attempt {}/{} failed: {}",
                    attempt + 1,
                    policy.max_attempts + 1,
                    e
                );
            }
            Err(_) => {
                shared.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "MQTT connect attempt {}/{} timed out",
                    attempt + 1,
                    policy.max_attempts + 1
                );
            }
        }

        if attempt < policy.max_attempts {
            let delay = backoff_delay(&policy, attempt);
            tokio::select! {
                _ = shared.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    warn!("MQTT connection failed after retry budget; operator re-enable required");
    shared.enabled.store(false, Ordering::SeqCst);
    shared.set_state(MqttState::Failed);
    false
}

/// Publish queued messages in order until the queue is empty or the link
/// misbehaves. A message that exhausts its retry budget is dropped and
/// counted.
async fn drain_queue(shared: &Arc<ClientShared>) {
    loop {
        let Some(mut message) = shared.queue.lock().unwrap().pop_front() else {
            return;
        };

        let mut guard = shared.connection.lock().await;
        let Some(connection) = guard.as_mut() else {
            shared.queue.lock().unwrap().push_front(message);
            return;
        };

        match connection
            .publish(&message.topic, &message.payload, message.qos, message.retain)
            .await
        {
            Ok(()) => {
                shared.messages_published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                drop(guard);
                message.retry_count += 1;
                if message.retry_count > shared.settings.message_retry_limit {
                    warn!(
                        "dropping message to {} after {} attempts: {}",
                        message.topic, message.retry_count, e
                    );
                    shared.messages_failed.fetch_add(1, Ordering::Relaxed);
                } else {
                    shared.queue.lock().unwrap().push_front(message);
                }
                if shared.trip_reconnect() {
                    warn!("publish failure tripped reconnection: {}", e);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockMqttConnector;
    use super::*;

    fn fast_settings() -> MqttSettings {
        MqttSettings {
            enabled: true,
            initial_retry_delay_s: 0.02,
            max_retry_delay_s: 0.1,
            jitter_factor: 0.0,
            connection_timeout_s: 1,
            health_check_interval_s: 1,
            message_queue_size: 10,
            message_retry_limit: 3,
            max_retries: 4,
            ..MqttSettings::default()
        }
    }

    async fn wait_for_state(client: &MqttResilienceClient, target: MqttState) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while client.state() != target {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {target}"));
    }

    #[tokio::test]
    async fn connects_and_publishes_in_order(){
        let connector = MockMqttConnector::new();
        let client = MqttResilienceClient::new(fast_settings(), Arc::new(connector.clone()));
        client.start();
        wait_for_state(&client, MqttState::Connected).await;

        for i in 0..5 {
            client.publish_json(format!("batwatch/device/D{i}/reading"), &serde_json::json!(i));
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while connector.published().len() < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let published = connector.published();
        for (i, (topic, _)) in published.iter().enumerate() {
            assert_eq!(topic, &format!("batwatch/device/D{i}/reading"));
        }
        assert_eq!(client.stats().messages_published, 5);
        client.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn queue_drops_oldest_on_overflow() {
        let connector = MockMqttConnector::new();
        connector.set_broker_up(false);
        let client = MqttResilienceClient::new(fast_settings(), Arc::new(connector.clone()));
        // Not started: everything queues.
        for i in 0..15 {
            client.publish_json(format!("t/{i}"), &serde_json::json!(i));
        }
        assert_eq!(client.queue_len(), 10);
        let front = client.shared.queue.lock().unwrap().front().unwrap().topic.clone();
        assert_eq!(front, "t/5");
        assert_eq!(client.stats().messages_dropped, 5);
    }

    #[tokio::test]
    async fn broker_outage_queues_then_flushes_in_order() {
        let connector = MockMqttConnector::new();
        let client = MqttResilienceClient::new(
            MqttSettings {
                message_queue_size: 100,
                ..fast_settings()
            },
            Arc::new(connector.clone()),
        );
        client.start();
        wait_for_state(&client, MqttState::Connected).await;

        connector.set_broker_up(false);
        for i in 0..50 {
            client.publish_json(format!("t/{i}"), &serde_json::json!(i));
        }
        wait_for_state(&client, MqttState::Reconnecting).await;
        assert!(client.queue_len() >= 49);

        tokio::time::sleep(Duration::from_millis(100)).await;
        connector.set_broker_up(true);
        wait_for_state(&client, MqttState::Connected).await;

        tokio::time::timeout(Duration::from_secs(3), async {
            while connector.published().len() < 50 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let published = connector.published();
        for (i, (topic, _)) in published.iter().enumerate() {
            assert_eq!(topic, &format!("t/{i}"));
        }
        let stats = client.stats();
        assert_eq!(stats.messages_failed, 0);
        assert_eq!(stats.total_reconnections, 1);
        client.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn exhausted_retries_go_terminal_failed_until_enabled() {
        let connector = MockMqttConnector::new();
        connector.set_broker_up(false);
        let client = MqttResilienceClient::new(
            MqttSettings {
                max_retries: 1,
                ..fast_settings()
            },
            Arc::new(connector.clone()),
        );
        client.start();
        wait_for_state(&client, MqttState::Failed).await;

        // Still failed: nothing happens without an operator.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.state(), MqttState::Failed);

        connector.set_broker_up(true);
        client.enable();
        wait_for_state(&client, MqttState::Connected).await;
        client.stop(Duration::from_millis(100)).await;
    }
}
