//! Engine orchestrator.
//!
//! Owns the authoritative device/vehicle registries, drives discovery under
//! exclusive adapter access, starts and stops sessions as configuration
//! changes, fans events out on the bus, and runs the ordered shutdown
//! sequence. The REST/CLI surfaces are mechanical translators over the
//! methods exposed here.

pub mod state;
pub mod summary;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::CoreConfig;
use crate::connection::pool::{ConnectionPool, PoolConfig, REASON_LINK_LOST};
use crate::connection::reconnect::{ReconnectController, ReconnectPolicy};
use crate::connection::state::LinkState;
use crate::device::registry::{
    detect_kind, DeviceRecord, DeviceRegistry, RegistryStore, VehicleRecord, VehicleRegistry,
};
use crate::device::session::{DeviceSession, SessionConfig};
use crate::events::{Event, Topic};
use crate::mqtt::{payload as mqtt_payload, MqttConnector, MqttResilienceClient, MqttStats};
use crate::protocol::ProtocolFamily;
use crate::scheduler::PollScheduler;
use crate::storage::ReadingSink;
use crate::transport::BleTransport;
use crate::types::{
    normalize_address, DeviceKind, DeviceLifecycle, Error, Reading, Result, RuntimeStatus,
};

use self::state::{DeviceRuntime, RuntimeRegistry};
use self::summary::VehicleSummary;

/// How long the MQTT queue may keep flushing during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Cadence of the session/registry reconciliation loop.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence of system-status publications to MQTT.
const SYSTEM_STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Aggregate engine health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub uptime_s: u64,
    pub version: &'static str,
    pub total_devices: usize,
    pub configured_devices: usize,
    pub connected_devices: usize,
    pub vehicles: usize,
    pub active_sessions: usize,
    pub polls_completed: u64,
    pub polls_skipped: u64,
    pub polls_cancelled: u64,
    pub storage_connected: bool,
    pub mqtt: Option<MqttStats>,
}

/// Everything known about one device, for the external API.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealth {
    pub record: DeviceRecord,
    pub runtime: Option<DeviceRuntime>,
    pub link_state: LinkState,
    pub link_history: Vec<(LinkState, chrono::DateTime<Utc>)>,
}

struct EngineInner {
    config: CoreConfig,
    bus: EventBus,
    pool: ConnectionPool,
    scheduler: PollScheduler,
    reconnect: ReconnectController,
    devices: DeviceRegistry,
    vehicles: VehicleRegistry,
    store: Arc<dyn RegistryStore>,
    runtime: RuntimeRegistry,
    sessions: Mutex<HashMap<String, Arc<DeviceSession>>>,
    summary_cache: Mutex<HashMap<String, String>>,
    sink: Mutex<Option<Arc<dyn ReadingSink>>>,
    mqtt_connector: Mutex<Option<Arc<dyn MqttConnector>>>,
    mqtt: Mutex<Option<MqttResilienceClient>>,
    reconnect_tx: mpsc::Sender<String>,
    reconnect_rx: tokio::sync::Mutex<Option<mpsc::Receiver<String>>>,
    discovery_enabled: AtomicBool,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    root: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The core context. Cheap to clone; construct one per process (or per
/// test, with doubles injected).
#[derive(Clone)]
pub struct CoreEngine {
    inner: Arc<EngineInner>,
}

impl CoreEngine {
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn BleTransport>,
        store: Arc<dyn RegistryStore>,
    ) -> Self {
        let bus = EventBus::default();
        let pool_config = PoolConfig {
            max_connections: config.bluetooth.max_concurrent_connections,
            connect_timeout: config.bluetooth.connection_timeout(),
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(transport, pool_config, bus.clone());
        let scheduler = PollScheduler::new(config.bluetooth.max_concurrent_connections, bus.clone());
        let reconnect = ReconnectController::new(pool.clone());
        let (reconnect_tx, reconnect_rx) = mpsc::channel(32);

        Self {
            inner: Arc::new(EngineInner {
                config,
                bus,
                pool,
                scheduler,
                reconnect,
                devices: DeviceRegistry::new(),
                vehicles: VehicleRegistry::new(),
                store,
                runtime: RuntimeRegistry::new(),
                sessions: Mutex::new(HashMap::new()),
                summary_cache: Mutex::new(HashMap::new()),
                sink: Mutex::new(None),
                mqtt_connector: Mutex::new(None),
                mqtt: Mutex::new(None),
                reconnect_tx,
                reconnect_rx: tokio::sync::Mutex::new(Some(reconnect_rx)),
                discovery_enabled: AtomicBool::new(true),
                running: AtomicBool::new(false),
                started_at: Mutex::new(None),
                root: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach a time-series sink. Call before `start`.
    pub fn with_sink(self, sink: Arc<dyn ReadingSink>) -> Self {
        *self.inner.sink.lock().unwrap() = Some(sink);
        self
    }

    /// Attach an MQTT connector. Call before `start`; only used when
    /// `config.mqtt.enabled`.
    pub fn with_mqtt_connector(self, connector: Arc<dyn MqttConnector>) -> Self {
        *self.inner.mqtt_connector.lock().unwrap() = Some(connector);
        self
    }

    pub fn bus(&self) -> EventBus {
        self.inner.bus.clone()
    }

    pub fn pool(&self) -> ConnectionPool {
        self.inner.pool.clone()
    }

    pub fn mqtt(&self) -> Option<MqttResilienceClient> {
        self.inner.mqtt.lock().unwrap().clone()
    }

    /// Hydrate registries, start every background activity, and return.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("starting core engine");
        *self.inner.started_at.lock().unwrap() = Some(Instant::now());

        let (device_doc, vehicle_doc) = self.inner.store.load().await?;
        self.inner.devices.hydrate(device_doc);
        self.inner.vehicles.hydrate(vehicle_doc);

        let root = &self.inner.root;
        let mut tasks = Vec::new();

        tasks.push(self.inner.pool.spawn_sweeper(root.child_token()));
        tasks.push(self.spawn_reconcile_loop(root.child_token()));
        tasks.push(self.spawn_summary_task(root.child_token()));
        tasks.push(self.spawn_connection_watch(root.child_token()));
        tasks.push(self.spawn_forced_reconnect_listener(root.child_token()).await);

        if let Some(sink) = self.inner.sink.lock().unwrap().clone() {
            if self.inner.config.storage.enabled {
                tasks.push(self.spawn_storage_writer(sink, root.child_token()));
            }
        }

        if self.inner.config.mqtt.enabled {
            let connector = self.inner.mqtt_connector.lock().unwrap().clone();
            match connector {
                Some(connector) => {
                    let client =
                        MqttResilienceClient::new(self.inner.config.mqtt.clone(), connector);
                    client.start();
                    client.start_bridge(&self.inner.bus, self.inner.devices.clone());
                    tasks.push(self.spawn_system_status(client.clone(), root.child_token()));
                    *self.inner.mqtt.lock().unwrap() = Some(client);
                }
                None => warn!("MQTT enabled but no connector attached; skipping"),
            }
        }

        if self.inner.config.discovery.initial_scan {
            let engine = self.clone();
            let token = root.child_token();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = engine.run_discovery() => {
                        if let Err(e) = result {
                            warn!("initial discovery failed: {}", e);
                        }
                    }
                }
            }));
        }
        tasks.push(self.spawn_periodic_discovery(root.child_token()));

        self.inner.tasks.lock().unwrap().extend(tasks);
        info!("core engine started");
        Ok(())
    }

    /// Ordered shutdown: discovery and polling stop, sessions close
    /// (unsubscribe then disconnect), MQTT flushes within the grace window,
    /// `system.shutdown` goes out last, and the bus closes.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("shutting down core engine");

        self.inner.discovery_enabled.store(false, Ordering::SeqCst);
        self.inner.root.cancel();
        self.inner.scheduler.shutdown();
        self.inner.reconnect.cancel_all();

        let sessions: Vec<Arc<DeviceSession>> = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.stop().await;
        }

        let mqtt = self.inner.mqtt.lock().unwrap().clone();
        if let Some(mqtt) = &mqtt {
            mqtt.stop(SHUTDOWN_GRACE).await;
        }

        self.inner.bus.publish(Event::Shutdown {
            timestamp: Utc::now(),
        });
        self.inner.bus.close();

        let tasks: Vec<_> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }

        self.persist().await;
        info!("core engine stopped");
    }

    // ── Operator surface ─────────────────────────────────────────────

    pub fn list_devices(&self) -> Vec<DeviceRecord> {
        self.inner.devices.snapshot()
    }

    pub fn get_device(&self, address: &str) -> Option<DeviceRecord> {
        self.inner.devices.get(address)
    }

    /// Add (or configure) a device for polling.
    pub async fn add_device(
        &self,
        address: &str,
        kind: DeviceKind,
        name: Option<String>,
        poll_interval_s: Option<u64>,
    ) -> Result<DeviceRecord> {
        let address = normalize_address(address)?;
        if self.inner.devices.get(&address).is_none() {
            let record =
                DeviceRecord::discovered(address.clone(), kind, Default::default());
            self.inner.devices.add(record)?;
        }
        let record = self
            .inner
            .devices
            .configure(&address, name, poll_interval_s)?;
        self.persist().await;
        self.reconcile().await;
        Ok(record)
    }

    pub async fn remove_device(&self, address: &str) -> Result<DeviceRecord> {
        let address = normalize_address(address)?;
        self.inner.scheduler.deregister(&address);
        self.inner.reconnect.cancel(&address);
        let session = self.inner.sessions.lock().unwrap().remove(&address);
        if let Some(session) = session {
            session.stop().await;
        }
        let _ = self.inner.pool.disconnect(&address).await;
        self.inner.pool.forget(&address);
        self.inner.runtime.remove(&address);
        let record = self.inner.devices.remove(&address)?;
        self.persist().await;
        Ok(record)
    }

    pub fn list_vehicles(&self) -> Vec<VehicleRecord> {
        self.inner.vehicles.snapshot()
    }

    pub async fn add_vehicle(&self, id: &str, name: &str) -> VehicleRecord {
        let record = self.inner.vehicles.add(id, name);
        self.persist().await;
        record
    }

    pub async fn remove_vehicle(&self, id: &str) -> Result<VehicleRecord> {
        // Clear member associations first; history is untouched.
        for member in self.inner.devices.members_of(id) {
            let _ = self.inner.devices.associate(&member.address, None);
        }
        let record = self.inner.vehicles.remove(id)?;
        self.inner.summary_cache.lock().unwrap().remove(id);
        self.persist().await;
        Ok(record)
    }

    /// Associate a device with a vehicle (or clear with `None`).
    pub async fn associate(&self, address: &str, vehicle_id: Option<String>) -> Result<()> {
        let address = normalize_address(address)?;
        if let Some(id) = &vehicle_id {
            if self.inner.vehicles.get(id).is_none() {
                return Err(Error::NotFound(format!("vehicle {id}")));
            }
        }
        let previous = self
            .inner
            .devices
            .get(&address)
            .and_then(|r| r.vehicle_id.clone());
        self.inner.devices.associate(&address, vehicle_id.clone())?;

        if let Some(id) = &vehicle_id {
            self.inner.bus.publish(Event::VehicleAssociated {
                vehicle_id: id.clone(),
                address: address.clone(),
                timestamp: Utc::now(),
            });
        }
        // Both the old and the new vehicle changed shape.
        if let Some(previous) = previous {
            self.refresh_summary(&previous);
        }
        if let Some(id) = &vehicle_id {
            self.refresh_summary(id);
        }
        self.persist().await;
        Ok(())
    }

    pub fn latest_reading(&self, address: &str) -> Option<Reading> {
        self.inner.runtime.latest_reading(address)
    }

    pub fn device_status(&self, address: &str) -> RuntimeStatus {
        self.inner.runtime.status(address)
    }

    /// Live stream of `device.reading` events.
    pub fn reading_stream(&self) -> crate::bus::Subscription {
        self.inner.bus.subscribe(Topic::DeviceReading)
    }

    pub fn subscribe(&self, topic: Topic) -> crate::bus::Subscription {
        self.inner.bus.subscribe(topic)
    }

    pub fn device_health(&self, address: &str) -> Option<DeviceHealth> {
        let record = self.inner.devices.get(address)?;
        Some(DeviceHealth {
            runtime: self.inner.runtime.snapshot(address),
            link_state: self.inner.pool.state(address),
            link_history: self.inner.pool.history(address),
            record,
        })
    }

    pub fn status(&self) -> EngineStatus {
        let poll = self.inner.scheduler.stats();
        let storage_connected = self
            .inner
            .sink
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.connected())
            .unwrap_or(false);
        EngineStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            uptime_s: self.uptime().as_secs(),
            version: env!("CARGO_PKG_VERSION"),
            total_devices: self.inner.devices.len(),
            configured_devices: self.inner.devices.configured().len(),
            connected_devices: self.inner.runtime.connected_count(),
            vehicles: self.inner.vehicles.len(),
            active_sessions: self.inner.sessions.lock().unwrap().len(),
            polls_completed: poll.completed,
            polls_skipped: poll.skipped,
            polls_cancelled: poll.cancelled,
            storage_connected,
            mqtt: self.inner.mqtt.lock().unwrap().as_ref().map(|m| m.stats()),
        }
    }

    /// Tear down the device's link and restart the reconnection controller
    /// with a fresh budget.
    pub async fn force_reconnect(&self, address: &str) -> Result<()> {
        let address = normalize_address(address)?;
        let record = self
            .inner
            .devices
            .get(&address)
            .ok_or_else(|| Error::NotFound(format!("device {address}")))?;

        self.inner.reconnect.cancel(&address);
        let session = self.inner.sessions.lock().unwrap().get(&address).cloned();
        if let Some(session) = session {
            session.close().await;
        }
        let _ = self.inner.pool.disconnect(&address).await;

        let subscriptions = self.inner.pool.take_orphaned_subscriptions(&address);
        self.inner.reconnect.arm(
            &address,
            reconnect_policy(&record),
            subscriptions,
            &self.inner.root,
        );
        Ok(())
    }

    /// Re-read the registry documents from the store and reconcile sessions
    /// against the result. External writers call this after changing the
    /// files underneath us.
    pub async fn reload_registries(&self) -> Result<()> {
        let (device_doc, vehicle_doc) = self.inner.store.load().await?;
        self.inner.devices.hydrate(device_doc);
        self.inner.vehicles.hydrate(vehicle_doc);
        self.reconcile().await;
        Ok(())
    }

    pub fn start_discovery(&self) {
        self.inner.discovery_enabled.store(true, Ordering::SeqCst);
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_discovery().await {
                warn!("operator discovery failed: {}", e);
            }
        });
    }

    pub fn stop_discovery(&self) {
        self.inner.discovery_enabled.store(false, Ordering::SeqCst);
    }

    /// One scan cycle under exclusive adapter access.
    pub async fn run_discovery(&self) -> Result<usize> {
        let duration = self.inner.config.discovery.scan_duration();
        info!("discovery scan for {:?}", duration);

        // Drain outstanding polls and hold new admissions for the window.
        let gate = self.inner.scheduler.quiesce().await;
        let mut advertisements = self.inner.pool.transport().scan(duration).await?;

        let mut found = 0;
        while let Some(advertisement) = advertisements.recv().await {
            let hints = advertisement.hints();
            let kind = detect_kind(&hints);
            let Ok(address) = normalize_address(&advertisement.address) else {
                continue;
            };
            if let Some(record) =
                self.inner
                    .devices
                    .register_discovered(&address, kind, hints.clone())
            {
                found += 1;
                debug!("discovered {} ({})", record.address, record.kind);
                self.inner.bus.publish(Event::DeviceDiscovered {
                    address: record.address.clone(),
                    hints,
                    timestamp: Utc::now(),
                });
            }
        }
        drop(gate);

        if found > 0 {
            self.persist().await;
        }

        // A discovery tick also re-arms devices stranded in terminal ERROR.
        for record in self.inner.devices.configured() {
            if self.inner.pool.state(&record.address) == LinkState::Error
                && !self.inner.reconnect.is_armed(&record.address)
            {
                info!("{}: re-arming reconnection after discovery tick", record.address);
                let subscriptions = self
                    .inner
                    .pool
                    .take_orphaned_subscriptions(&record.address);
                self.inner.reconnect.arm(
                    &record.address,
                    reconnect_policy(&record),
                    subscriptions,
                    &self.inner.root,
                );
            }
        }

        info!("discovery completed: {} new devices", found);
        Ok(found)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn uptime(&self) -> Duration {
        self.inner
            .started_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    async fn persist(&self) {
        if let Err(e) = self
            .inner
            .store
            .save_devices(&self.inner.devices.document())
            .await
        {
            error!("failed to persist device registry: {}", e);
        }
        if let Err(e) = self
            .inner
            .store
            .save_vehicles(&self.inner.vehicles.document())
            .await
        {
            error!("failed to persist vehicle registry: {}", e);
        }
    }

    /// Align running sessions with the configured-device set.
    async fn reconcile(&self) {
        let configured = self.inner.devices.configured();
        let configured_set: std::collections::HashSet<String> =
            configured.iter().map(|r| r.address.clone()).collect();

        let (to_start, to_stop) = {
            let sessions = self.inner.sessions.lock().unwrap();
            let to_start: Vec<DeviceRecord> = configured
                .iter()
                .filter(|r| !sessions.contains_key(&r.address))
                .cloned()
                .collect();
            let to_stop: Vec<String> = sessions
                .keys()
                .filter(|address| !configured_set.contains(*address))
                .cloned()
                .collect();
            (to_start, to_stop)
        };

        for record in to_start {
            let session = Arc::new(DeviceSession::new(
                record.address.clone(),
                ProtocolFamily::for_kind(record.kind),
                self.inner.pool.clone(),
                self.inner.bus.clone(),
                self.inner.runtime.clone(),
                SessionConfig::default(),
                Some(self.inner.reconnect_tx.clone()),
            ));
            self.inner
                .sessions
                .lock()
                .unwrap()
                .insert(record.address.clone(), session.clone());
            self.inner.scheduler.register(
                session,
                Duration::from_secs(record.poll_interval_s),
                &self.inner.root,
            );
        }

        for address in to_stop {
            info!("device {} no longer configured, stopping session", address);
            self.inner.scheduler.deregister(&address);
            self.inner.reconnect.cancel(&address);
            let session = self.inner.sessions.lock().unwrap().remove(&address);
            if let Some(session) = session {
                session.stop().await;
            }
        }
    }

    fn refresh_summary(&self, vehicle_id: &str) {
        if self.inner.vehicles.get(vehicle_id).is_none() {
            return;
        }
        let members = self.inner.devices.members_of(vehicle_id);
        let summary = summary::compute(vehicle_id, &members, &self.inner.runtime);
        let fingerprint = summary.fingerprint();

        let changed = {
            let mut cache = self.inner.summary_cache.lock().unwrap();
            match cache.get(vehicle_id) {
                Some(previous) if *previous == fingerprint => false,
                _ => {
                    cache.insert(vehicle_id.to_string(), fingerprint);
                    true
                }
            }
        };
        if changed {
            self.publish_summary(summary);
        }
    }

    fn publish_summary(&self, summary: VehicleSummary) {
        self.inner.bus.publish(Event::VehicleSummaryUpdated {
            vehicle_id: summary.vehicle_id.clone(),
            summary,
        });
    }

    fn spawn_reconcile_loop(&self, token: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                engine.reconcile().await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
                }
            }
        })
    }

    fn spawn_summary_task(&self, token: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let mut readings = self.inner.bus.subscribe(Topic::DeviceReading);
        let mut associations = self.inner.bus.subscribe(Topic::VehicleAssociated);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = readings.recv() => match event {
                        Some(Event::ReadingProduced { address, .. }) => {
                            if let Some(vehicle_id) = engine
                                .inner
                                .devices
                                .get(&address)
                                .and_then(|r| r.vehicle_id)
                            {
                                engine.refresh_summary(&vehicle_id);
                            }
                        }
                        None => break,
                        _ => {}
                    },
                    event = associations.recv() => match event {
                        Some(Event::VehicleAssociated { vehicle_id, .. }) => {
                            engine.refresh_summary(&vehicle_id);
                        }
                        None => break,
                        _ => {}
                    },
                }
            }
        })
    }

    /// Arm the reconnection controller when the pool reports a lost link.
    fn spawn_connection_watch(&self, token: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let mut connections = self.inner.bus.subscribe(Topic::DeviceConnection);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = connections.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let Event::ConnectionChanged {
                    address,
                    new_state: LinkState::Reconnecting,
                    reason,
                    ..
                } = event
                else {
                    continue;
                };
                if reason != REASON_LINK_LOST {
                    continue;
                }
                let Some(record) = engine.inner.devices.get(&address) else {
                    continue;
                };
                if record.status != DeviceLifecycle::Configured {
                    continue;
                }

                let delay = Duration::from_secs(record.connection.reconnect_delay_s);
                let engine = engine.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let subscriptions =
                        engine.inner.pool.take_orphaned_subscriptions(&address);
                    engine.inner.reconnect.arm(
                        &address,
                        reconnect_policy(&record),
                        subscriptions,
                        &engine.inner.root,
                    );
                });
            }
        })
    }

    async fn spawn_forced_reconnect_listener(&self, token: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let mut rx = self
            .inner
            .reconnect_rx
            .lock()
            .await
            .take()
            .expect("forced-reconnect listener started twice");
        tokio::spawn(async move {
            loop {
                let address = tokio::select! {
                    _ = token.cancelled() => break,
                    address = rx.recv() => match address {
                        Some(address) => address,
                        None => break,
                    },
                };
                if let Err(e) = engine.force_reconnect(&address).await {
                    warn!("forced reconnect of {} failed: {}", address, e);
                }
            }
        })
    }

    fn spawn_storage_writer(
        &self,
        sink: Arc<dyn ReadingSink>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let devices = self.inner.devices.clone();
        let mut readings = self.inner.bus.subscribe(Topic::DeviceReading);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = readings.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let Event::ReadingProduced { address, reading } = event else {
                    continue;
                };
                let vehicle_id = devices.get(&address).and_then(|r| r.vehicle_id);
                // One attempt per reading; availability is the writer's concern.
                let outcome = sink
                    .write(
                        &address,
                        vehicle_id.as_deref(),
                        &reading.protocol,
                        &reading,
                        reading.timestamp,
                    )
                    .await;
                debug!("stored reading from {}: {:?}", address, outcome);
            }
        })
    }

    fn spawn_system_status(
        &self,
        client: MqttResilienceClient,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let status = engine.status();
                let value = mqtt_payload::system_status(
                    status.running,
                    status.uptime_s,
                    status.storage_connected,
                    &status.mqtt.map(|m| m.state.to_string()).unwrap_or_default(),
                    status.connected_devices,
                );
                client.publish_json(client.topics().system_status(), &value);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(SYSTEM_STATUS_INTERVAL) => {}
                }
            }
        })
    }

    fn spawn_periodic_discovery(&self, token: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let interval = self.inner.config.discovery.periodic_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !engine.inner.discovery_enabled.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = engine.run_discovery().await {
                    warn!("periodic discovery failed: {}", e);
                }
            }
        })
    }
}

fn reconnect_policy(record: &DeviceRecord) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: record.connection.retry_attempts,
        initial_delay: Duration::from_secs(record.connection.retry_interval_s.max(1)),
        ..ReconnectPolicy::default()
    }
}
