//! Device session: binds one device record to the pool for the duration of
//! its lifecycle.
//!
//! `open` connects through the pool and subscribes the notification
//! characteristic with a handler that decrypts, parses, and publishes valid
//! readings. Requests are serialized per device; each carries its own
//! timeout, and a run of consecutive timeouts asks the orchestrator for a
//! forced reconnect. `close` unsubscribes, then disconnects.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::connection::pool::{ConnectionPool, PoolError};
use crate::engine::state::RuntimeRegistry;
use crate::events::Event;
use crate::protocol::{Frame, ProtocolError, ProtocolFamily, RequestKind};
use crate::transport::NotificationHandler;
use crate::types::Reading;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not open")]
    NotOpen,

    #[error("command {command} timed out after {timeout:?}")]
    CommandTimeout {
        command: &'static str,
        timeout: Duration,
    },

    #[error("unexpected response to {command}")]
    UnexpectedResponse { command: &'static str },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-command response timeout.
    pub command_timeout: Duration,
    /// Consecutive command timeouts before a forced reconnect is requested.
    pub failure_threshold: u32,
    /// Keep the link open between polls. Off by default so devices beyond
    /// the connection cap take turns.
    pub keep_open: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            keep_open: false,
        }
    }
}

pub struct DeviceSession {
    address: String,
    family: ProtocolFamily,
    pool: ConnectionPool,
    bus: EventBus,
    runtime: RuntimeRegistry,
    config: SessionConfig,
    /// Receiver for frames the notification handler saw; the mutex also
    /// serializes requests per device.
    responses: Mutex<Option<mpsc::Receiver<Frame>>>,
    /// Set by `stop`; late notifications are parsed but never published.
    stopped: Arc<AtomicBool>,
    consecutive_timeouts: AtomicU32,
    /// Orchestrator channel for forced-reconnect requests.
    reconnect_tx: Option<mpsc::Sender<String>>,
}

impl DeviceSession {
    pub fn new(
        address: String,
        family: ProtocolFamily,
        pool: ConnectionPool,
        bus: EventBus,
        runtime: RuntimeRegistry,
        config: SessionConfig,
        reconnect_tx: Option<mpsc::Sender<String>>,
    ) -> Self {
        Self {
            address,
            family,
            pool,
            bus,
            runtime,
            config,
            responses: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
            consecutive_timeouts: AtomicU32::new(0),
            reconnect_tx,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Connect through the pool and install the notification handler.
    pub async fn open(&self) -> Result<(), SessionError> {
        self.pool.get_or_connect(&self.address).await?;

        let (tx, rx) = mpsc::channel(8);
        *self.responses.lock().await = Some(rx);

        let characteristics = self.family.characteristics();
        self.pool
            .start_notify(&self.address, characteristics.notify, self.handler(tx))
            .await?;
        self.runtime.set_connected(&self.address, true);
        debug!("{}: session open", self.address);
        Ok(())
    }

    fn handler(&self, tx: mpsc::Sender<Frame>) -> NotificationHandler {
        let family = self.family;
        let address = self.address.clone();
        let bus = self.bus.clone();
        let runtime = self.runtime.clone();
        let stopped = self.stopped.clone();

        Arc::new(move |payload: &[u8]| {
            match family.parse_notification(payload) {
                Ok(Some(Frame::Reading(reading))) => {
                    if stopped.load(Ordering::SeqCst) {
                        debug!("{}: session stopping, reading discarded", address);
                    } else {
                        runtime.record_reading(&address, &reading);
                        bus.publish(Event::ReadingProduced {
                            address: address.clone(),
                            reading: reading.clone(),
                        });
                    }
                    let _ = tx.try_send(Frame::Reading(reading));
                }
                Ok(Some(Frame::Version(version))) => {
                    runtime.set_protocol_version(&address, &version);
                    let _ = tx.try_send(Frame::Version(version));
                }
                Ok(Some(Frame::Cells(cells))) => {
                    let _ = tx.try_send(Frame::Cells(cells));
                }
                Ok(None) => {}
                Err(ProtocolError::UnknownOpcode { opcode, raw }) => {
                    debug!(
                        "{}: unknown opcode {} in notification {}",
                        address,
                        opcode,
                        hex::encode(raw)
                    );
                }
                Err(e) => {
                    warn!(
                        "{}: discarding notification: {} (raw {})",
                        address,
                        e,
                        hex::encode(e.raw())
                    );
                }
            }
        })
    }

    /// Issue a request and wait for its response frame. A second request on
    /// the same device waits until the first completes.
    pub async fn request(&self, kind: RequestKind) -> Result<Frame, SessionError> {
        let mut guard = self.responses.lock().await;
        let rx = guard.as_mut().ok_or(SessionError::NotOpen)?;

        // Discard frames from earlier unsolicited notifications.
        while rx.try_recv().is_ok() {}

        let command = self.family.build_request(kind)?;
        let characteristics = self.family.characteristics();
        self.pool
            .write_char(&self.address, characteristics.write, &command)
            .await?;
        self.runtime.set_last_command(&self.address, kind.label());

        match tokio::time::timeout(self.config.command_timeout, rx.recv()).await {
            Ok(Some(frame)) => {
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                Ok(frame)
            }
            Ok(None) => Err(SessionError::NotOpen),
            Err(_) => {
                self.runtime
                    .record_error(&self.address, 408, "command response timed out");
                let run = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                if run >= self.config.failure_threshold {
                    self.consecutive_timeouts.store(0, Ordering::SeqCst);
                    warn!(
                        "{}: {} consecutive command timeouts, requesting reconnect",
                        self.address, run
                    );
                    if let Some(tx) = &self.reconnect_tx {
                        let _ = tx.try_send(self.address.clone());
                    }
                }
                Err(SessionError::CommandTimeout {
                    command: kind.label(),
                    timeout: self.config.command_timeout,
                })
            }
        }
    }

    pub async fn request_voltage_temp(&self) -> Result<Reading, SessionError> {
        match self.request(RequestKind::VoltageTemp).await? {
            Frame::Reading(reading) => Ok(reading),
            _ => Err(SessionError::UnexpectedResponse {
                command: RequestKind::VoltageTemp.label(),
            }),
        }
    }

    /// Basic info: a full reading on the legacy family, a firmware version
    /// frame on the encrypted one.
    pub async fn request_basic_info(&self) -> Result<Frame, SessionError> {
        self.request(RequestKind::BasicInfo).await
    }

    pub async fn request_cell_voltages(&self) -> Result<Vec<f64>, SessionError> {
        match self.request(RequestKind::CellVoltages).await? {
            Frame::Cells(cells) => Ok(cells),
            _ => Err(SessionError::UnexpectedResponse {
                command: RequestKind::CellVoltages.label(),
            }),
        }
    }

    /// One poll cycle: open, sample, publish status, and close again unless
    /// the session is configured to hold the link.
    pub async fn poll(&self) -> Result<Reading, SessionError> {
        self.open().await?;
        let result = self.request_voltage_temp().await;

        self.bus.publish(Event::StatusChanged {
            address: self.address.clone(),
            status: self.runtime.status(&self.address),
            timestamp: Utc::now(),
        });

        if !self.config.keep_open {
            self.close().await;
        }
        result
    }

    /// Unsubscribe, then disconnect. Safe to call repeatedly.
    pub async fn close(&self) {
        let characteristics = self.family.characteristics();
        let _ = self
            .pool
            .stop_notify(&self.address, characteristics.notify)
            .await;
        let _ = self.pool.disconnect(&self.address).await;
        *self.responses.lock().await = None;
        self.runtime.set_connected(&self.address, false);
        debug!("{}: session closed", self.address);
    }

    /// Permanent stop: gate publications immediately, then tear down the
    /// link. Notifications that race the unsubscribe are parsed but never
    /// reach the bus.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::connection::pool::PoolConfig;
    use crate::events::Topic;
    use crate::protocol::crypto;
    use crate::transport::mock::MockTransport;
    use crate::transport::BleTransport;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    fn realtime_block() -> Vec<u8> {
        let mut block = [0u8; 16];
        block[..9].copy_from_slice(&hex::decode("d1550700fb005504ec").unwrap());
        crypto::encrypt(&block).unwrap()
    }

    fn harness(transport: MockTransport) -> (Arc<DeviceSession>, EventBus) {
        let bus = EventBus::default();
        let pool = ConnectionPool::new(
            Arc::new(transport),
            PoolConfig {
                connect_timeout: Duration::from_millis(200),
                ..PoolConfig::default()
            },
            bus.clone(),
        );
        let session = Arc::new(DeviceSession::new(
            ADDR.to_string(),
            ProtocolFamily::Bm6,
            pool,
            bus.clone(),
            RuntimeRegistry::new(),
            SessionConfig {
                command_timeout: Duration::from_millis(200),
                ..SessionConfig::default()
            },
            None,
        ));
        (session, bus)
    }

    #[tokio::test]
    async fn poll_produces_a_reading_event() {
        let transport = MockTransport::new();
        let notify = ProtocolFamily::Bm6.characteristics().notify;
        transport.respond_to_writes(ADDR, notify, Arc::new(|_| Some(realtime_block())));

        let (session, bus) = harness(transport);
        let mut readings = bus.subscribe(Topic::DeviceReading);

        let reading = session.poll().await.unwrap();
        assert!((reading.voltage - 12.60).abs() < 1e-9);

        match readings.recv().await.unwrap() {
            Event::ReadingProduced { address, reading } => {
                assert_eq!(address, ADDR);
                assert!((reading.state_of_charge - 85.0).abs() < 1e-9);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_after_poll_releases_the_link() {
        let transport = MockTransport::new();
        let notify = ProtocolFamily::Bm6.characteristics().notify;
        transport.respond_to_writes(ADDR, notify, Arc::new(|_| Some(realtime_block())));

        let (session, _bus) = harness(transport.clone());
        session.poll().await.unwrap();
        assert!(!transport.is_connected(ADDR).await);
    }

    #[tokio::test]
    async fn timeout_counts_toward_forced_reconnect() {
        let transport = MockTransport::new();
        let bus = EventBus::default();
        let pool = ConnectionPool::new(
            Arc::new(transport),
            PoolConfig {
                connect_timeout: Duration::from_millis(200),
                ..PoolConfig::default()
            },
            bus.clone(),
        );
        let (reconnect_tx, mut reconnect_rx) = mpsc::channel(4);
        let session = DeviceSession::new(
            ADDR.to_string(),
            ProtocolFamily::Bm6,
            pool,
            bus,
            RuntimeRegistry::new(),
            SessionConfig {
                command_timeout: Duration::from_millis(30),
                failure_threshold: 2,
                keep_open: true,
            },
            Some(reconnect_tx),
        );

        session.open().await.unwrap();
        for _ in 0..2 {
            let err = session.request(RequestKind::VoltageTemp).await.unwrap_err();
            assert!(matches!(err, SessionError::CommandTimeout { .. }));
        }
        assert_eq!(reconnect_rx.recv().await.unwrap(), ADDR);
    }

    #[tokio::test]
    async fn stopped_session_parses_but_does_not_publish() {
        let transport = MockTransport::new();
        let (session, bus) = harness(transport.clone());
        let mut readings = bus.subscribe(Topic::DeviceReading);

        session.open().await.unwrap();
        // Simulate a notification racing the unsubscribe: stop flag is up,
        // the transport handler is still installed.
        session.stopped.store(true, Ordering::SeqCst);
        let notify = ProtocolFamily::Bm6.characteristics().notify;
        transport.notify(ADDR, notify, &realtime_block());

        assert!(readings.try_recv().is_none());
        session.stop().await;
    }

    #[tokio::test]
    async fn request_on_closed_session_fails() {
        let transport = MockTransport::new();
        let (session, _bus) = harness(transport);
        let err = session.request(RequestKind::VoltageTemp).await.unwrap_err();
        assert!(matches!(err, SessionError::NotOpen));
    }
}
