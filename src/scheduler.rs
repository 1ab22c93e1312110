//! Poll scheduler.
//!
//! One periodic driver per configured device, all competing for an
//! admission semaphore sized by the connection cap. A driver that cannot win
//! admission within its own period skips the cycle instead of queueing it.
//! Discovery takes the exclusive side of the gate, which drains outstanding
//! polls and holds new admissions for the scan window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::device::session::DeviceSession;
use crate::events::Event;

/// Consecutive skips on one device before a WARN is raised.
const SKIP_WARN_THRESHOLD: u32 = 3;

/// Fraction of the period used as one-time registration jitter.
const CADENCE_JITTER: f64 = 0.10;

struct Driver {
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerStats {
    polls_completed: AtomicU64,
    polls_skipped: AtomicU64,
    polls_cancelled: AtomicU64,
}

/// Per-fleet scheduler. Clones share state.
#[derive(Clone)]
pub struct PollScheduler {
    admission: Arc<Semaphore>,
    gate: Arc<RwLock<()>>,
    bus: EventBus,
    drivers: Arc<Mutex<HashMap<String, Driver>>>,
    stats: Arc<SchedulerStats>,
}

#[derive(Debug, Clone)]
pub struct PollStats {
    pub drivers: usize,
    pub completed: u64,
    pub skipped: u64,
    pub cancelled: u64,
}

impl PollScheduler {
    /// `cap` is the global connection cap; admission never exceeds it.
    pub fn new(cap: usize, bus: EventBus) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(cap.max(1))),
            gate: Arc::new(RwLock::new(())),
            bus,
            drivers: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    /// Start a periodic driver for a device. Replaces an existing driver for
    /// the same address. The configured period gets up to +10% jitter, fixed
    /// at registration, so same-cadence fleets do not convoy.
    pub fn register(
        &self,
        session: Arc<DeviceSession>,
        period: Duration,
        parent: &CancellationToken,
    ) {
        let address = session.address().to_string();
        let token = parent.child_token();

        let jitter = rand::thread_rng().gen_range(0.0..=CADENCE_JITTER);
        let period = period.mul_f64(1.0 + jitter);

        let scheduler = self.clone();
        let driver_token = token.clone();
        let task = tokio::spawn(async move {
            scheduler.drive(session, period, driver_token).await;
        });

        let mut drivers = self.drivers.lock().unwrap();
        if let Some(previous) = drivers.insert(address.clone(), Driver { token, task }) {
            previous.token.cancel();
            previous.task.abort();
        }
        info!("polling {} every {:?}", address, period);
    }

    /// Cancel the driver for one device. Pending polls are dropped; an
    /// in-flight poll runs to its command timeout and is reported as
    /// cancelled.
    pub fn deregister(&self, address: &str) {
        if let Some(driver) = self.drivers.lock().unwrap().remove(address) {
            driver.token.cancel();
            debug!("deregistered poll driver for {}", address);
        }
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.drivers.lock().unwrap().contains_key(address)
    }

    /// Cancel every driver.
    pub fn shutdown(&self) {
        let mut drivers = self.drivers.lock().unwrap();
        for (_, driver) in drivers.drain() {
            driver.token.cancel();
        }
    }

    /// Exclusive adapter access for discovery: waits for in-flight polls to
    /// drain and holds new admissions until the guard is dropped.
    pub async fn quiesce(&self) -> OwnedRwLockWriteGuard<()> {
        self.gate.clone().write_owned().await
    }

    pub fn stats(&self) -> PollStats {
        PollStats {
            drivers: self.drivers.lock().unwrap().len(),
            completed: self.stats.polls_completed.load(Ordering::Relaxed),
            skipped: self.stats.polls_skipped.load(Ordering::Relaxed),
            cancelled: self.stats.polls_cancelled.load(Ordering::Relaxed),
        }
    }

    async fn drive(
        &self,
        session: Arc<DeviceSession>,
        period: Duration,
        token: CancellationToken,
    ) {
        let address = session.address().to_string();
        let mut first = true;
        let mut consecutive_skips: u32 = 0;

        loop {
            if first {
                // Immediate baseline poll on registration.
                first = false;
            } else {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }

            // Discovery holds the write side; wait our turn or bail out.
            let _gate = tokio::select! {
                _ = token.cancelled() => break,
                gate = self.gate.clone().read_owned() => gate,
            };

            // Admission against the cap, bounded by our own period: a cycle
            // that cannot start in time is skipped, not queued.
            let admission = self.admission.clone();
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                acquired = tokio::time::timeout(period, admission.acquire_owned()) => {
                    match acquired {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => break,
                        Err(_) => {
                            consecutive_skips += 1;
                            self.stats.polls_skipped.fetch_add(1, Ordering::Relaxed);
                            self.bus.publish(Event::PollSkipped {
                                address: address.clone(),
                                timestamp: Utc::now(),
                            });
                            if consecutive_skips >= SKIP_WARN_THRESHOLD {
                                warn!(
                                    "{}: {} consecutive poll cycles skipped",
                                    address, consecutive_skips
                                );
                            }
                            continue;
                        }
                    }
                }
            };
            consecutive_skips = 0;

            // The poll itself is not aborted mid-flight; cancellation is
            // observed afterwards and the cycle reported as cancelled.
            let result = session.poll().await;
            drop(permit);

            if token.is_cancelled() {
                self.stats.polls_cancelled.fetch_add(1, Ordering::Relaxed);
                self.bus.publish(Event::PollCancelled {
                    address: address.clone(),
                    timestamp: Utc::now(),
                });
                break;
            }

            match result {
                Ok(reading) => {
                    self.stats.polls_completed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "{}: {:.2}V, {:.1}A, {:.1}C, {:.1}% SoC",
                        address,
                        reading.voltage,
                        reading.current,
                        reading.temperature,
                        reading.state_of_charge
                    );
                }
                Err(e) => {
                    warn!("{}: poll failed: {}", address, e);
                }
            }
        }

        debug!("poll driver for {} stopped", address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::pool::{ConnectionPool, PoolConfig};
    use crate::engine::state::RuntimeRegistry;
    use crate::events::Topic;
    use crate::protocol::{crypto, ProtocolFamily};
    use crate::transport::mock::MockTransport;
    use crate::device::session::SessionConfig;

    fn realtime_block() -> Vec<u8> {
        let mut block = [0u8; 16];
        block[..9].copy_from_slice(&hex::decode("d1550700fb005504ec").unwrap());
        crypto::encrypt(&block).unwrap()
    }

    fn session_for(
        address: &str,
        transport: &MockTransport,
        pool: &ConnectionPool,
        bus: &EventBus,
    ) -> Arc<DeviceSession> {
        let notify = ProtocolFamily::Bm6.characteristics().notify;
        transport.respond_to_writes(address, notify, Arc::new(|_| Some(realtime_block())));
        Arc::new(DeviceSession::new(
            address.to_string(),
            ProtocolFamily::Bm6,
            pool.clone(),
            bus.clone(),
            RuntimeRegistry::new(),
            SessionConfig {
                command_timeout: Duration::from_millis(300),
                ..SessionConfig::default()
            },
            None,
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_devices_share_cap_one_without_starvation() {
        let transport = MockTransport::new();
        transport.set_write_latency(Duration::from_millis(30));
        let bus = EventBus::default();
        let pool = ConnectionPool::new(
            Arc::new(transport.clone()),
            PoolConfig {
                max_connections: 1,
                connect_timeout: Duration::from_millis(500),
                ..PoolConfig::default()
            },
            bus.clone(),
        );
        let scheduler = PollScheduler::new(1, bus.clone());
        let root = CancellationToken::new();

        let a = session_for("AA:BB:CC:DD:EE:01", &transport, &pool, &bus);
        let b = session_for("AA:BB:CC:DD:EE:02", &transport, &pool, &bus);
        scheduler.register(a, Duration::from_millis(100), &root);
        scheduler.register(b, Duration::from_millis(100), &root);

        tokio::time::sleep(Duration::from_millis(900)).await;
        root.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Both devices made progress under cap 1.
        assert!(transport.connect_count("AA:BB:CC:DD:EE:01") >= 3);
        assert!(transport.connect_count("AA:BB:CC:DD:EE:02") >= 3);
    }

    #[tokio::test]
    async fn deregister_stops_polling() {
        let transport = MockTransport::new();
        let bus = EventBus::default();
        let pool = ConnectionPool::new(
            Arc::new(transport.clone()),
            PoolConfig::default(),
            bus.clone(),
        );
        let scheduler = PollScheduler::new(1, bus.clone());
        let root = CancellationToken::new();

        let session = session_for("AA:BB:CC:DD:EE:03", &transport, &pool, &bus);
        scheduler.register(session, Duration::from_millis(50), &root);
        tokio::time::sleep(Duration::from_millis(120)).await;

        scheduler.deregister("AA:BB:CC:DD:EE:03");
        tokio::time::sleep(Duration::from_millis(60)).await;
        let count = transport.connect_count("AA:BB:CC:DD:EE:03");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.connect_count("AA:BB:CC:DD:EE:03"), count);
        assert!(!scheduler.is_registered("AA:BB:CC:DD:EE:03"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn quiesce_blocks_new_polls() {
        let transport = MockTransport::new();
        let bus = EventBus::default();
        let pool = ConnectionPool::new(
            Arc::new(transport.clone()),
            PoolConfig::default(),
            bus.clone(),
        );
        let scheduler = PollScheduler::new(1, bus.clone());
        let root = CancellationToken::new();

        let session = session_for("AA:BB:CC:DD:EE:04", &transport, &pool, &bus);
        scheduler.register(session, Duration::from_millis(40), &root);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let gate = scheduler.quiesce().await;
        let before = transport.connect_count("AA:BB:CC:DD:EE:04");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.connect_count("AA:BB:CC:DD:EE:04"), before);
        drop(gate);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(transport.connect_count("AA:BB:CC:DD:EE:04") > before);
        root.cancel();
    }

    #[tokio::test]
    async fn skipped_cycles_are_published() {
        let bus = EventBus::default();
        let mut skips = bus.subscribe(Topic::Poll);
        // Zero-permit scheduler cannot admit anything.
        let scheduler = PollScheduler::new(1, bus.clone());
        // Occupy the only admission slot forever.
        let hold = scheduler.admission.clone().acquire_owned().await.unwrap();

        let transport = MockTransport::new();
        let pool = ConnectionPool::new(
            Arc::new(transport.clone()),
            PoolConfig::default(),
            bus.clone(),
        );
        let root = CancellationToken::new();
        let session = session_for("AA:BB:CC:DD:EE:05", &transport, &pool, &bus);
        scheduler.register(session, Duration::from_millis(30), &root);

        let event = tokio::time::timeout(Duration::from_secs(1), skips.recv())
            .await
            .expect("expected a poll event")
            .unwrap();
        assert!(matches!(event, Event::PollSkipped { .. }));
        assert!(scheduler.stats().skipped >= 1);

        root.cancel();
        drop(hold);
    }
}
