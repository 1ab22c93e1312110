//! Capped BLE connection pool.
//!
//! Owns every live link. One lock guards the active-handle map, the pending
//! set, and the state-machine histories; it is never held across an await.
//! The concurrency cap is a FIFO semaphore whose wait queue is itself
//! bounded: beyond the bound, the newest request is rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{LinkState, StateMachine};
use crate::bus::EventBus;
use crate::events::Event;
use crate::transport::{BleTransport, NotificationHandler, TransportError};

/// Transition reason used when the sweeper finds a dead link. The
/// orchestrator keys reconnection off it.
pub const REASON_LINK_LOST: &str = "link lost";

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// The admission queue is at its bound; the newest request is refused.
    #[error("connection capacity exceeded ({queued} requests already waiting)")]
    CapacityExceeded { queued: usize },

    /// Programming error: an illegal state-machine edge was requested.
    #[error("invalid state transition for {address}: {from} -> {to}")]
    InvalidStateTransition {
        address: String,
        from: LinkState,
        to: LinkState,
    },

    #[error("no connected handle for {0}")]
    NotConnected(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("pool is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Cap on simultaneously open links.
    pub max_connections: usize,
    /// Bound on callers parked waiting for a slot.
    pub max_queue: usize,
    pub connect_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            max_queue: 64,
            connect_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Lightweight view of a pooled link. All callers racing on the same address
/// receive a handle with the same `connected_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionHandle {
    pub address: String,
    pub connected_at: DateTime<Utc>,
}

struct HandleEntry {
    connected_at: DateTime<Utc>,
    subscriptions: HashMap<Uuid, NotificationHandler>,
    /// Slot under the cap; freed when the entry is dropped.
    _permit: OwnedSemaphorePermit,
}

type ConnectWaiter = oneshot::Sender<Result<ConnectionHandle, PoolError>>;

#[derive(Default)]
struct PoolInner {
    active: HashMap<String, HandleEntry>,
    /// Addresses with a connect attempt in flight, with parked callers.
    pending: HashMap<String, Vec<ConnectWaiter>>,
    /// Subscription tables of links that dropped outside an operator
    /// disconnect, kept for the reconnection controller to re-install.
    orphaned: HashMap<String, HashMap<Uuid, NotificationHandler>>,
    machine: StateMachine,
    total_connects: u64,
    total_disconnects: u64,
}

struct PoolShared {
    transport: Arc<dyn BleTransport>,
    config: PoolConfig,
    state: Mutex<PoolInner>,
    slots: Arc<Semaphore>,
    queued: AtomicUsize,
    bus: EventBus,
}

/// The pool. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub active: usize,
    pub connected: usize,
    pub pending: usize,
    pub queued: usize,
    pub capacity: usize,
    pub total_connects: u64,
    pub total_disconnects: u64,
}

#[derive(Debug, Clone)]
pub struct LinkHealth {
    pub state: LinkState,
    pub history: Vec<(LinkState, DateTime<Utc>)>,
    pub subscriptions: Vec<Uuid>,
    pub connected_at: Option<DateTime<Utc>>,
}

enum Plan {
    Existing(ConnectionHandle),
    Wait(oneshot::Receiver<Result<ConnectionHandle, PoolError>>),
    Lead,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn BleTransport>, config: PoolConfig, bus: EventBus) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            shared: Arc::new(PoolShared {
                transport,
                config,
                state: Mutex::new(PoolInner::default()),
                slots,
                queued: AtomicUsize::new(0),
                bus,
            }),
        }
    }

    pub fn transport(&self) -> Arc<dyn BleTransport> {
        self.shared.transport.clone()
    }

    /// Return the existing handle for `address` or create one.
    ///
    /// Concurrent callers for the same address are deduplicated: the first
    /// performs the transport connect, the rest are parked and observe the
    /// same outcome.
    pub async fn get_or_connect(&self, address: &str) -> Result<ConnectionHandle, PoolError> {
        if address.trim().is_empty() {
            return Err(TransportError::InvalidArgument("address is empty".into()).into());
        }

        let plan = {
            let mut inner = self.shared.state.lock().unwrap();
            if let Some(entry) = inner.active.get(address) {
                Plan::Existing(ConnectionHandle {
                    address: address.to_string(),
                    connected_at: entry.connected_at,
                })
            } else if let Some(waiters) = inner.pending.get_mut(address) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Plan::Wait(rx)
            } else {
                inner.pending.insert(address.to_string(), Vec::new());
                Plan::Lead
            }
        };

        match plan {
            Plan::Existing(handle) => Ok(handle),
            Plan::Wait(rx) => rx.await.map_err(|_| PoolError::ShuttingDown)?,
            Plan::Lead => {
                let result = self.lead_connect(address).await;
                let waiters = {
                    let mut inner = self.shared.state.lock().unwrap();
                    inner.pending.remove(address).unwrap_or_default()
                };
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
                result
            }
        }
    }

    async fn lead_connect(&self, address: &str) -> Result<ConnectionHandle, PoolError> {
        let permit = self.acquire_slot().await?;
        self.apply_transition(address, LinkState::Connecting, "connect requested")?;

        match self
            .shared
            .transport
            .connect(address, self.shared.config.connect_timeout)
            .await
        {
            Ok(()) => {
                let connected_at = Utc::now();
                {
                    let mut inner = self.shared.state.lock().unwrap();
                    inner.active.insert(
                        address.to_string(),
                        HandleEntry {
                            connected_at,
                            subscriptions: HashMap::new(),
                            _permit: permit,
                        },
                    );
                    inner.total_connects += 1;
                }
                self.apply_transition(address, LinkState::Connected, "transport connected")?;
                info!("connected to {}", address);
                Ok(ConnectionHandle {
                    address: address.to_string(),
                    connected_at,
                })
            }
            Err(e) => {
                warn!("connect to {} failed: {}", address, e);
                self.apply_transition(address, LinkState::Error, "connect failed")?;
                Err(e.into())
            }
        }
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        match self.shared.slots.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::Closed) => Err(PoolError::ShuttingDown),
            Err(TryAcquireError::NoPermits) => {
                let waiting = self.shared.queued.fetch_add(1, Ordering::SeqCst);
                if waiting >= self.shared.config.max_queue {
                    self.shared.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(PoolError::CapacityExceeded { queued: waiting });
                }
                let result = self.shared.slots.clone().acquire_owned().await;
                self.shared.queued.fetch_sub(1, Ordering::SeqCst);
                result.map_err(|_| PoolError::ShuttingDown)
            }
        }
    }

    /// GATT write through a connected handle.
    pub async fn write_char(
        &self,
        address: &str,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), PoolError> {
        self.require_connected(address)?;
        self.shared
            .transport
            .write(address, characteristic, payload)
            .await
            .map_err(Into::into)
    }

    /// Subscribe to notifications and record the subscription on the handle
    /// so it can be re-installed after a reconnect.
    pub async fn start_notify(
        &self,
        address: &str,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), PoolError> {
        self.require_connected(address)?;
        self.shared
            .transport
            .subscribe(address, characteristic, handler.clone())
            .await?;
        let mut inner = self.shared.state.lock().unwrap();
        if let Some(entry) = inner.active.get_mut(address) {
            entry.subscriptions.insert(characteristic, handler);
        }
        Ok(())
    }

    /// Remove a notification subscription. Idempotent.
    pub async fn stop_notify(
        &self,
        address: &str,
        characteristic: Uuid,
    ) -> Result<(), PoolError> {
        {
            let mut inner = self.shared.state.lock().unwrap();
            if let Some(entry) = inner.active.get_mut(address) {
                entry.subscriptions.remove(&characteristic);
            }
        }
        self.shared
            .transport
            .unsubscribe(address, characteristic)
            .await
            .map_err(Into::into)
    }

    /// Operator-initiated disconnect: cancel notifications, then drop the
    /// link. Idempotent; also resets a terminal `ERROR` state.
    pub async fn disconnect(&self, address: &str) -> Result<(), PoolError> {
        let subscriptions: Vec<Uuid> = {
            let mut inner = self.shared.state.lock().unwrap();
            inner.orphaned.remove(address);
            match inner.active.get(address) {
                Some(entry) => entry.subscriptions.keys().cloned().collect(),
                None => {
                    let current = inner.machine.current(address);
                    drop(inner);
                    if current == LinkState::Reconnecting {
                        // Operator pre-empts a reconnection episode.
                        self.apply_transition(address, LinkState::Error, "operator disconnect")?;
                    }
                    if matches!(current, LinkState::Error | LinkState::Reconnecting) {
                        self.apply_transition(address, LinkState::Disconnected, "operator reset")?;
                    }
                    return Ok(());
                }
            }
        };

        self.apply_transition(address, LinkState::Disconnecting, "operator disconnect")?;
        for characteristic in subscriptions {
            let _ = self
                .shared
                .transport
                .unsubscribe(address, characteristic)
                .await;
        }
        let _ = self.shared.transport.disconnect(address).await;
        {
            let mut inner = self.shared.state.lock().unwrap();
            if inner.active.remove(address).is_some() {
                inner.total_disconnects += 1;
            }
        }
        self.apply_transition(address, LinkState::Disconnected, "operator disconnect")?;
        Ok(())
    }

    /// Drop every device the transport no longer reports connected. Their
    /// subscription tables are parked for the reconnection controller, and
    /// the device moves to `RECONNECTING` so the controller can take over.
    pub async fn sweep_once(&self) {
        let addresses: Vec<String> = {
            let inner = self.shared.state.lock().unwrap();
            inner.active.keys().cloned().collect()
        };

        for address in addresses {
            if self.shared.transport.is_connected(&address).await {
                continue;
            }
            warn!("{}: transport reports link down", address);
            {
                let mut inner = self.shared.state.lock().unwrap();
                if let Some(entry) = inner.active.remove(&address) {
                    inner.orphaned.insert(address.clone(), entry.subscriptions);
                    inner.total_disconnects += 1;
                }
            }
            let _ = self.apply_transition(&address, LinkState::Reconnecting, REASON_LINK_LOST);
        }
    }

    /// Periodic stale-link sweeping until cancelled.
    pub fn spawn_sweeper(&self, token: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.shared.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => pool.sweep_once().await,
                }
            }
            debug!("pool sweeper stopped");
        })
    }

    /// Subscriptions that were live when a link dropped unexpectedly.
    pub fn take_orphaned_subscriptions(
        &self,
        address: &str,
    ) -> HashMap<Uuid, NotificationHandler> {
        let mut inner = self.shared.state.lock().unwrap();
        inner.orphaned.remove(address).unwrap_or_default()
    }

    /// Mark a device terminally errored (reconnection budget exhausted).
    pub fn mark_error(&self, address: &str, reason: &str) {
        let _ = self.apply_transition(address, LinkState::Error, reason);
    }

    /// Record the start of a reconnection episode.
    pub fn mark_reconnecting(&self, address: &str, reason: &str) {
        let _ = self.apply_transition(address, LinkState::Reconnecting, reason);
    }

    pub fn is_active(&self, address: &str) -> bool {
        self.shared.state.lock().unwrap().active.contains_key(address)
    }

    pub fn state(&self, address: &str) -> LinkState {
        self.shared.state.lock().unwrap().machine.current(address)
    }

    pub fn history(&self, address: &str) -> Vec<(LinkState, DateTime<Utc>)> {
        self.shared.state.lock().unwrap().machine.history(address)
    }

    /// Forget a removed device entirely.
    pub fn forget(&self, address: &str) {
        let mut inner = self.shared.state.lock().unwrap();
        inner.active.remove(address);
        inner.orphaned.remove(address);
        inner.machine.remove(address);
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.state.lock().unwrap();
        PoolStats {
            active: inner.active.len(),
            connected: inner.machine.connected(),
            pending: inner.pending.len(),
            queued: self.shared.queued.load(Ordering::SeqCst),
            capacity: self.shared.config.max_connections,
            total_connects: inner.total_connects,
            total_disconnects: inner.total_disconnects,
        }
    }

    pub fn health(&self, address: &str) -> LinkHealth {
        let inner = self.shared.state.lock().unwrap();
        LinkHealth {
            state: inner.machine.current(address),
            history: inner.machine.history(address),
            subscriptions: inner
                .active
                .get(address)
                .map(|e| e.subscriptions.keys().cloned().collect())
                .unwrap_or_default(),
            connected_at: inner.active.get(address).map(|e| e.connected_at),
        }
    }

    fn require_connected(&self, address: &str) -> Result<(), PoolError> {
        let inner = self.shared.state.lock().unwrap();
        if inner.active.contains_key(address) {
            Ok(())
        } else {
            Err(PoolError::NotConnected(address.to_string()))
        }
    }

    /// Validated state transition plus a `device.connection` event.
    fn apply_transition(
        &self,
        address: &str,
        next: LinkState,
        reason: &str,
    ) -> Result<LinkState, PoolError> {
        let old = {
            let mut inner = self.shared.state.lock().unwrap();
            inner.machine.transition(address, next, reason)?
        };
        if old != next {
            self.shared.bus.publish(Event::ConnectionChanged {
                address: address.to_string(),
                old_state: old,
                new_state: next,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(old)
    }
}
