//! In-memory transport double.
//!
//! Emulates connect/disconnect, GATT writes, and synthetic notifications so
//! the pool, sessions, scheduler, and engine run without an adapter. Test
//! scripts can add connect latency, fail a number of connect attempts, delay
//! writes, and auto-respond to written commands.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use super::{
    require, require_payload, Advertisement, BleTransport, NotificationHandler, TransportError,
};

/// Responds to a written payload with an optional notification payload.
pub type WriteResponder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct MockInner {
    connected: DashMap<String, ()>,
    subscriptions: DashMap<(String, Uuid), NotificationHandler>,
    responders: DashMap<String, WriteResponder>,
    fail_connects: DashMap<String, u32>,
    connect_attempts: DashMap<String, u64>,
    writes: Mutex<Vec<(String, Uuid, Vec<u8>)>>,
    advertisements: Mutex<Vec<Advertisement>>,
    connect_latency: Mutex<Duration>,
    write_latency: Mutex<Duration>,
    total_connects: AtomicU64,
}

/// Scriptable transport double. Clones share state.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every connect.
    pub fn set_connect_latency(&self, latency: Duration) {
        *self.inner.connect_latency.lock().unwrap() = latency;
    }

    /// Delay applied to every write.
    pub fn set_write_latency(&self, latency: Duration) {
        *self.inner.write_latency.lock().unwrap() = latency;
    }

    /// Make the next `count` connects to `address` fail with an I/O error.
    pub fn fail_next_connects(&self, address: &str, count: u32) {
        self.inner.fail_connects.insert(address.to_string(), count);
    }

    /// Register a responder invoked on every write to `address`. When it
    /// returns bytes, they are delivered to the handler subscribed on
    /// `notify_characteristic` shortly after the write completes.
    pub fn respond_to_writes(
        &self,
        address: &str,
        notify_characteristic: Uuid,
        responder: WriteResponder,
    ) {
        let inner = self.inner.clone();
        let owner = address.to_string();
        let wrapped: WriteResponder = Arc::new(move |payload| {
            let response = responder(payload)?;
            let key = (owner.clone(), notify_characteristic);
            if let Some(handler) = inner.subscriptions.get(&key) {
                handler(&response);
            }
            None
        });
        self.inner
            .responders
            .insert(address.to_string(), wrapped);
    }

    /// Inject a synthetic notification.
    pub fn notify(&self, address: &str, characteristic: Uuid, payload: &[u8]) {
        let key = (address.to_string(), characteristic);
        if let Some(handler) = self.inner.subscriptions.get(&key) {
            handler(payload);
        } else {
            trace!("mock notify with no subscriber on {address} {characteristic}");
        }
    }

    /// Make `scan` yield this advertisement.
    pub fn advertise(
        &self,
        address: &str,
        local_name: Option<&str>,
        manufacturer_data: BTreeMap<u16, Vec<u8>>,
    ) {
        self.inner.advertisements.lock().unwrap().push(Advertisement {
            address: address.to_string(),
            local_name: local_name.map(str::to_string),
            manufacturer_data,
        });
    }

    /// Sever the link without going through `disconnect`, as a peripheral
    /// walking out of range would.
    pub fn drop_link(&self, address: &str) {
        self.inner.connected.remove(address);
    }

    /// How many transport-level connects ran for `address`.
    pub fn connect_count(&self, address: &str) -> u64 {
        self.inner
            .connect_attempts
            .get(address)
            .map(|c| *c.value())
            .unwrap_or(0)
    }

    pub fn total_connects(&self) -> u64 {
        self.inner.total_connects.load(Ordering::Relaxed)
    }

    /// Every write observed, in order.
    pub fn writes(&self) -> Vec<(String, Uuid, Vec<u8>)> {
        self.inner.writes.lock().unwrap().clone()
    }

    pub fn has_subscription(&self, address: &str, characteristic: Uuid) -> bool {
        self.inner
            .subscriptions
            .contains_key(&(address.to_string(), characteristic))
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn connect(&self, address: &str, _timeout: Duration) -> Result<(), TransportError> {
        require(address, "address")?;
        *self
            .inner
            .connect_attempts
            .entry(address.to_string())
            .or_insert(0) += 1;
        self.inner.total_connects.fetch_add(1, Ordering::Relaxed);

        let latency = *self.inner.connect_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(mut remaining) = self.inner.fail_connects.get_mut(address) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Io("scripted connect failure".into()));
            }
        }

        self.inner.connected.insert(address.to_string(), ());
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), TransportError> {
        require(address, "address")?;
        self.inner.connected.remove(address);
        self.inner
            .subscriptions
            .retain(|(addr, _), _| addr != address);
        Ok(())
    }

    async fn is_connected(&self, address: &str) -> bool {
        self.inner.connected.contains_key(address)
    }

    async fn write(
        &self,
        address: &str,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        require(address, "address")?;
        require_payload(payload)?;
        if !self.inner.connected.contains_key(address) {
            return Err(TransportError::NotConnected(address.to_string()));
        }

        let latency = *self.inner.write_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.inner
            .writes
            .lock()
            .unwrap()
            .push((address.to_string(), characteristic, payload.to_vec()));

        if let Some(responder) = self
            .inner
            .responders
            .get(address)
            .map(|r| r.value().clone())
        {
            let payload = payload.to_vec();
            // Deliver the response after the write returns, as hardware does.
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                responder(&payload);
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        address: &str,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        require(address, "address")?;
        if !self.inner.connected.contains_key(address) {
            return Err(TransportError::NotConnected(address.to_string()));
        }
        self.inner
            .subscriptions
            .insert((address.to_string(), characteristic), handler);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        address: &str,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        require(address, "address")?;
        self.inner
            .subscriptions
            .remove(&(address.to_string(), characteristic));
        Ok(())
    }

    async fn scan(
        &self,
        duration: Duration,
    ) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let (tx, rx) = mpsc::channel(32);
        let advertisements = self.inner.advertisements.lock().unwrap().clone();
        tokio::spawn(async move {
            // Scans take a fraction of the requested window in tests.
            tokio::time::sleep(duration.min(Duration::from_millis(20))).await;
            for advertisement in advertisements {
                if tx.send(advertisement).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
