//! btleplug-backed transport.
//!
//! One dispatcher task per connected peripheral reads the notification
//! stream and routes payloads to the handler registered for the
//! characteristic. Peripherals are cached by canonical address after
//! discovery so connect does not need a fresh scan every time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    require, require_payload, Advertisement, BleTransport, NotificationHandler, TransportError,
};
use crate::types::normalize_address;

pub struct BtleTransport {
    adapter: Adapter,
    /// Canonical address -> discovered peripheral.
    peripherals: Arc<DashMap<String, Peripheral>>,
    /// (address, characteristic) -> notification handler.
    handlers: Arc<DashMap<(String, Uuid), NotificationHandler>>,
    /// Address -> notification dispatcher task.
    dispatchers: DashMap<String, JoinHandle<()>>,
}

impl BtleTransport {
    /// Open the named adapter, or the first one when `adapter_name` is
    /// `None`.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;

        let adapter = match adapter_name {
            None => adapters
                .into_iter()
                .next()
                .ok_or_else(|| TransportError::AdapterUnavailable("no adapter found".into()))?,
            Some(name) => {
                let mut found = None;
                for candidate in adapters {
                    let info = candidate
                        .adapter_info()
                        .await
                        .unwrap_or_else(|_| String::new());
                    if info.contains(name) {
                        found = Some(candidate);
                        break;
                    }
                }
                found.ok_or_else(|| {
                    TransportError::AdapterUnavailable(format!("adapter '{name}' not found"))
                })?
            }
        };

        info!("BLE transport ready");
        Ok(Self {
            adapter,
            peripherals: Arc::new(DashMap::new()),
            handlers: Arc::new(DashMap::new()),
            dispatchers: DashMap::new(),
        })
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral, TransportError> {
        if let Some(found) = self.peripherals.get(address) {
            return Ok(found.clone());
        }
        // Fall back to whatever the adapter already knows about.
        let known = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        for peripheral in known {
            let peripheral_address = peripheral.address().to_string().to_ascii_uppercase();
            if peripheral_address == address {
                self.peripherals
                    .insert(address.to_string(), peripheral.clone());
                return Ok(peripheral);
            }
        }
        Err(TransportError::UnknownPeripheral(address.to_string()))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        characteristic: Uuid,
    ) -> Result<btleplug::api::Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or(TransportError::CharacteristicNotFound(characteristic))
    }

    /// Start the per-peripheral notification pump if it is not running.
    async fn ensure_dispatcher(
        &self,
        address: &str,
        peripheral: &Peripheral,
    ) -> Result<(), TransportError> {
        if let Some(existing) = self.dispatchers.get(address) {
            if !existing.is_finished() {
                return Ok(());
            }
        }

        let mut stream = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let handlers = self.handlers.clone();
        let owner = address.to_string();
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let key = (owner.clone(), notification.uuid);
                if let Some(handler) = handlers.get(&key) {
                    handler(&notification.value);
                } else {
                    trace!(
                        "notification on {} {} with no handler",
                        owner,
                        notification.uuid
                    );
                }
            }
            debug!("notification stream for {} ended", owner);
        });
        self.dispatchers.insert(address.to_string(), task);
        Ok(())
    }
}

#[async_trait]
impl BleTransport for BtleTransport {
    async fn connect(&self, address: &str, timeout: Duration) -> Result<(), TransportError> {
        require(address, "address")?;
        let peripheral = self.peripheral(address).await?;

        if peripheral
            .is_connected()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
        {
            return Ok(());
        }

        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| TransportError::Io(e.to_string()))?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        debug!("connected to {}", address);
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), TransportError> {
        require(address, "address")?;
        if let Some((_, task)) = self.dispatchers.remove(address) {
            task.abort();
        }
        self.handlers.retain(|(addr, _), _| addr != address);

        let Ok(peripheral) = self.peripheral(address).await else {
            return Ok(());
        };
        match peripheral.disconnect().await {
            Ok(()) => {
                debug!("disconnected from {}", address);
                Ok(())
            }
            Err(e) => {
                // Disconnect of a dead link is not an error worth surfacing.
                warn!("disconnect from {} reported: {}", address, e);
                Ok(())
            }
        }
    }

    async fn is_connected(&self, address: &str) -> bool {
        let Ok(peripheral) = self.peripheral(address).await else {
            return false;
        };
        peripheral.is_connected().await.unwrap_or(false)
    }

    async fn write(
        &self,
        address: &str,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        require(address, "address")?;
        require_payload(payload)?;
        let peripheral = self.peripheral(address).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&target, payload, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn subscribe(
        &self,
        address: &str,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        require(address, "address")?;
        let peripheral = self.peripheral(address).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;

        self.handlers
            .insert((address.to_string(), characteristic), handler);
        self.ensure_dispatcher(address, &peripheral).await?;

        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn unsubscribe(
        &self,
        address: &str,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        require(address, "address")?;
        self.handlers.remove(&(address.to_string(), characteristic));

        let Ok(peripheral) = self.peripheral(address).await else {
            return Ok(());
        };
        let Ok(target) = Self::find_characteristic(&peripheral, characteristic) else {
            return Ok(());
        };
        match peripheral.unsubscribe(&target).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("unsubscribe {} {} reported: {}", address, characteristic, e);
                Ok(())
            }
        }
    }

    async fn scan(
        &self,
        duration: Duration,
    ) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let (tx, rx) = mpsc::channel(32);

        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| {
                debug!("start_scan failed: {}", e);
                TransportError::AdapterBusy
            })?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + duration;
            loop {
                let event = tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    event = events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                let raw_address = peripheral.address().to_string();
                let Ok(address) = normalize_address(&raw_address) else {
                    trace!("skipping peripheral with unusable address {}", raw_address);
                    continue;
                };
                peripherals.insert(address.clone(), peripheral);
                let advertisement = Advertisement {
                    address,
                    local_name: properties.local_name.clone(),
                    manufacturer_data: properties
                        .manufacturer_data
                        .iter()
                        .map(|(k, v)| (*k, v.clone()))
                        .collect::<BTreeMap<u16, Vec<u8>>>(),
                };
                if tx.send(advertisement).await.is_err() {
                    break;
                }
            }
            if let Err(e) = adapter.stop_scan().await {
                warn!("stop_scan reported: {}", e);
            }
        });

        Ok(rx)
    }
}
