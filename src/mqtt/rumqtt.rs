//! rumqttc-backed connector.
//!
//! Each connect builds a fresh `AsyncClient`/`EventLoop` pair, waits for the
//! broker's ConnAck, then hands the event loop to an owned poll task. The
//! resilience layer above decides retry policy; automatic reconnection
//! inside rumqttc is effectively disabled by tearing the pair down whenever
//! the poll task sees an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{MqttConnection, MqttConnector, MqttError, QosLevel};
use crate::config::MqttSettings;

fn to_qos(level: QosLevel) -> QoS {
    match level {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub struct RumqttConnector;

#[async_trait]
impl MqttConnector for RumqttConnector {
    async fn connect(&self, settings: &MqttSettings) -> Result<Box<dyn MqttConnection>, MqttError> {
        let client_id = format!("batwatch-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, &settings.broker, settings.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = &settings.username {
            options.set_credentials(username, settings.password.as_deref().unwrap_or(""));
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        // Drive the event loop until the broker acknowledges the session.
        let deadline = tokio::time::Instant::now() + settings.connection_timeout();
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(MqttError::Timeout)?;
            match tokio::time::timeout(remaining, event_loop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => break,
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(MqttError::Connect(e.to_string())),
                Err(_) => return Err(MqttError::Timeout),
            }
        }

        let alive = Arc::new(AtomicBool::new(true));
        let poll_alive = alive.clone();
        let poll_task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => {
                        if let Event::Incoming(Packet::Disconnect) = event {
                            debug!("broker sent disconnect");
                            poll_alive.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("MQTT event loop error: {}", e);
                        poll_alive.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });

        Ok(Box::new(RumqttConnection {
            client,
            alive,
            poll_task,
        }))
    }
}

struct RumqttConnection {
    client: AsyncClient,
    alive: Arc<AtomicBool>,
    poll_task: JoinHandle<()>,
}

#[async_trait]
impl MqttConnection for RumqttConnection {
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), MqttError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionLost);
        }
        self.client
            .publish(topic, to_qos(qos), retain, payload)
            .await
            .map_err(|e| MqttError::Publish(e.to_string()))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        let _ = self.client.disconnect().await;
        self.poll_task.abort();
        self.alive.store(false, Ordering::SeqCst);
    }
}
