use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use batwatch::config::CoreConfig;
use batwatch::device::registry::JsonRegistryStore;
use batwatch::engine::CoreEngine;
use batwatch::mqtt::rumqtt::RumqttConnector;
use batwatch::storage::MemorySink;
use batwatch::transport::btle::BtleTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CoreConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_target(false)
        .init();

    info!("batwatch {}", env!("CARGO_PKG_VERSION"));

    let transport = BtleTransport::new(config.bluetooth.adapter.as_deref())
        .await
        .context("opening BLE adapter")?;

    let data_dir = std::env::var("BATWATCH_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let store = Arc::new(JsonRegistryStore::new(&data_dir));

    let engine = CoreEngine::new(config, Arc::new(transport), store)
        .with_sink(Arc::new(MemorySink::new()))
        .with_mqtt_connector(Arc::new(RumqttConnector));

    engine.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    engine.shutdown().await;
    Ok(())
}
