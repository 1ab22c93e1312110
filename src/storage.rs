//! Time-series sink contract.
//!
//! The writer itself is an external collaborator; the core hands it
//! readings through [`ReadingSink::write`] and never retries; availability
//! is the writer's concern.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::Reading;

/// Outcome of one write. `Deferred` means the writer buffered it itself;
/// `Dropped` means it is gone. The core treats all three the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Ok,
    Deferred,
    Dropped,
}

#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn write(
        &self,
        address: &str,
        vehicle_id: Option<&str>,
        protocol: &str,
        reading: &Reading,
        timestamp: DateTime<Utc>,
    ) -> SinkOutcome;

    /// Whether the backing store is reachable, for health snapshots.
    fn connected(&self) -> bool {
        true
    }
}

/// Stored row kept by [`MemorySink`].
#[derive(Debug, Clone)]
pub struct StoredReading {
    pub address: String,
    pub vehicle_id: Option<String>,
    pub protocol: String,
    pub reading: Reading,
    pub timestamp: DateTime<Utc>,
}

/// In-memory sink for tests and ephemeral runs.
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<Vec<StoredReading>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<StoredReading> {
        self.rows.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl ReadingSink for MemorySink {
    async fn write(
        &self,
        address: &str,
        vehicle_id: Option<&str>,
        protocol: &str,
        reading: &Reading,
        timestamp: DateTime<Utc>,
    ) -> SinkOutcome {
        self.rows.lock().unwrap().push(StoredReading {
            address: address.to_string(),
            vehicle_id: vehicle_id.map(str::to_string),
            protocol: protocol.to_string(),
            reading: reading.clone(),
            timestamp,
        });
        SinkOutcome::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_stores_rows() {
        let sink = MemorySink::new();
        let reading = Reading::new(12.6, 0.0, 25.0, 85.0, "BM6");
        let outcome = sink
            .write("AA:BB:CC:DD:EE:01", Some("van"), "BM6", &reading, Utc::now())
            .await;
        assert_eq!(outcome, SinkOutcome::Ok);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.rows()[0].vehicle_id.as_deref(), Some("van"));
    }
}
