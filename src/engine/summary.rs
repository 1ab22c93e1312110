//! Vehicle summary computation.
//!
//! Recomputed whenever a member device produces a reading or an association
//! changes. The orchestrator compares fingerprints (the summary minus its
//! timestamp) to suppress redundant emissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::registry::DeviceRecord;
use crate::engine::state::RuntimeRegistry;

/// Health rating aggregated across a vehicle's member devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthRating {
    Good,
    Degraded,
    Bad,
    Unknown,
}

/// Voltage floor for a healthy 12 V battery.
const GOOD_VOLTAGE: f64 = 12.4;
/// Below this the battery is considered bad.
const DEGRADED_VOLTAGE: f64 = 11.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBrief {
    pub address: String,
    pub name: String,
    pub connected: bool,
    pub voltage: Option<f64>,
    pub state_of_charge: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSummary {
    pub vehicle_id: String,
    pub timestamp: DateTime<Utc>,
    pub total_devices: usize,
    pub connected_devices: usize,
    pub average_voltage: Option<f64>,
    pub total_capacity: Option<f64>,
    pub overall_health: HealthRating,
    pub devices: Vec<DeviceBrief>,
}

impl VehicleSummary {
    /// Identity of the summary content, timestamp excluded. Two summaries
    /// with equal fingerprints carry the same information.
    pub fn fingerprint(&self) -> String {
        let mut clone = self.clone();
        clone.timestamp = DateTime::<Utc>::MIN_UTC;
        serde_json::to_string(&clone).unwrap_or_default()
    }
}

/// Compute the summary for one vehicle from its member records and their
/// runtime state.
pub fn compute(
    vehicle_id: &str,
    members: &[DeviceRecord],
    runtime: &RuntimeRegistry,
) -> VehicleSummary {
    let mut connected = 0;
    let mut voltages = Vec::new();
    let mut capacity_total = 0.0f64;
    let mut capacity_seen = false;
    let mut worst = HealthRating::Unknown;
    let mut briefs = Vec::with_capacity(members.len());

    for record in members {
        let state = runtime.snapshot(&record.address);
        let status_connected = state
            .as_ref()
            .map(|s| s.status.connected)
            .unwrap_or(false);
        if status_connected {
            connected += 1;
        }

        let reading = state.as_ref().and_then(|s| s.latest_reading.clone());
        if let Some(reading) = &reading {
            voltages.push(reading.voltage);
            if let Some(capacity) = reading.capacity {
                capacity_total += capacity;
                capacity_seen = true;
            }
            let health = rate_voltage(reading.voltage);
            worst = worse_of(worst, health);
        }

        briefs.push(DeviceBrief {
            address: record.address.clone(),
            name: record.name.clone(),
            connected: status_connected,
            voltage: reading.as_ref().map(|r| r.voltage),
            state_of_charge: reading.as_ref().map(|r| r.state_of_charge),
        });
    }

    let average_voltage = if voltages.is_empty() {
        None
    } else {
        Some(voltages.iter().sum::<f64>() / voltages.len() as f64)
    };

    VehicleSummary {
        vehicle_id: vehicle_id.to_string(),
        timestamp: Utc::now(),
        total_devices: members.len(),
        connected_devices: connected,
        average_voltage,
        total_capacity: capacity_seen.then_some(capacity_total),
        overall_health: worst,
        devices: briefs,
    }
}

fn rate_voltage(voltage: f64) -> HealthRating {
    if voltage >= GOOD_VOLTAGE {
        HealthRating::Good
    } else if voltage >= DEGRADED_VOLTAGE {
        HealthRating::Degraded
    } else {
        HealthRating::Bad
    }
}

/// `Unknown` is replaced by any observed rating; otherwise the worse of the
/// two wins.
fn worse_of(a: HealthRating, b: HealthRating) -> HealthRating {
    fn severity(r: HealthRating) -> u8 {
        match r {
            HealthRating::Unknown => 0,
            HealthRating::Good => 1,
            HealthRating::Degraded => 2,
            HealthRating::Bad => 3,
        }
    }
    if severity(b) > severity(a) {
        b
    } else {
        a
    }
}
