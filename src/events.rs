//! Events carried on the in-process bus.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::state::LinkState;
use crate::engine::summary::VehicleSummary;
use crate::transport::DiscoveryHints;
use crate::types::{Reading, RuntimeStatus};

/// Bus topics. Delivery is ordered per topic per subscriber; there are no
/// cross-topic guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    DeviceDiscovered,
    DeviceReading,
    DeviceStatus,
    DeviceConnection,
    VehicleAssociated,
    VehicleSummary,
    Poll,
    SystemShutdown,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::DeviceDiscovered => "device.discovered",
            Topic::DeviceReading => "device.reading",
            Topic::DeviceStatus => "device.status",
            Topic::DeviceConnection => "device.connection",
            Topic::VehicleAssociated => "vehicle.associated",
            Topic::VehicleSummary => "vehicle.summary",
            Topic::Poll => "poll",
            Topic::SystemShutdown => "system.shutdown",
        };
        write!(f, "{name}")
    }
}

/// Events that can be published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    DeviceDiscovered {
        address: String,
        hints: DiscoveryHints,
        timestamp: DateTime<Utc>,
    },

    ReadingProduced {
        address: String,
        reading: Reading,
    },

    StatusChanged {
        address: String,
        status: RuntimeStatus,
        timestamp: DateTime<Utc>,
    },

    ConnectionChanged {
        address: String,
        old_state: LinkState,
        new_state: LinkState,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    VehicleAssociated {
        vehicle_id: String,
        address: String,
        timestamp: DateTime<Utc>,
    },

    VehicleSummaryUpdated {
        vehicle_id: String,
        summary: VehicleSummary,
    },

    PollSkipped {
        address: String,
        timestamp: DateTime<Utc>,
    },

    PollCancelled {
        address: String,
        timestamp: DateTime<Utc>,
    },

    Shutdown {
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// The topic this event is delivered on.
    pub fn topic(&self) -> Topic {
        match self {
            Event::DeviceDiscovered { .. } => Topic::DeviceDiscovered,
            Event::ReadingProduced { .. } => Topic::DeviceReading,
            Event::StatusChanged { .. } => Topic::DeviceStatus,
            Event::ConnectionChanged { .. } => Topic::DeviceConnection,
            Event::VehicleAssociated { .. } => Topic::VehicleAssociated,
            Event::VehicleSummaryUpdated { .. } => Topic::VehicleSummary,
            Event::PollSkipped { .. } | Event::PollCancelled { .. } => Topic::Poll,
            Event::Shutdown { .. } => Topic::SystemShutdown,
        }
    }

    /// Device address the event concerns, when it concerns one.
    pub fn address(&self) -> Option<&str> {
        match self {
            Event::DeviceDiscovered { address, .. }
            | Event::ReadingProduced { address, .. }
            | Event::StatusChanged { address, .. }
            | Event::ConnectionChanged { address, .. }
            | Event::VehicleAssociated { address, .. }
            | Event::PollSkipped { address, .. }
            | Event::PollCancelled { address, .. } => Some(address),
            Event::VehicleSummaryUpdated { .. } | Event::Shutdown { .. } => None,
        }
    }
}
