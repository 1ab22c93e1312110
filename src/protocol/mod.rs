//! Device protocol layer.
//!
//! Two wire dialects exist in this monitor family: the encrypted fixed-block
//! protocol spoken by BM6-class devices ([`bm6`]) and the marker-framed
//! legacy protocol spoken by BM2 and generic monitors ([`bm2`]). The
//! [`ProtocolFamily`] tagged variant is the only surface the rest of the core
//! sees: request building, notification parsing, and characteristic UUIDs.

pub mod bm2;
pub mod bm6;
pub mod crypto;

use uuid::{uuid, Uuid};

use crate::types::{DeviceKind, Reading};

/// GATT service exposed by both monitor families.
pub const MONITOR_SERVICE_UUID: Uuid = uuid!("0000fff0-0000-1000-8000-00805f9b34fb");
/// Characteristic commands are written to.
pub const WRITE_CHARACTERISTIC_UUID: Uuid = uuid!("0000fff3-0000-1000-8000-00805f9b34fb");
/// Characteristic notifications arrive on.
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid = uuid!("0000fff4-0000-1000-8000-00805f9b34fb");

/// Codec error taxonomy. Parsers return these; they never escalate past the
/// session boundary unclassified.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    /// Bad length, marker, or checksum. The payload never made it to
    /// interpretation.
    #[error("framing: {reason}")]
    Framing { reason: String, raw: Vec<u8> },

    /// Decoded fine but semantically invalid (out-of-range field, NaN).
    #[error("parse: {reason}")]
    Parse { reason: String, raw: Vec<u8> },

    /// Well-formed frame with a type we do not recognize. Logged, ignored.
    #[error("unknown opcode {opcode}")]
    UnknownOpcode { opcode: String, raw: Vec<u8> },
}

impl ProtocolError {
    pub fn framing(reason: impl Into<String>, raw: &[u8]) -> Self {
        Self::Framing {
            reason: reason.into(),
            raw: raw.to_vec(),
        }
    }

    pub fn parse(reason: impl Into<String>, raw: &[u8]) -> Self {
        Self::Parse {
            reason: reason.into(),
            raw: raw.to_vec(),
        }
    }

    /// The raw bytes of the offending payload, for hex-dump diagnostics.
    pub fn raw(&self) -> &[u8] {
        match self {
            Self::Framing { raw, .. } | Self::Parse { raw, .. } | Self::UnknownOpcode { raw, .. } => raw,
        }
    }
}

/// The three requests a session can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    VoltageTemp,
    BasicInfo,
    CellVoltages,
}

impl RequestKind {
    /// Short label recorded in device runtime status.
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::VoltageTemp => "voltage_temp",
            RequestKind::BasicInfo => "basic_info",
            RequestKind::CellVoltages => "cell_voltages",
        }
    }
}

/// A successfully interpreted notification.
#[derive(Debug, Clone)]
pub enum Frame {
    Reading(Reading),
    /// Firmware/protocol version string reported by the device.
    Version(String),
    /// Per-cell voltages in volts.
    Cells(Vec<f64>),
}

/// Write/notify characteristic pair for one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristics {
    pub write: Uuid,
    pub notify: Uuid,
}

/// Tagged protocol dispatch. One value per device; no trait objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    Bm6,
    Bm2,
    Generic,
}

impl ProtocolFamily {
    pub fn for_kind(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Bm6 => ProtocolFamily::Bm6,
            DeviceKind::Bm2 => ProtocolFamily::Bm2,
            DeviceKind::Generic => ProtocolFamily::Generic,
        }
    }

    /// Protocol tag stamped on readings and reported as the protocol version.
    pub fn tag(&self) -> &'static str {
        match self {
            ProtocolFamily::Bm6 => "BM6",
            ProtocolFamily::Bm2 => "BM2",
            ProtocolFamily::Generic => "GENERIC",
        }
    }

    pub fn characteristics(&self) -> Characteristics {
        // Both dialects share the fff0 service layout.
        Characteristics {
            write: WRITE_CHARACTERISTIC_UUID,
            notify: NOTIFY_CHARACTERISTIC_UUID,
        }
    }

    /// Build the wire bytes for a request.
    pub fn build_request(&self, kind: RequestKind) -> Result<Vec<u8>, ProtocolError> {
        match self {
            ProtocolFamily::Bm6 => bm6::build_request(kind),
            ProtocolFamily::Bm2 | ProtocolFamily::Generic => bm2::build_request(kind),
        }
    }

    /// Interpret one notification payload.
    ///
    /// `Ok(None)` means the payload was valid but carries nothing to act on
    /// (e.g. a command echo). Range violations come back as
    /// [`ProtocolError::Parse`] with the raw payload attached; they must not
    /// disturb the link.
    pub fn parse_notification(&self, payload: &[u8]) -> Result<Option<Frame>, ProtocolError> {
        match self {
            ProtocolFamily::Bm6 => bm6::parse_notification(payload),
            ProtocolFamily::Bm2 | ProtocolFamily::Generic => bm2::parse_notification(payload),
        }
    }

}
