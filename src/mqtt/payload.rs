//! JSON payload builders for the MQTT wire schema.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::engine::summary::VehicleSummary;
use crate::types::{Reading, RuntimeStatus};

fn iso_millis(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn reading(
    address: &str,
    reading: &Reading,
    vehicle_id: Option<&str>,
    device_type: Option<&str>,
) -> Value {
    let mut payload = json!({
        "device_id": address,
        "timestamp": iso_millis(reading.timestamp),
        "voltage": reading.voltage,
        "current": reading.current,
        "temperature": reading.temperature,
        "state_of_charge": reading.state_of_charge,
        "power": reading.power(),
    });
    let object = payload.as_object_mut().unwrap();
    if let Some(capacity) = reading.capacity {
        object.insert("capacity".into(), json!(capacity));
    }
    if let Some(cycles) = reading.cycles {
        object.insert("cycles".into(), json!(cycles));
    }
    if let Some(vehicle_id) = vehicle_id {
        object.insert("vehicle_id".into(), json!(vehicle_id));
    }
    if let Some(device_type) = device_type {
        object.insert("device_type".into(), json!(device_type));
    }
    if !reading.extra.is_empty() {
        object.insert("extra".into(), json!(reading.extra));
    }
    payload
}

pub fn status(address: &str, status: &RuntimeStatus, timestamp: DateTime<Utc>) -> Value {
    let mut payload = json!({
        "device_id": address,
        "timestamp": iso_millis(timestamp),
        "connected": status.connected,
    });
    let object = payload.as_object_mut().unwrap();
    if let Some(version) = &status.protocol_version {
        object.insert("protocol_version".into(), json!(version));
    }
    if let Some(command) = &status.last_command {
        object.insert("last_command".into(), json!(command));
    }
    if let Some(code) = status.error_code {
        object.insert("error_code".into(), json!(code));
    }
    if let Some(message) = &status.error_message {
        object.insert("error_message".into(), json!(message));
    }
    payload
}

pub fn vehicle_summary(summary: &VehicleSummary) -> Value {
    json!({
        "vehicle_id": summary.vehicle_id,
        "timestamp": iso_millis(summary.timestamp),
        "total_devices": summary.total_devices,
        "connected_devices": summary.connected_devices,
        "average_voltage": summary.average_voltage,
        "total_capacity": summary.total_capacity,
        "overall_health": summary.overall_health,
        "devices": summary.devices,
    })
}

pub fn discovery(address: &str, local_name: Option<&str>, timestamp: DateTime<Utc>) -> Value {
    json!({
        "device_id": address,
        "timestamp": iso_millis(timestamp),
        "name": local_name,
    })
}

pub fn system_status(
    running: bool,
    uptime_s: u64,
    storage_connected: bool,
    mqtt_state: &str,
    bluetooth_connected: usize,
) -> Value {
    json!({
        "timestamp": iso_millis(Utc::now()),
        "core": {
            "running": running,
            "uptime_s": uptime_s,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "storage": {
            "connected": storage_connected,
        },
        "components": {
            "mqtt": mqtt_state,
            "bluetooth": { "connected_devices": bluetooth_connected },
            "api": "external",
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_payload_shape() {
        let mut r = Reading::new(12.6, 1.5, 25.1, 85.0, "BM6");
        r.capacity = Some(100.0);
        r.cycles = Some(12);

        let payload = reading("AA:BB:CC:DD:EE:01", &r, Some("van"), Some("BM6"));
        assert_eq!(payload["device_id"], "AA:BB:CC:DD:EE:01");
        assert_eq!(payload["voltage"], 12.6);
        assert_eq!(payload["capacity"], 100.0);
        assert_eq!(payload["cycles"], 12);
        assert_eq!(payload["vehicle_id"], "van");
        assert_eq!(payload["device_type"], "BM6");
        assert!((payload["power"].as_f64().unwrap() - 18.9).abs() < 1e-9);
        // ISO-8601 with millisecond precision, UTC
        let ts = payload["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z') && ts.contains('.'));
    }

    #[test]
    fn optional_fields_are_omitted() {
        let r = Reading::new(12.6, 0.0, 25.1, 85.0, "BM6");
        let payload = reading("AA:BB:CC:DD:EE:01", &r, None, None);
        assert!(payload.get("capacity").is_none());
        assert!(payload.get("vehicle_id").is_none());
        assert!(payload.get("extra").is_none());
    }

    #[test]
    fn status_payload_carries_errors() {
        let s = RuntimeStatus {
            connected: false,
            error_code: Some(408),
            error_message: Some("command response timed out".into()),
            protocol_version: Some("BM6".into()),
            last_command: Some("voltage_temp".into()),
        };
        let payload = status("AA:BB:CC:DD:EE:01", &s, Utc::now());
        assert_eq!(payload["connected"], false);
        assert_eq!(payload["error_code"], 408);
        assert_eq!(payload["protocol_version"], "BM6");
    }
}
