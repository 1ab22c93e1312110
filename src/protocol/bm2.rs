//! Legacy framed codec (BM2 and generic monitors).
//!
//! Frames are `DD A5 <cmd> <len> <data...> <checksum> 77` in both
//! directions; the checksum is `0xFF - (sum of bytes after the start marker,
//! up to the checksum) mod 0x100`. Traffic is plaintext.

use std::collections::BTreeMap;

use serde_json::json;

use super::{Frame, ProtocolError, RequestKind};
use crate::types::Reading;

const START_MARKER: u8 = 0xDD;
const PROTOCOL_VERSION: u8 = 0xA5;
const END_MARKER: u8 = 0x77;

const CMD_BASIC_INFO: u8 = 0x03;
const CMD_CELL_VOLTAGES: u8 = 0x04;

const MIN_FRAME_LENGTH: usize = 6;
const MIN_BASIC_INFO_LENGTH: usize = 26;

const VOLTAGE_DIVISOR: f64 = 100.0;
const CURRENT_DIVISOR: f64 = 100.0;
const CAPACITY_DIVISOR: f64 = 100.0;
const CELL_VOLTAGE_DIVISOR: f64 = 1000.0;
const TEMPERATURE_DIVISOR: f64 = 10.0;
const SOFTWARE_VERSION_DIVISOR: f64 = 10.0;

/// Build a framed request.
pub fn build_request(kind: RequestKind) -> Result<Vec<u8>, ProtocolError> {
    let command = match kind {
        // The basic-info response carries voltage, current and temperature,
        // so both request kinds map onto it.
        RequestKind::VoltageTemp | RequestKind::BasicInfo => CMD_BASIC_INFO,
        RequestKind::CellVoltages => CMD_CELL_VOLTAGES,
    };
    Ok(build_frame(command, &[]))
}

fn build_frame(command: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![START_MARKER, PROTOCOL_VERSION, command, data.len() as u8];
    frame.extend_from_slice(data);
    frame.push(checksum(&frame[1..]));
    frame.push(END_MARKER);
    frame
}

fn checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
    0xFFu8.wrapping_sub((sum % 0x100) as u8)
}

/// Validate framing and dispatch on the command byte.
pub fn parse_notification(payload: &[u8]) -> Result<Option<Frame>, ProtocolError> {
    if payload.len() < MIN_FRAME_LENGTH {
        return Err(ProtocolError::framing("frame too short", payload));
    }
    if payload[0] != START_MARKER {
        return Err(ProtocolError::framing("bad start marker", payload));
    }
    if payload[payload.len() - 1] != END_MARKER {
        return Err(ProtocolError::framing("bad end marker", payload));
    }
    let expected = checksum(&payload[1..payload.len() - 2]);
    let actual = payload[payload.len() - 2];
    if expected != actual {
        return Err(ProtocolError::framing(
            format!("checksum mismatch: expected {expected:02x}, got {actual:02x}"),
            payload,
        ));
    }

    match payload[2] {
        CMD_BASIC_INFO => parse_basic_info(payload).map(|r| Some(Frame::Reading(r))),
        CMD_CELL_VOLTAGES => parse_cell_voltages(payload).map(|c| Some(Frame::Cells(c))),
        other => Err(ProtocolError::UnknownOpcode {
            opcode: format!("{other:02x}"),
            raw: payload.to_vec(),
        }),
    }
}

fn u16_at(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

fn i16_at(payload: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([payload[offset], payload[offset + 1]])
}

fn parse_basic_info(payload: &[u8]) -> Result<Reading, ProtocolError> {
    if payload.len() < MIN_BASIC_INFO_LENGTH {
        return Err(ProtocolError::framing("basic info frame too short", payload));
    }

    let voltage = u16_at(payload, 4) as f64 / VOLTAGE_DIVISOR;
    let current = i16_at(payload, 6) as f64 / CURRENT_DIVISOR;
    let remaining_capacity = u16_at(payload, 8) as f64 / CAPACITY_DIVISOR;
    let nominal_capacity = u16_at(payload, 10) as f64 / CAPACITY_DIVISOR;
    let cycles = u16_at(payload, 12) as u32;
    let production_date = decode_production_date(u16_at(payload, 14));
    let balance_status = u16_at(payload, 16);
    let protection = decode_protection_status(u16_at(payload, 18));
    let software_version = payload[20] as f64 / SOFTWARE_VERSION_DIVISOR;
    let state_of_charge = payload[21] as f64;
    let fet = decode_fet_status(payload[22]);
    let cell_count = payload[23] as usize;

    // Per-cell voltages, then temperature probes, run to the trailer.
    let trailer = payload.len() - 2;
    let mut cell_voltages = Vec::with_capacity(cell_count);
    let mut offset = 24;
    for _ in 0..cell_count {
        if offset + 2 > trailer {
            break;
        }
        cell_voltages.push(u16_at(payload, offset) as f64 / CELL_VOLTAGE_DIVISOR);
        offset += 2;
    }
    let mut temperatures = Vec::new();
    while offset + 2 <= trailer {
        temperatures.push(i16_at(payload, offset) as f64 / TEMPERATURE_DIVISOR);
        offset += 2;
    }

    let temperature = temperatures.first().copied().unwrap_or(0.0);

    let mut reading = Reading::new(voltage, current, temperature, state_of_charge, "BM2");
    reading.capacity = Some(remaining_capacity);
    reading.cycles = Some(cycles);

    let mut extra = BTreeMap::new();
    extra.insert("nominal_capacity".to_string(), json!(nominal_capacity));
    extra.insert("production_date".to_string(), json!(production_date));
    extra.insert("balance_status".to_string(), json!(balance_status));
    extra.insert("protection_status".to_string(), protection);
    extra.insert("software_version".to_string(), json!(software_version));
    extra.insert("fet_status".to_string(), fet);
    extra.insert("cell_count".to_string(), json!(cell_count));
    if !cell_voltages.is_empty() {
        extra.insert("cell_voltages".to_string(), json!(cell_voltages));
    }
    if !temperatures.is_empty() {
        extra.insert("temperatures".to_string(), json!(temperatures));
    }
    reading.extra = extra;

    reading
        .validate()
        .map_err(|reason| ProtocolError::parse(reason, payload))?;
    Ok(reading)
}

fn parse_cell_voltages(payload: &[u8]) -> Result<Vec<f64>, ProtocolError> {
    if payload.len() < 7 {
        return Err(ProtocolError::framing("cell voltage frame too short", payload));
    }
    let cell_count = payload[4] as usize;
    let trailer = payload.len() - 2;
    let mut cells = Vec::with_capacity(cell_count);
    let mut offset = 5;
    for _ in 0..cell_count {
        if offset + 2 > trailer {
            break;
        }
        cells.push(u16_at(payload, offset) as f64 / CELL_VOLTAGE_DIVISOR);
        offset += 2;
    }
    Ok(cells)
}

/// Date bit-field: 7 bits year since 2000, 4 bits month, 5 bits day.
fn decode_production_date(raw: u16) -> String {
    let year = 2000 + ((raw >> 9) & 0x7F);
    let month = (raw >> 5) & 0x0F;
    let day = raw & 0x1F;
    format!("{year}-{month:02}-{day:02}")
}

fn decode_protection_status(status: u16) -> serde_json::Value {
    json!({
        "single_cell_overvoltage": status & 0x0001 != 0,
        "single_cell_undervoltage": status & 0x0002 != 0,
        "battery_overvoltage": status & 0x0004 != 0,
        "battery_undervoltage": status & 0x0008 != 0,
        "charging_overtemperature": status & 0x0010 != 0,
        "charging_undertemperature": status & 0x0020 != 0,
        "discharging_overtemperature": status & 0x0040 != 0,
        "discharging_undertemperature": status & 0x0080 != 0,
        "charging_overcurrent": status & 0x0100 != 0,
        "discharging_overcurrent": status & 0x0200 != 0,
        "short_circuit": status & 0x0400 != 0,
        "front_end_detection_ic_error": status & 0x0800 != 0,
        "software_lock_mos": status & 0x1000 != 0,
    })
}

fn decode_fet_status(status: u8) -> serde_json::Value {
    json!({
        "charging": status & 0x01 != 0,
        "discharging": status & 0x02 != 0,
    })
}
