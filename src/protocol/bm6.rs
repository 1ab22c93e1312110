//! Encrypted-monitor (BM6-class) codec.
//!
//! Commands are three-byte opcodes zero-padded to one cipher block and
//! encrypted. Notifications are one or more 16-byte blocks; each block is
//! decrypted on its own and interpreted by its leading opcode. Field layout
//! inside the realtime block, in hex-digit positions of the decrypted block:
//!
//! ```text
//! d15507 SS TT XX CC VVVV ...
//!   0-5  6  8  10 12 14-17
//! ```
//!
//! `SS` temperature sign (01 = negative, ff = command echo), `TT` temperature
//! in decidegrees, `XX` device state, `CC` state of charge in percent, `VVVV`
//! voltage in centivolts.

use std::collections::BTreeMap;

use tracing::debug;

use super::crypto::{self, BLOCK_SIZE};
use super::{Frame, ProtocolError, RequestKind};
use crate::types::Reading;

const REALTIME_PREFIX: &str = "d15507";
const VERSION_PREFIX: &str = "d15501";

const OPCODE_REALTIME: [u8; 3] = [0xd1, 0x55, 0x07];
const OPCODE_VERSION: [u8; 3] = [0xd1, 0x55, 0x01];
const OPCODE_CELLS: [u8; 3] = [0xd1, 0x55, 0x04];

const VOLTAGE_DIVISOR: f64 = 100.0;
const TEMPERATURE_DIVISOR: f64 = 10.0;

/// Build an encrypted request block.
pub fn build_request(kind: RequestKind) -> Result<Vec<u8>, ProtocolError> {
    let opcode = match kind {
        RequestKind::VoltageTemp => OPCODE_REALTIME,
        RequestKind::BasicInfo => OPCODE_VERSION,
        RequestKind::CellVoltages => OPCODE_CELLS,
    };
    crypto::encrypt(&crypto::pad_block(&opcode)?)
}

/// Decrypt and interpret a notification payload.
///
/// Multi-block payloads are walked front to back; the first block that
/// carries something actionable wins. A lone command echo yields `Ok(None)`.
pub fn parse_notification(payload: &[u8]) -> Result<Option<Frame>, ProtocolError> {
    if payload.is_empty() || payload.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::framing(
            format!("notification length {} is not 16-byte aligned", payload.len()),
            payload,
        ));
    }

    let mut last_error = None;
    for block in payload.chunks(BLOCK_SIZE) {
        let plain = crypto::decrypt(block)?;
        match parse_block(&plain) {
            Ok(Some(frame)) => return Ok(Some(frame)),
            Ok(None) => {}
            Err(e) => last_error = Some(e),
        }
    }

    match last_error {
        Some(e) => Err(e),
        None => Ok(None),
    }
}

fn parse_block(plain: &[u8]) -> Result<Option<Frame>, ProtocolError> {
    let h = hex::encode(plain);

    if let Some(rest) = h.strip_prefix(REALTIME_PREFIX) {
        if rest.starts_with("ff") {
            // Command echo, not a measurement.
            debug!("realtime echo block, ignoring");
            return Ok(None);
        }
        return parse_realtime(&h, plain).map(|r| Some(Frame::Reading(r)));
    }

    if h.starts_with(VERSION_PREFIX) {
        let mut version = h[VERSION_PREFIX.len()..].to_string();
        while version.ends_with("00") {
            version.truncate(version.len() - 2);
        }
        return Ok(Some(Frame::Version(version)));
    }

    Err(ProtocolError::UnknownOpcode {
        opcode: h.chars().take(6).collect(),
        raw: plain.to_vec(),
    })
}

fn parse_realtime(h: &str, raw: &[u8]) -> Result<Reading, ProtocolError> {
    if h.len() < 18 {
        return Err(ProtocolError::framing("realtime block too short", raw));
    }

    let sign = hex_field(h, 6, 8, raw)?;
    let temp_raw = hex_field(h, 8, 10, raw)?;
    let state = hex_field(h, 10, 12, raw)?;
    let soc_raw = hex_field(h, 12, 14, raw)?;
    let voltage_raw = hex_field(h, 14, 18, raw)?;

    let voltage = voltage_raw as f64 / VOLTAGE_DIVISOR;
    let mut temperature = temp_raw as f64 / TEMPERATURE_DIVISOR;
    if sign == 0x01 {
        temperature = -temperature;
    }

    let mut reading = Reading::new(voltage, 0.0, temperature, soc_raw as f64, "BM6");
    reading.extra = BTreeMap::from([("state".to_string(), serde_json::json!(state))]);

    reading
        .validate()
        .map_err(|reason| ProtocolError::parse(reason, raw))?;
    Ok(reading)
}

fn hex_field(h: &str, start: usize, end: usize, raw: &[u8]) -> Result<u32, ProtocolError> {
    u32::from_str_radix(&h[start..end], 16)
        .map_err(|_| ProtocolError::framing(format!("bad hex at {start}..{end}"), raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decrypted realtime block: 25.1 degrees, SoC 85 %, 12.60 V.
    fn realtime_block() -> [u8; 16] {
        let mut block = [0u8; 16];
        block[..9].copy_from_slice(&hex::decode("d1550700fb005504ec").unwrap());
        block
    }

    #[test]
    fn realtime_round_trip() {
        let wire = crypto::encrypt(&realtime_block()).unwrap();
        let frame = parse_notification(&wire).unwrap().unwrap();
        match frame {
            Frame::Reading(r) => {
                assert!((r.voltage - 12.60).abs() < 1e-9);
                assert!((r.temperature - 25.1).abs() < 1e-9);
                assert!((r.state_of_charge - 85.0).abs() < 1e-9);
                assert_eq!(r.protocol, "BM6");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn negative_temperature_sign() {
        let mut block = realtime_block();
        block[3] = 0x01; // sign nibble pair
        let wire = crypto::encrypt(&block).unwrap();
        match parse_notification(&wire).unwrap().unwrap() {
            Frame::Reading(r) => assert!((r.temperature + 25.1).abs() < 1e-9),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn out_of_range_soc_is_rejected() {
        let mut block = realtime_block();
        block[6] = 0xfa; // SoC byte -> 250
        let wire = crypto::encrypt(&block).unwrap();
        assert!(matches!(
            parse_notification(&wire),
            Err(ProtocolError::Parse { .. })
        ));
    }

    #[test]
    fn echo_block_is_ignored() {
        let mut block = [0u8; 16];
        block[..4].copy_from_slice(&[0xd1, 0x55, 0x07, 0xff]);
        let wire = crypto::encrypt(&block).unwrap();
        assert!(parse_notification(&wire).unwrap().is_none());
    }

    #[test]
    fn version_block_parses() {
        let mut block = [0u8; 16];
        block[..6].copy_from_slice(&[0xd1, 0x55, 0x01, 0x01, 0x02, 0x03]);
        let wire = crypto::encrypt(&block).unwrap();
        match parse_notification(&wire).unwrap().unwrap() {
            Frame::Version(v) => assert_eq!(v, "010203"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_surfaces() {
        let mut block = [0u8; 16];
        block[..3].copy_from_slice(&[0xd1, 0x55, 0x99]);
        let wire = crypto::encrypt(&block).unwrap();
        assert!(matches!(
            parse_notification(&wire),
            Err(ProtocolError::UnknownOpcode { .. })
        ));
    }

    #[test]
    fn misaligned_notification_is_framing_error() {
        assert!(matches!(
            parse_notification(&[0u8; 15]),
            Err(ProtocolError::Framing { .. })
        ));
    }

    #[test]
    fn requests_are_one_encrypted_block() {
        for kind in [
            RequestKind::VoltageTemp,
            RequestKind::BasicInfo,
            RequestKind::CellVoltages,
        ] {
            let wire = build_request(kind).unwrap();
            assert_eq!(wire.len(), BLOCK_SIZE);
        }
        // Distinct opcodes must produce distinct ciphertext.
        assert_ne!(
            build_request(RequestKind::VoltageTemp).unwrap(),
            build_request(RequestKind::CellVoltages).unwrap()
        );
    }
}
