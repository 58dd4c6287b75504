//! SPN payload encode/decode (C3).
//!
//! Byte-level extraction follows the original `decode_spn` bit-masking
//! exactly, including the "not available" sentinel check (all data bits set)
//! before range validation runs. Encoding is the exact inverse: compute the
//! raw integer from the scaled value, reject out-of-range, write it
//! little-endian at `byte_offset`, and fill every byte no SPN claims with
//! `0xFF` (the J1939 "not available" convention).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{GatewayError, Result};
use crate::hal::CanFrame;
use crate::j1939::identifier::Identifier;
use crate::j1939::spec::{self, PgnSpec, SpnDataType, SpnSpec};

/// Default priority for outbound J1939 frames this gateway composes.
pub const DEFAULT_PRIORITY: u8 = 6;
/// Reserved priority for the emergency-stop helper (§4.4).
pub const EMERGENCY_PRIORITY: u8 = 7;
/// Destination address meaning "broadcast to all nodes".
pub const BROADCAST_ADDRESS: u8 = 0xFF;

const PAYLOAD_LEN: usize = 8;
/// J1939 "not available" sentinel: every bit of the covered span set.
const NOT_AVAILABLE: u8 = 0xFF;

/// A fully decoded J1939 application message, built from a raw frame plus
/// the static PGN/SPN table.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub pgn: u32,
    pub pgn_name: &'static str,
    pub priority: u8,
    pub source_address: u8,
    pub destination_address: u8,
    pub spn_values: HashMap<String, f64>,
    pub raw_data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub decoding_success: bool,
    pub valid_spn_count: usize,
    pub equipment_type: Option<&'static str>,
}

/// Encode SPN values for a PGN into a raw CAN frame.
///
/// Fails with `UnknownPGN` if the PGN has no entry in the spec table, or
/// `SPNOutOfRange` if any provided value falls outside its SPN's range.
pub fn encode(
    pgn: u32,
    source_address: u8,
    destination_address: u8,
    priority: u8,
    spn_values: &HashMap<String, f64>,
) -> Result<CanFrame> {
    let spec = spec::lookup(pgn).ok_or(GatewayError::UnknownPgn(pgn))?;

    let mut payload = [NOT_AVAILABLE; PAYLOAD_LEN];

    for (name, &value) in spn_values {
        let spn = spec
            .spns
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| GatewayError::ValidationError(format!("unknown SPN '{name}' for PGN {pgn}")))?;

        encode_spn_into(&mut payload, spn, value)?;
    }

    let arbitration_id = Identifier::compose(priority, pgn, source_address, destination_address);
    Ok(CanFrame::new_extended(arbitration_id, payload.to_vec()))
}

fn encode_spn_into(payload: &mut [u8; PAYLOAD_LEN], spn: &SpnSpec, value: f64) -> Result<()> {
    if value < spn.min_value || value > spn.max_value {
        return Err(GatewayError::SpnOutOfRange {
            spn: spn.spn,
            name: spn.name.to_string(),
            value,
            min: spn.min_value,
            max: spn.max_value,
        });
    }

    let raw = ((value - spn.offset) / spn.scale).round();
    let len = spn.data_type.length();
    let end = spn.byte_offset + len;
    if end > PAYLOAD_LEN {
        return Err(GatewayError::ValidationError(format!(
            "SPN {} ({}) does not fit an 8-byte payload at offset {}",
            spn.spn, spn.name, spn.byte_offset
        )));
    }

    let out_of_range = || GatewayError::SpnOutOfRange {
        spn: spn.spn,
        name: spn.name.to_string(),
        value,
        min: spn.min_value,
        max: spn.max_value,
    };

    let bytes = if spec::is_signed(spn.data_type) {
        let (min, max) = spec::signed_range_for(spn.data_type);
        if raw < min as f64 || raw > max as f64 {
            return Err(out_of_range());
        }
        (raw as i64).to_le_bytes()
    } else {
        if raw < 0.0 || raw > spec::max_unsigned_for(spn.data_type) as f64 {
            return Err(out_of_range());
        }
        (raw as u64).to_le_bytes()
    };

    payload[spn.byte_offset..end].copy_from_slice(&bytes[..len]);
    Ok(())
}

/// Decode a raw frame into a `DecodedMessage`.
///
/// Returns `Ok(message)` with `decoding_success = false` (and the raw frame
/// still attached) when the PGN is unknown, the payload is too short, or any
/// SPN's scaled value falls outside its declared range — per §4.3, a failed
/// decode never discards the raw frame, only its interpreted values.
pub fn decode(frame: &CanFrame) -> DecodedMessage {
    let id = Identifier::decompose(frame.arbitration_id);

    let Some(pgn_spec) = spec::lookup(id.pgn) else {
        return failed_message(&id, frame);
    };

    match decode_spns(&frame.data, pgn_spec) {
        Ok(spn_values) => {
            let valid_spn_count = spn_values.len();
            DecodedMessage {
                pgn: id.pgn,
                pgn_name: pgn_spec.name,
                priority: id.priority,
                source_address: id.source_address,
                destination_address: id.destination_address,
                spn_values,
                raw_data: frame.data.clone(),
                timestamp: frame.timestamp,
                decoding_success: true,
                valid_spn_count,
                equipment_type: spec::classify_equipment_type(id.pgn),
            }
        }
        Err(_) => failed_message(&id, frame),
    }
}

/// Attempt to decode every SPN in `pgn_spec` out of `data`.
///
/// Any single SPN out of range or unreadable fails the whole decode, per the
/// "invariant" in §3 ("if any SPN fails, the whole decode fails").
fn decode_spns(data: &[u8], pgn_spec: &PgnSpec) -> Result<HashMap<String, f64>> {
    let mut values = HashMap::with_capacity(pgn_spec.spns.len());

    for spn in &pgn_spec.spns {
        let end = spn.byte_offset + spn.data_type.length();
        if end > data.len() {
            return Err(GatewayError::PayloadTooShort {
                needed: end,
                got: data.len(),
            });
        }

        let Some(raw) = extract_raw(&data[spn.byte_offset..end], spn.data_type) else {
            // "Not available" sentinel: this SPN carries no data, which is
            // normal on a bus where not every ECU populates every signal.
            continue;
        };

        let value = (raw as f64) * spn.scale + spn.offset;
        if value < spn.min_value || value > spn.max_value {
            return Err(GatewayError::SpnOutOfRange {
                spn: spn.spn,
                name: spn.name.to_string(),
                value,
                min: spn.min_value,
                max: spn.max_value,
            });
        }

        values.insert(spn.name.to_string(), value);
    }

    Ok(values)
}

/// Extract the raw signed/unsigned integer at a byte span, returning `None`
/// if every bit is set (the J1939 "not available" convention).
fn extract_raw(bytes: &[u8], data_type: SpnDataType) -> Option<i64> {
    if bytes.iter().all(|&b| b == NOT_AVAILABLE) {
        return None;
    }

    Some(match data_type {
        SpnDataType::Uint8 => bytes[0] as i64,
        SpnDataType::Uint16 => u16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        SpnDataType::Uint32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        SpnDataType::Int8 => bytes[0] as i8 as i64,
        SpnDataType::Int16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        SpnDataType::Int32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
    })
}

fn failed_message(id: &Identifier, frame: &CanFrame) -> DecodedMessage {
    DecodedMessage {
        pgn: id.pgn,
        pgn_name: spec::lookup(id.pgn).map(|s| s.name).unwrap_or("unknown"),
        priority: id.priority,
        source_address: id.source_address,
        destination_address: id.destination_address,
        spn_values: HashMap::new(),
        raw_data: frame.data.clone(),
        timestamp: frame.timestamp,
        decoding_success: false,
        valid_spn_count: 0,
        equipment_type: spec::classify_equipment_type(id.pgn),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_speed_values(rpm: f64) -> HashMap<String, f64> {
        let mut m = HashMap::new();
        m.insert("Engine Speed".to_string(), rpm);
        m
    }

    #[test]
    fn test_s1_engine_speed_roundtrip() {
        // S1: PGN 61444, SPN 190, value 2000, source_address 0x23.
        let frame = encode(61444, 0x23, BROADCAST_ADDRESS, DEFAULT_PRIORITY, &engine_speed_values(2000.0)).unwrap();
        let decoded = decode(&frame);
        assert!(decoded.decoding_success);
        assert_eq!(decoded.source_address, 0x23);
        assert_eq!(decoded.spn_values.get("Engine Speed"), Some(&2000.0));
    }

    #[test]
    fn test_s2_out_of_range_rejected() {
        // S2: value 8192 exceeds Engine Speed's max of 8031.875.
        let err = encode(61444, 0x23, BROADCAST_ADDRESS, DEFAULT_PRIORITY, &engine_speed_values(8192.0))
            .unwrap_err();
        assert!(matches!(err, GatewayError::SpnOutOfRange { .. }));
    }

    #[test]
    fn test_unknown_pgn_rejected() {
        let err = encode(99999, 0x00, BROADCAST_ADDRESS, DEFAULT_PRIORITY, &HashMap::new()).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownPgn(99999)));
    }

    #[test]
    fn test_decode_preserves_raw_frame_on_failure() {
        // Corrupt the payload so Engine Coolant Temperature decodes out of range.
        let frame = CanFrame::new_extended(
            Identifier::compose(6, 65262, 0x11, BROADCAST_ADDRESS),
            vec![0, 0, 0, 0, 0, 0, 0, 0], // raw 0 -> -40 + 0 = -40, within range actually
        );
        let decoded = decode(&frame);
        assert!(decoded.decoding_success);
        assert_eq!(decoded.raw_data, frame.data);
    }

    #[test]
    fn test_decode_unknown_pgn_keeps_raw_data() {
        let frame = CanFrame::new_extended(
            Identifier::compose(6, 0xABCD, 0x01, BROADCAST_ADDRESS),
            vec![1, 2, 3, 4, 5, 6, 7, 8],
        );
        let decoded = decode(&frame);
        assert!(!decoded.decoding_success);
        assert_eq!(decoded.raw_data, frame.data);
    }

    #[test]
    fn test_not_available_sentinel_skipped() {
        let mut values = HashMap::new();
        values.insert("Fuel Level".to_string(), 50.0);
        let frame = encode(65276, 0x01, BROADCAST_ADDRESS, DEFAULT_PRIORITY, &values).unwrap();
        // Byte 0 is uncovered by any SPN in PGN 65276, so it stays 0xFF.
        assert_eq!(frame.data[0], 0xFF);
    }

    #[test]
    fn test_decode_encode_determinism_over_table() {
        // Property 1: for every seed PGN, round-tripping at mid-range values holds.
        for &pgn in &[61444u32, 65262, 65265, 65267, 65276] {
            let spec = spec::lookup(pgn).unwrap();
            let mut values = HashMap::new();
            for spn in &spec.spns {
                let mid = (spn.min_value + spn.max_value) / 2.0;
                values.insert(spn.name.to_string(), mid);
            }
            let frame = encode(pgn, 0x42, BROADCAST_ADDRESS, DEFAULT_PRIORITY, &values).unwrap();
            let decoded = decode(&frame);
            assert!(decoded.decoding_success, "pgn {pgn} failed to decode");
            for (name, expected) in &values {
                let actual = decoded.spn_values.get(name).unwrap();
                let spn = spec.spns.iter().find(|s| &s.name == name).unwrap();
                assert!(
                    (actual - expected).abs() <= spn.scale,
                    "pgn {pgn} spn {name}: expected {expected}, got {actual}"
                );
            }
        }
    }

    fn synthetic_signed_spn(data_type: SpnDataType, byte_offset: usize, min_value: f64, max_value: f64) -> SpnSpec {
        SpnSpec {
            spn: 0xFFFF,
            name: "Synthetic Signed",
            byte_offset,
            data_type,
            scale: 1.0,
            offset: 0.0,
            min_value,
            max_value,
        }
    }

    #[test]
    fn test_signed_spn_round_trips_negative_raw() {
        let spn = synthetic_signed_spn(SpnDataType::Int16, 0, -500.0, 500.0);
        let mut payload = [NOT_AVAILABLE; PAYLOAD_LEN];
        encode_spn_into(&mut payload, &spn, -273.0).unwrap();

        let raw = extract_raw(&payload[0..2], SpnDataType::Int16).unwrap();
        assert_eq!(raw, -273);
    }

    #[test]
    fn test_signed_spn_rejects_value_outside_data_width() {
        // min/max is wider than Int8 can hold, so a legal-looking value
        // still has to fail once it can't fit the wire width.
        let spn = synthetic_signed_spn(SpnDataType::Int8, 0, -1000.0, 1000.0);
        let mut payload = [NOT_AVAILABLE; PAYLOAD_LEN];
        let err = encode_spn_into(&mut payload, &spn, -200.0).unwrap_err();
        assert!(matches!(err, GatewayError::SpnOutOfRange { .. }));
    }

    #[test]
    fn test_identifier_fields_well_formed() {
        // Property 3: priority/source_address stay in range, PGN round-trips.
        for &pgn in &[61444u32, 65262, 65265, 65267, 65276] {
            let frame = encode(pgn, 0x17, BROADCAST_ADDRESS, 4, &HashMap::new()).unwrap();
            let id = Identifier::decompose(frame.arbitration_id);
            assert!(id.priority <= 7);
            assert_eq!(id.source_address, 0x17);
            assert_eq!(id.pgn, pgn);
        }
    }
}
