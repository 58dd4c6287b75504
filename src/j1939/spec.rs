//! Static PGN/SPN specification table.
//!
//! This is a seed table covering a named, testable set of agricultural
//! signals (engine speed, torque, coolant temperature, vehicle speed,
//! position, fuel level) — not a transcription of the full J1939 standard.
//! Extending coverage is a data change to [`PGN_TABLE`], never a code
//! change: add an entry here and the codec, manager, and store all pick it
//! up automatically.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Underlying wire representation of an SPN's raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpnDataType {
    Uint8,
    Uint16,
    Uint32,
    Int8,
    Int16,
    Int32,
}

impl SpnDataType {
    /// Byte width on the wire.
    pub fn length(&self) -> usize {
        match self {
            Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 => 2,
            Self::Uint32 | Self::Int32 => 4,
        }
    }

    fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32)
    }
}

/// A single signal within a PGN.
#[derive(Debug, Clone)]
pub struct SpnSpec {
    pub spn: u32,
    pub name: &'static str,
    pub byte_offset: usize,
    pub data_type: SpnDataType,
    pub scale: f64,
    pub offset: f64,
    pub min_value: f64,
    pub max_value: f64,
}

impl SpnSpec {
    const fn new(
        spn: u32,
        name: &'static str,
        byte_offset: usize,
        data_type: SpnDataType,
        scale: f64,
        offset: f64,
        min_value: f64,
        max_value: f64,
    ) -> Self {
        Self {
            spn,
            name,
            byte_offset,
            data_type,
            scale,
            offset,
            min_value,
            max_value,
        }
    }
}

/// A PGN's name plus its signal list.
#[derive(Debug, Clone)]
pub struct PgnSpec {
    pub name: &'static str,
    pub spns: Vec<SpnSpec>,
}

/// Process-wide PGN spec table, built once and read-only thereafter.
pub static PGN_TABLE: Lazy<HashMap<u32, PgnSpec>> = Lazy::new(build_table);

fn build_table() -> HashMap<u32, PgnSpec> {
    use SpnDataType::*;

    let mut table = HashMap::new();

    table.insert(
        61444,
        PgnSpec {
            name: "EEC1",
            spns: vec![
                SpnSpec::new(512, "Driver's Demand - Percent Torque", 1, Uint8, 1.0, -125.0, -125.0, 125.0),
                SpnSpec::new(513, "Actual Engine - Percent Torque", 2, Uint8, 1.0, -125.0, 0.0, 125.0),
                SpnSpec::new(190, "Engine Speed", 3, Uint16, 0.125, 0.0, 0.0, 8031.875),
                SpnSpec::new(1483, "Source Address of Controlling Device", 5, Uint8, 1.0, 0.0, 0.0, 254.0),
                SpnSpec::new(1675, "Engine Starter Mode", 6, Uint8, 1.0, 0.0, 0.0, 2.0),
                SpnSpec::new(2432, "Engine Demand - Percent Torque", 7, Uint8, 1.0, -125.0, 0.0, 100.0),
            ],
        },
    );

    table.insert(
        65262,
        PgnSpec {
            name: "ET1",
            spns: vec![SpnSpec::new(110, "Engine Coolant Temperature", 0, Uint8, 1.0, -40.0, -40.0, 210.0)],
        },
    );

    table.insert(
        65265,
        PgnSpec {
            name: "CCVS1",
            spns: vec![SpnSpec::new(84, "Wheel-Based Vehicle Speed", 1, Uint16, 1.0 / 256.0, 0.0, 0.0, 250.996)],
        },
    );

    table.insert(
        65267,
        PgnSpec {
            name: "Vehicle Position",
            spns: vec![
                SpnSpec::new(584, "Latitude", 0, Uint32, 1e-7, 0.0, -180.0, 180.0),
                SpnSpec::new(585, "Longitude", 4, Uint32, 1e-7, 0.0, -180.0, 180.0),
            ],
        },
    );

    table.insert(
        65276,
        PgnSpec {
            name: "DD/VW",
            spns: vec![SpnSpec::new(96, "Fuel Level", 1, Uint8, 0.4, 0.0, 0.0, 100.0)],
        },
    );

    table
}

/// Look up a PGN's spec, forcing table construction on first access.
pub fn lookup(pgn: u32) -> Option<&'static PgnSpec> {
    PGN_TABLE.get(&pgn)
}

/// PGN families that should be tagged `equipment_type = "engine"` for the
/// optional classification column in the time-series store.
const ENGINE_PGNS: &[u32] = &[61444, 65262, 65276];
/// PGN families tagged `equipment_type = "vehicle"`.
const VEHICLE_PGNS: &[u32] = &[65265, 65267];

/// Best-effort equipment classification from PGN alone. Returns `None` for
/// PGNs the classifier doesn't recognize; has no bearing on decode
/// correctness, used only by the store's optional query filter.
pub fn classify_equipment_type(pgn: u32) -> Option<&'static str> {
    if ENGINE_PGNS.contains(&pgn) {
        Some("engine")
    } else if VEHICLE_PGNS.contains(&pgn) {
        Some("vehicle")
    } else {
        None
    }
}

pub(crate) fn max_unsigned_for(data_type: SpnDataType) -> u64 {
    match data_type.length() {
        1 => u8::MAX as u64,
        2 => u16::MAX as u64,
        4 => u32::MAX as u64,
        _ => unreachable!("SpnDataType only defines 1/2/4 byte widths"),
    }
}

pub(crate) fn is_signed(data_type: SpnDataType) -> bool {
    data_type.is_signed()
}

/// Inclusive min/max a signed `data_type`'s raw wire integer can hold.
pub(crate) fn signed_range_for(data_type: SpnDataType) -> (i64, i64) {
    match data_type.length() {
        1 => (i8::MIN as i64, i8::MAX as i64),
        2 => (i16::MIN as i64, i16::MAX as i64),
        4 => (i32::MIN as i64, i32::MAX as i64),
        _ => unreachable!("SpnDataType only defines 1/2/4 byte widths"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_has_seed_pgns() {
        for pgn in [61444u32, 65262, 65265, 65267, 65276] {
            assert!(lookup(pgn).is_some(), "missing PGN {pgn}");
        }
    }

    #[test]
    fn test_engine_speed_spec() {
        let spec = lookup(61444).unwrap();
        let engine_speed = spec.spns.iter().find(|s| s.spn == 190).unwrap();
        assert_eq!(engine_speed.scale, 0.125);
        assert_eq!(engine_speed.max_value, 8031.875);
    }

    #[test]
    fn test_classify_equipment_type() {
        assert_eq!(classify_equipment_type(61444), Some("engine"));
        assert_eq!(classify_equipment_type(65265), Some("vehicle"));
        assert_eq!(classify_equipment_type(999999), None);
    }

    #[test]
    fn test_unknown_pgn_not_present() {
        assert!(lookup(12345).is_none());
    }
}
