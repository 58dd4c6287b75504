//! J1939/ISOBUS codec (C3).
//!
//! `identifier` decomposes/composes the 29-bit extended arbitration ID;
//! `spec` holds the static, read-only-after-startup PGN/SPN table;
//! `codec` is the encode/decode pipeline built on both.

pub mod codec;
pub mod identifier;
pub mod spec;

pub use codec::{decode, encode, DecodedMessage, BROADCAST_ADDRESS, DEFAULT_PRIORITY, EMERGENCY_PRIORITY};
pub use identifier::Identifier;
pub use spec::{classify_equipment_type, lookup, PgnSpec, SpnDataType, SpnSpec};
