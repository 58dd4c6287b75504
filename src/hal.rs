//! Bus driver / hardware abstraction layer (C2).
//!
//! Defines the capability set every bus driver variant exposes — connect,
//! disconnect, send, blocking receive-with-timeout — and the raw frame type
//! that flows through the rest of the pipeline. `platform::select` picks
//! which variant to construct; everything above this layer only ever sees
//! the `BusDriver` trait object.

mod socket;
mod thirdparty;
mod virtual_bus;

pub use socket::SocketBusDriver;
pub use thirdparty::ThirdPartyBusDriver;
pub use virtual_bus::VirtualBusDriver;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// A raw CAN frame, immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CanFrame {
    /// 29-bit extended arbitration ID (or 11-bit standard, if `extended_id` is false).
    pub arbitration_id: u32,
    /// Data payload, at most 8 bytes.
    pub data: Vec<u8>,
    /// Time this frame was received or constructed.
    pub timestamp: DateTime<Utc>,
    pub extended_id: bool,
    pub error_frame: bool,
    pub remote_frame: bool,
}

impl CanFrame {
    /// Construct a well-formed extended-ID data frame (the only kind this
    /// gateway emits; `error_frame`/`remote_frame` only ever appear on
    /// frames received from a real bus).
    pub fn new_extended(arbitration_id: u32, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= 8, "CAN payload must be at most 8 bytes");
        Self {
            arbitration_id,
            data,
            timestamp: Utc::now(),
            extended_id: true,
            error_frame: false,
            remote_frame: false,
        }
    }
}

/// Capability set a bus driver must expose.
///
/// Implementations are `Socket` (native Linux SocketCAN), `Virtual`
/// (in-process loopback), and `ThirdParty` (vendor USB adapters — currently
/// unimplemented, see below).
#[async_trait]
pub trait BusDriver: Send + Sync {
    /// Open the channel. Idempotent: calling `connect` again on an already
    /// connected driver for the same channel is a no-op.
    async fn connect(&mut self, channel: &str, interface: &str) -> Result<()>;

    /// Release OS resources. Safe to call on a disconnected driver.
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether the driver currently holds an open channel.
    fn is_connected(&self) -> bool;

    /// Transmit a frame. Blocking in the sense that the call does not
    /// return until the frame has been handed to the driver/bus.
    async fn send(&self, frame: &CanFrame) -> Result<()>;

    /// Block for up to `timeout` waiting for a frame. Returns `Ok(None)` on
    /// timeout with no data, never an error for that case.
    async fn receive(&self, timeout: Duration) -> Result<Option<CanFrame>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_construction() {
        let frame = CanFrame::new_extended(0x0CF00400, vec![1, 2, 3]);
        assert!(frame.extended_id);
        assert!(!frame.error_frame);
        assert_eq!(frame.data, vec![1, 2, 3]);
    }
}
