//! SocketCAN bus driver (Linux only).
//!
//! Wraps the `socketcan` crate's async socket over a raw `can0`/`vcan0`
//! interface. Gated behind the `can` feature plus `target_os = "linux"`
//! since SocketCAN is a Linux kernel facility with no portable equivalent.

#![cfg(all(target_os = "linux", feature = "can"))]

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use socketcan::tokio::CanSocket;
use socketcan::{CanFrame as SocketCanFrame, EmbeddedFrame, ExtendedId, Frame, Id, StandardId};

use crate::error::{GatewayError, Result};
use crate::hal::{BusDriver, CanFrame};

/// Native SocketCAN driver.
pub struct SocketBusDriver {
    socket: Option<CanSocket>,
}

impl SocketBusDriver {
    pub fn new() -> Self {
        Self { socket: None }
    }
}

impl Default for SocketBusDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusDriver for SocketBusDriver {
    async fn connect(&mut self, channel: &str, _interface: &str) -> Result<()> {
        let socket = CanSocket::open(channel)
            .map_err(|e| GatewayError::ConnectError(format!("{channel}: {e}")))?;
        self.socket = Some(socket);
        #[cfg(feature = "tracing-support")]
        tracing::info!(channel, "socketcan connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn send(&self, frame: &CanFrame) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(GatewayError::NotConnected)?;

        let id: Id = if frame.extended_id {
            ExtendedId::new(frame.arbitration_id)
                .map(Id::Extended)
                .ok_or_else(|| GatewayError::SendError("arbitration id out of range".into()))?
        } else {
            StandardId::new(frame.arbitration_id as u16)
                .map(Id::Standard)
                .ok_or_else(|| GatewayError::SendError("arbitration id out of range".into()))?
        };

        let raw = SocketCanFrame::new(id, &frame.data)
            .ok_or_else(|| GatewayError::SendError("invalid frame payload".into()))?;

        socket
            .write_frame(raw)
            .map_err(|e| GatewayError::SendError(e.to_string()))?
            .await
            .map_err(|e| GatewayError::SendError(e.to_string()))?;

        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<CanFrame>> {
        let socket = self.socket.as_ref().ok_or(GatewayError::NotConnected)?;

        match tokio::time::timeout(timeout, socket.read_frame()).await {
            Ok(Ok(raw)) => Ok(Some(from_socketcan_frame(raw))),
            Ok(Err(e)) => Err(GatewayError::ReceiveError(e.to_string())),
            Err(_elapsed) => Ok(None),
        }
    }
}

fn from_socketcan_frame(raw: SocketCanFrame) -> CanFrame {
    let (arbitration_id, extended_id) = match raw.id() {
        Id::Standard(id) => (id.as_raw() as u32, false),
        Id::Extended(id) => (id.as_raw(), true),
    };

    CanFrame {
        arbitration_id,
        data: raw.data().to_vec(),
        timestamp: Utc::now(),
        extended_id,
        error_frame: raw.is_error_frame(),
        remote_frame: raw.is_remote_frame(),
    }
}
