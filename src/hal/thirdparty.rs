//! Vendor USB CAN adapter driver (placeholder).
//!
//! No vendor adapter SDK (PCAN/Kvaser/Ixxat/USB2CAN) is bundled with this
//! crate; this variant exists so `platform::select`'s capability table can
//! name these interfaces without lying about what is actually wired up.
//! `connect` always fails with `InterfaceUnavailable`, naming the missing
//! driver, so callers fall back to the virtual bus the same way they would
//! on an unsupported platform.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{GatewayError, Result};
use crate::hal::{BusDriver, CanFrame};

pub struct ThirdPartyBusDriver {
    vendor: String,
}

impl ThirdPartyBusDriver {
    pub fn new(vendor: impl Into<String>) -> Self {
        Self { vendor: vendor.into() }
    }
}

#[async_trait]
impl BusDriver for ThirdPartyBusDriver {
    async fn connect(&mut self, _channel: &str, _interface: &str) -> Result<()> {
        Err(GatewayError::InterfaceUnavailable(format!(
            "no driver bundled for vendor adapter '{}'",
            self.vendor
        )))
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn send(&self, _frame: &CanFrame) -> Result<()> {
        Err(GatewayError::NotConnected)
    }

    async fn receive(&self, _timeout: Duration) -> Result<Option<CanFrame>> {
        Err(GatewayError::NotConnected)
    }
}
