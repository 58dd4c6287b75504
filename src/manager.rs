//! Connection manager (C4).
//!
//! Owns one bus driver, a copy-on-write list of message handlers, and the
//! cooperative receive loop that pulls frames off the driver, decodes them
//! through the codec, and fans them out to every handler in isolation —
//! one handler's panic-free error never blocks or drops the message for its
//! siblings, mirroring the per-handler isolation the original `J1939Client`'s
//! receive task gave a single hardcoded callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};
use crate::hal::{BusDriver, CanFrame, SocketBusDriver, ThirdPartyBusDriver, VirtualBusDriver};
use crate::j1939::{self, DecodedMessage, BROADCAST_ADDRESS, DEFAULT_PRIORITY, EMERGENCY_PRIORITY};

const RECEIVE_POLL_TIMEOUT: Duration = Duration::from_millis(100);
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// A decoded message together with the raw frame it came from, handed to
/// every registered handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub raw: CanFrame,
    pub decoded: DecodedMessage,
}

/// Receives every decoded message the manager dispatches. Implementations
/// must not panic: a handler that wants to signal a problem returns `Err`,
/// which the manager logs and isolates from the other handlers, never
/// propagating it back into the receive loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<()>;
}

/// A snapshot of the manager's running state, per §4.4.
#[derive(Debug, Clone)]
pub struct ManagerStatus {
    pub platform: String,
    pub interface: String,
    pub channel: String,
    pub is_connected: bool,
    pub is_running: bool,
    pub handler_count: usize,
}

fn build_driver(interface: &str) -> Box<dyn BusDriver> {
    match interface {
        "socketcan" => {
            #[cfg(all(target_os = "linux", feature = "can"))]
            {
                Box::new(SocketBusDriver::new())
            }
            #[cfg(not(all(target_os = "linux", feature = "can")))]
            {
                Box::new(ThirdPartyBusDriver::new("socketcan"))
            }
        }
        "virtual" => Box::new(VirtualBusDriver::new()),
        other => Box::new(ThirdPartyBusDriver::new(other)),
    }
}

/// The connection manager (C4): one bus driver, a handler registry, and the
/// receive loop that ties C2 and C3 together for the rest of the pipeline.
pub struct ConnectionManager {
    driver: RwLock<Box<dyn BusDriver>>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    platform: String,
    interface: String,
    channel: RwLock<String>,
    running: Arc<AtomicBool>,
    receive_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Build a manager for `interface`, without connecting yet.
    pub fn new(platform: &str, interface: &str) -> Self {
        Self {
            driver: RwLock::new(build_driver(interface)),
            handlers: RwLock::new(Vec::new()),
            platform: platform.to_string(),
            interface: interface.to_string(),
            channel: RwLock::new(String::new()),
            running: Arc::new(AtomicBool::new(false)),
            receive_task: std::sync::Mutex::new(None),
        }
    }

    /// Open `channel` on the underlying driver. Idempotent per the driver's
    /// own connect semantics.
    pub async fn connect(&self, channel: &str) -> Result<()> {
        self.driver.write().await.connect(channel, &self.interface).await?;
        *self.channel.write().await = channel.to_string();
        #[cfg(feature = "tracing-support")]
        tracing::info!(channel, interface = %self.interface, "connection manager connected");
        Ok(())
    }

    /// Disconnect and stop receiving, if running.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_receiving().await;
        self.driver.write().await.disconnect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.driver.read().await.is_connected()
    }

    /// Register a handler. Copy-on-write: the handler list is cloned,
    /// extended, and swapped in, so a concurrent dispatch in progress keeps
    /// iterating its own snapshot undisturbed.
    pub async fn add_handler(&self, handler: Arc<dyn MessageHandler>) {
        let mut guard = self.handlers.write().await;
        let mut next = (*guard).clone();
        next.push(handler);
        *guard = next;
    }

    /// Remove every handler for which `predicate` returns true.
    pub async fn remove_handler(&self, predicate: impl Fn(&Arc<dyn MessageHandler>) -> bool) {
        let mut guard = self.handlers.write().await;
        let next: Vec<_> = guard.iter().filter(|h| !predicate(h)).cloned().collect();
        *guard = next;
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Encode and transmit a J1939 message. `source_address` identifies this
    /// node; `destination_address` defaults to broadcast and `priority` to
    /// the default data priority when not overridden by the caller.
    pub async fn send_j1939(
        &self,
        pgn: u32,
        source_address: u8,
        destination_address: Option<u8>,
        priority: Option<u8>,
        spn_values: &HashMap<String, f64>,
    ) -> Result<()> {
        let frame = j1939::encode(
            pgn,
            source_address,
            destination_address.unwrap_or(BROADCAST_ADDRESS),
            priority.unwrap_or(DEFAULT_PRIORITY),
            spn_values,
        )?;
        self.driver.read().await.send(&frame).await
    }

    /// Send the PGN 61444 (Electronic Engine Controller 1) emergency-stop
    /// convenience wrapper: Engine Speed forced to zero at the reserved
    /// emergency priority. `urgency` is carried in `spn_values` as
    /// informational context for handlers, it does not change priority —
    /// emergency stops always use `EMERGENCY_PRIORITY`.
    pub async fn send_emergency_stop(&self, source_address: u8, reason: &str, urgency: u8) -> Result<()> {
        #[cfg(feature = "tracing-support")]
        tracing::warn!(reason, urgency, "emergency stop requested");

        let mut values = HashMap::new();
        values.insert("Engine Speed".to_string(), 0.0);

        self.send_j1939(
            61444,
            source_address,
            Some(BROADCAST_ADDRESS),
            Some(EMERGENCY_PRIORITY),
            &values,
        )
        .await
    }

    /// Start the cooperative receive loop: poll the driver with a short
    /// timeout, decode whatever arrives, dispatch to every handler with
    /// per-handler error isolation, and retry on timeout. A fatal
    /// (needs-reconnect) driver error backs off briefly and keeps retrying
    /// rather than tearing the loop down, since transient bus noise should
    /// not require the caller to restart receiving by hand.
    pub async fn start_receiving(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(()); // already running
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while manager.running.load(Ordering::SeqCst) {
                let received = {
                    let driver = manager.driver.read().await;
                    driver.receive(RECEIVE_POLL_TIMEOUT).await
                };

                match received {
                    Ok(Some(frame)) => {
                        let decoded = j1939::decode(&frame);
                        let message = InboundMessage { raw: frame, decoded };
                        manager.dispatch(&message).await;
                    }
                    Ok(None) => {
                        // Timeout with no data; loop and poll again.
                    }
                    Err(e) => {
                        #[cfg(feature = "tracing-support")]
                        tracing::error!(error = %e, "receive loop error");
                        if e.needs_reconnect() {
                            tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        });

        *self.receive_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn dispatch(&self, message: &InboundMessage) {
        let handlers = self.handlers.read().await.clone();
        for handler in handlers.iter() {
            if let Err(e) = handler.handle(message).await {
                #[cfg(feature = "tracing-support")]
                tracing::warn!(error = %e, "message handler returned an error, continuing with other handlers");
                let _ = e;
            }
        }
    }

    /// Stop the receive loop. Safe to call when not running.
    pub async fn stop_receiving(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receive_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> ManagerStatus {
        ManagerStatus {
            platform: self.platform.clone(),
            interface: self.interface.clone(),
            channel: self.channel.read().await.clone(),
            is_connected: self.is_connected().await,
            is_running: self.is_running(),
            handler_count: self.handler_count().await,
        }
    }
}
