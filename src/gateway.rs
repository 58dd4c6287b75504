//! Composition root.
//!
//! `Gateway` owns one instance of every numbered component and wires them
//! into the running pipeline: [`ConnectionManager`] (C4) feeds decoded
//! messages into the [`MessageBuffer`] (C5) through a registered handler; a
//! spawned flush task drains the buffer on a size-or-time trigger and writes
//! through the [`TimeSeriesStore`] (C6), itself backed by the
//! [`ConnectionPool`] (C7); a [`TokenUsageStore`] (C8) shares that same pool.
//! This mirrors the donor's own "pure protocol library, application wires
//! the loop" split while giving this crate one concrete, testable entry
//! point instead of leaving composition to an unscoped caller.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::buffer::{BufferedMessage, MessageBuffer};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::manager::{ConnectionManager, InboundMessage, MessageHandler};
use crate::platform;
use crate::pool::ConnectionPool;
use crate::store::TimeSeriesStore;
use crate::tokens::TokenUsageStore;

/// Forwards every decoded message the connection manager dispatches into
/// the shared message buffer, applying back-pressure (dropping on a full
/// buffer) rather than blocking the receive loop.
struct BufferHandler {
    buffer: Arc<MessageBuffer>,
    interface_id: String,
}

#[async_trait]
impl MessageHandler for BufferHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<()> {
        self.buffer
            .push(BufferedMessage {
                raw: message.raw.clone(),
                decoded: Some(message.decoded.clone()),
                reception_time: message.decoded.timestamp,
                interface_id: self.interface_id.clone(),
            })
            .await;
        Ok(())
    }
}

/// The assembled, running gateway: C1 through C8 wired together.
pub struct Gateway {
    pub manager: Arc<ConnectionManager>,
    pub buffer: Arc<MessageBuffer>,
    pub store: Arc<TimeSeriesStore>,
    pub pool: Arc<ConnectionPool>,
    pub tokens: Arc<TokenUsageStore>,
    config: GatewayConfig,
    flush_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Build every component from `config` and connect the bus, but do not
    /// yet start receiving or flushing — call [`Gateway::start`] for that.
    pub async fn build(config: GatewayConfig) -> Result<Self> {
        let selected = platform::select(
            config.can.preferred_interface.as_deref(),
            config.can.channel.as_deref(),
            config.can.bitrate,
            config.can.allow_fallback,
        )?;

        let manager = Arc::new(ConnectionManager::new(
            platform::PlatformFamily::detect().capabilities_str(),
            &selected.interface,
        ));
        manager.connect(&selected.channel).await?;

        let pool = Arc::new(ConnectionPool::connect(&config.database_url, config.pool.clone()).await?);
        let store = Arc::new(TimeSeriesStore::new(pool.clone()));
        store.ensure_schema().await?;

        let tokens_pool = if config.token_usage_database_url == config.database_url {
            pool.clone()
        } else {
            Arc::new(ConnectionPool::connect(&config.token_usage_database_url, config.pool.clone()).await?)
        };
        let tokens = Arc::new(TokenUsageStore::new(tokens_pool));
        tokens.ensure_schema().await?;

        let buffer = Arc::new(MessageBuffer::new(config.buffer.clone()));
        manager
            .add_handler(Arc::new(BufferHandler {
                buffer: buffer.clone(),
                interface_id: selected.channel.clone(),
            }))
            .await;

        Ok(Self {
            manager,
            buffer,
            store,
            pool,
            tokens,
            config,
            flush_task: std::sync::Mutex::new(None),
        })
    }

    /// Start receiving frames, the pool's health monitor, and the periodic
    /// buffer-flush task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.manager.start_receiving().await?;
        self.pool.spawn_health_monitor();

        let gateway = self.clone();
        let interval = std::time::Duration::from_millis(self.config.buffer.flush_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if gateway.buffer.should_flush().await || !gateway.buffer.is_empty().await {
                    gateway.flush_once().await;
                }
            }
        });
        *self.flush_task.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Drain the buffer once and persist it, chunked per
    /// `buffer.max_batch_size`. A chunk that fails to write is requeued so
    /// the next tick retries it, per §4.6's write-path failure handling.
    async fn flush_once(&self) {
        let batch = self.buffer.take_batch().await;
        if batch.is_empty() {
            return;
        }

        for chunk in self.buffer.chunk(batch) {
            if let Err(e) = self.store.write_batch(&chunk).await {
                #[cfg(feature = "tracing-support")]
                tracing::error!(error = %e, count = chunk.len(), "batch write failed, requeuing");
                self.buffer.requeue(chunk).await;
            }
        }
    }

    /// Prune aged raw/decoded CAN records and token-usage records per the
    /// configured retention windows. A no-op for whichever window is unset.
    pub async fn run_retention(&self) -> Result<()> {
        if let Some(days) = self.config.retention.can_message_days {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(days as i64);
            self.store.prune_raw(cutoff).await?;
        }
        if let Some(days) = self.config.retention.token_usage_days {
            self.tokens.prune(days).await?;
        }
        Ok(())
    }

    /// Stop receiving, flush whatever remains, and close the pool(s).
    pub async fn shutdown(&self) {
        self.manager.stop_receiving().await;
        if let Some(handle) = self.flush_task.lock().unwrap().take() {
            handle.abort();
        }

        let remaining = self.buffer.shutdown().await;
        for chunk in self.buffer.chunk(remaining) {
            if let Err(e) = self.store.write_batch(&chunk).await {
                #[cfg(feature = "tracing-support")]
                tracing::error!(error = %e, "final flush on shutdown failed, messages lost");
                let _ = e;
            }
        }

        let _ = self.manager.disconnect().await;
        self.pool.shutdown().await;
    }
}

impl platform::PlatformFamily {
    fn capabilities_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
            Self::Unknown => "unknown",
        }
    }
}
