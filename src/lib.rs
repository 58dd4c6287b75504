//! # agfield-gw
//!
//! An agricultural field-bus ingestion and telemetry gateway: reads
//! SAE J1939/ISOBUS traffic off a CAN bus (real hardware or an in-process
//! virtual loopback), decodes it against a PGN/SPN table, buffers it, and
//! persists it to a time-series store behind a health-monitored connection
//! pool. A companion token-usage store tracks resource consumption for
//! whatever agent/task framework sits above this gateway.
//!
//! ## Layout
//!
//! | Component | Module | Role |
//! |---|---|---|
//! | C1 | [`platform`] | Platform/interface selection |
//! | C2 | [`hal`] | Bus driver / hardware abstraction |
//! | C3 | [`j1939`] | PGN/SPN codec |
//! | C4 | [`manager`] | Connection manager, receive loop, handler dispatch |
//! | C5 | [`buffer`] | In-memory message buffer |
//! | C6 | [`store`] | Time-series store |
//! | C7 | [`pool`] | Connection pool + health monitor |
//! | C8 | [`tokens`] | Token-usage store |
//!
//! [`gateway::Gateway`] is the composition root wiring all eight together.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use agfield_gw::prelude::*;
//!
//! let config = GatewayConfig::from_env();
//! let gateway = std::sync::Arc::new(Gateway::build(config).await?);
//! gateway.start().await?;
//! tokio::signal::ctrl_c().await?;
//! gateway.shutdown().await;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod buffer;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hal;
pub mod j1939;
pub mod manager;
pub mod platform;
pub mod pool;
pub mod store;
pub mod tokens;

/// Convenient imports for embedding the gateway in another binary.
pub mod prelude {
    pub use crate::buffer::{BufferedMessage, MessageBuffer};
    pub use crate::config::{BufferConfig, CanConfig, GatewayConfig, PoolConfig, RetentionConfig};
    pub use crate::error::{GatewayError, Result};
    pub use crate::gateway::Gateway;
    pub use crate::hal::{BusDriver, CanFrame};
    pub use crate::j1939::{decode, encode, DecodedMessage};
    pub use crate::manager::{ConnectionManager, InboundMessage, MessageHandler};
    pub use crate::pool::{ConnectionPool, HealthStatus, PoolStatus};
    pub use crate::store::{RangeQuery, TimeSeriesStore};
    pub use crate::tokens::{TokenUsageQuery, TokenUsageStore};
}

pub use crate::error::{GatewayError, Result};
pub use crate::gateway::Gateway;
