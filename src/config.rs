//! Typed configuration for the gateway.
//!
//! Replaces the loosely-typed dictionary configuration the original
//! implementation passed around: every recognized option is a named field
//! here, defaulted, and optionally overridden by a TOML file plus a fixed
//! set of environment variables (database URLs only — everything else is
//! structural and belongs in the checked-in file).

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub can: CanConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Resolved at load time from `AFS_DATABASE_URL`/`DATABASE_URL`, falling
    /// back to `AFS_SQLITE_URL`/`SQLITE_URL`. Not read directly from TOML.
    #[serde(skip)]
    pub database_url: String,

    /// Resolved at load time from `TOKEN_USAGE_DATABASE_URL`, falling back to
    /// `database_url`.
    #[serde(skip)]
    pub token_usage_database_url: String,
}

/// CAN transport configuration (C1/C2).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CanConfig {
    /// Caller-preferred interface name (e.g. "socketcan", "virtual").
    pub preferred_interface: Option<String>,
    /// Caller-preferred channel name (e.g. "can0", "vcan0").
    pub channel: Option<String>,
    /// Bus bitrate in bits per second.
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Whether the selector may fall back to the virtual bus.
    #[serde(default = "default_true")]
    pub allow_fallback: bool,
}

fn default_bitrate() -> u32 {
    500_000
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            preferred_interface: None,
            channel: None,
            bitrate: default_bitrate(),
            allow_fallback: true,
        }
    }
}

/// Connection pool + health monitor configuration (C7).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_pool_timeout_ms")]
    pub pool_timeout_ms: u64,
    #[serde(default = "default_pool_recycle_secs")]
    pub pool_recycle_secs: u64,
    #[serde(default = "default_true")]
    pub pool_pre_ping: bool,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_max_connections() -> u32 {
    50
}
fn default_min_connections() -> u32 {
    5
}
fn default_pool_timeout_ms() -> u64 {
    30_000
}
fn default_pool_recycle_secs() -> u64 {
    3_600
}
fn default_health_check_interval_secs() -> u64 {
    60
}
fn default_connection_timeout_ms() -> u64 {
    5_000
}
fn default_retry_attempts() -> u32 {
    3
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            pool_timeout_ms: default_pool_timeout_ms(),
            pool_recycle_secs: default_pool_recycle_secs(),
            pool_pre_ping: true,
            health_check_interval_secs: default_health_check_interval_secs(),
            connection_timeout_ms: default_connection_timeout_ms(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

/// Message buffer configuration (C5).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    /// Flush trigger: batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Shed threshold: buffer size at which new messages are dropped.
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
    /// Largest single chunk handed to the store in one insert round-trip.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Periodic flush tick, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_batch_size() -> usize {
    500
}
fn default_max_buffer() -> usize {
    default_batch_size() * 10
}
fn default_max_batch_size() -> usize {
    1_000
}
fn default_flush_interval_ms() -> u64 {
    1_000
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_buffer: default_max_buffer(),
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Retention/pruning configuration (C6/C8).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Days of raw+decoded CAN records to keep. `None` disables pruning.
    pub can_message_days: Option<u32>,
    /// Days of token-usage records to keep. `None` disables pruning.
    pub token_usage_days: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            can: CanConfig::default(),
            pool: PoolConfig::default(),
            buffer: BufferConfig::default(),
            retention: RetentionConfig::default(),
            database_url: "sqlite::memory:".to_string(),
            token_usage_database_url: "sqlite::memory:".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    #[cfg(feature = "cli")]
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string, then apply environment overrides.
    #[cfg(feature = "cli")]
    pub fn parse(s: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(s).map_err(|e| GatewayError::config(e.to_string()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Build a default configuration with only environment overrides applied.
    ///
    /// Used when no TOML file is present; matches the donor CLI's behavior of
    /// running headless off defaults when no config file exists.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(url) = env_first(&["AFS_DATABASE_URL", "DATABASE_URL"])
            .or_else(|| env_first(&["AFS_SQLITE_URL", "SQLITE_URL"]))
        {
            self.database_url = url;
        }

        self.token_usage_database_url = env_first(&["TOKEN_USAGE_DATABASE_URL"])
            .unwrap_or_else(|| self.database_url.clone());
    }
}

fn env_first(names: &[&str]) -> Option<String> {
    names.iter().find_map(|n| std::env::var(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.pool.max_connections, 50);
        assert_eq!(config.buffer.batch_size, 500);
        assert_eq!(config.buffer.max_buffer, 5_000);
    }

    #[test]
    #[cfg(feature = "cli")]
    fn test_parse_gateway_config() {
        let toml_str = r#"
[can]
preferred_interface = "socketcan"
channel = "can0"

[pool]
max_connections = 10

[buffer]
batch_size = 100
"#;
        let config = GatewayConfig::parse(toml_str).unwrap();
        assert_eq!(config.can.preferred_interface.as_deref(), Some("socketcan"));
        assert_eq!(config.pool.max_connections, 10);
        assert_eq!(config.buffer.batch_size, 100);
    }

    #[test]
    fn test_env_override_database_url() {
        std::env::set_var("AFS_DATABASE_URL", "postgres://test/test_env_override");
        let config = GatewayConfig::from_env();
        std::env::remove_var("AFS_DATABASE_URL");
        assert_eq!(config.database_url, "postgres://test/test_env_override");
    }
}
