//! Error types for the agricultural field-bus gateway.

use thiserror::Error;

/// A specialized Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// The main error type for all gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    // === Platform / selector errors (C1) ===
    /// No usable bus interface on this platform and no fallback allowed.
    #[error("no usable CAN interface on this platform: {0}")]
    InterfaceUnavailable(String),

    // === Bus driver errors (C2) ===
    /// Failed to open the bus channel.
    #[error("CAN connect error: {0}")]
    ConnectError(String),

    /// Failed to transmit a frame.
    #[error("CAN send error: {0}")]
    SendError(String),

    /// Failed to receive a frame.
    #[error("CAN receive error: {0}")]
    ReceiveError(String),

    /// Not connected to any bus.
    #[error("not connected to CAN bus")]
    NotConnected,

    // === Codec errors (C3) ===
    /// PGN has no entry in the spec table.
    #[error("unknown PGN: {0}")]
    UnknownPgn(u32),

    /// SPN value (decoded or to be encoded) falls outside its valid range.
    #[error("SPN {spn} ({name}) value {value} out of range [{min}, {max}]")]
    SpnOutOfRange {
        spn: u32,
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Frame payload is shorter than an SPN's byte_offset + length requires.
    #[error("payload too short: need {needed} bytes, got {got}")]
    PayloadTooShort { needed: usize, got: usize },

    // === Pool errors (C7) ===
    /// The pool has no free connections and none were released before `pool_timeout`.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Acquisition timed out waiting for a connection.
    #[error("connection pool acquire timed out after {0}ms")]
    PoolTimeout(u64),

    /// The pool's health monitor has marked it unhealthy.
    #[error("connection pool is unhealthy")]
    PoolUnhealthy,

    // === Store errors (C6) ===
    /// A batch write failed and must be retried.
    #[error("batch write failed: {0}")]
    BatchWriteError(String),

    // === Validation ===
    /// Caller-supplied input failed validation.
    #[error("validation error: {0}")]
    ValidationError(String),

    // === Configuration ===
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    // === IO / database ===
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database driver error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Internal error (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether a receive-loop failure of this kind should trigger a reconnect.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectError(_) | Self::ReceiveError(_) | Self::NotConnected | Self::Io(_)
        )
    }

    /// Whether this error is worth retrying without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ReceiveError(_)
                | Self::SendError(_)
                | Self::PoolTimeout(_)
                | Self::BatchWriteError(_)
        )
    }

    /// Construct a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Construct a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Construct an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_reconnect() {
        assert!(GatewayError::NotConnected.needs_reconnect());
        assert!(GatewayError::ConnectError("x".into()).needs_reconnect());
        assert!(!GatewayError::UnknownPgn(1).needs_reconnect());
    }

    #[test]
    fn test_is_retryable() {
        assert!(GatewayError::PoolTimeout(100).is_retryable());
        assert!(!GatewayError::PoolExhausted.is_retryable());
    }
}
