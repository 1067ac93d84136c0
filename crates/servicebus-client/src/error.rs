//! Error types for client operations.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a connection could not be established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// The connection string could not be parsed
    InvalidConnectionString,
    /// The endpoint could not be reached
    Unreachable,
    /// The broker rejected the credentials
    Unauthorized,
    /// Certificate validation or TLS negotiation failed
    Tls,
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConnectionString => write!(f, "invalid connection string"),
            Self::Unreachable => write!(f, "endpoint unreachable"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Tls => write!(f, "TLS failure"),
        }
    }
}

/// Comprehensive error type for all client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed ({reason}): {message}")]
    ConnectionFailed {
        reason: ConnectionFailure,
        message: String,
    },

    #[error("Operation on closed {resource}")]
    Closed { resource: String },

    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Batch of {size} bytes exceeds broker limit of {max_size} bytes; messages at {rejected_indices:?} do not fit")]
    BatchTooLarge {
        size: usize,
        max_size: usize,
        rejected_indices: Vec<usize>,
    },

    #[error("Send to '{entity}' rejected: {reason}")]
    SendFailed {
        entity: String,
        message_index: Option<usize>,
        reason: String,
    },

    #[error("Receive from '{entity}' failed: {message}")]
    ReceiveFailed { entity: String, message: String },

    #[error("Lock lost or already settled for token {lock_token}")]
    LockLost { lock_token: String },

    #[error("Settlement of token {lock_token} failed: {message}")]
    SettleFailed { lock_token: String, message: String },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl ClientError {
    /// Check if the caller may retry the failed operation as-is
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed { reason, .. } => *reason == ConnectionFailure::Unreachable,
            Self::Closed { .. } => false,
            Self::Timeout { .. } => true,
            Self::MessageTooLarge { .. } => false,
            Self::BatchTooLarge { .. } => false,
            Self::SendFailed { .. } => false,
            Self::ReceiveFailed { .. } => true,
            Self::LockLost { .. } => false,
            Self::SettleFailed { .. } => true,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::ConnectionFailed {
                reason: ConnectionFailure::Unreachable,
                ..
            } => Some(Duration::from_secs(5)),
            Self::ReceiveFailed { .. } | Self::SettleFailed { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    pub(crate) fn closed(resource: impl Into<String>) -> Self {
        Self::Closed {
            resource: resource.into(),
        }
    }
}

/// Errors during envelope encoding/decoding
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Property '{key}' is not a finite number")]
    NonFiniteProperty { key: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::Parsing {
            message: err.to_string(),
        }
    }
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
