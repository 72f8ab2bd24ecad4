//! Error types for the sidecar
//!
//! A single error enum covers every subsystem. Callers mostly care about
//! one distinction: validation failures are rejected at the boundary and
//! reported verbatim, everything else is logged and retried or degraded.

use thiserror::Error;

/// Result type for sidecar operations
pub type Result<T> = std::result::Result<T, SidecarError>;

/// Errors that can occur in the sidecar
#[derive(Debug, Error)]
pub enum SidecarError {
    /// Shared key-value store failure
    #[error("Store error: {message}")]
    Store { message: String },

    /// Carrier directory (database) failure
    #[error("Directory error: {message}")]
    Directory { message: String },

    /// SIP transport failure (no final response was received)
    #[error("SIP transport error: {message}")]
    Sip { message: String },

    /// DNS resolution failure
    #[error("DNS error: {message}")]
    Dns { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Invalid IP address supplied to a drain operation
    #[error("Invalid IP address: {0}")]
    InvalidIp(String),

    /// Invalid from-domain or SIP realm supplied to a regbot
    #[error("Invalid from_domain {0}")]
    InvalidDomain(String),

    /// Malformed control command
    #[error("Invalid command: {message}")]
    InvalidCommand { message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation timed out
    #[error("Operation timed out after {millis} ms")]
    Timeout { millis: u64 },

    /// The runtime configuration queue is no longer running
    #[error("Runtime configuration queue closed")]
    QueueClosed,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SidecarError {
    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a directory error
    pub fn directory(message: impl Into<String>) -> Self {
        Self::Directory {
            message: message.into(),
        }
    }

    /// Create a SIP transport error
    pub fn sip(message: impl Into<String>) -> Self {
        Self::Sip {
            message: message.into(),
        }
    }

    /// Create a DNS error
    pub fn dns(message: impl Into<String>) -> Self {
        Self::Dns {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid command error
    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::InvalidCommand {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for errors caused by bad input rather than by infrastructure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidIp(_) | Self::InvalidDomain(_) | Self::InvalidCommand { .. }
        )
    }
}

impl From<config::ConfigError> for SidecarError {
    fn from(err: config::ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for SidecarError {
    fn from(err: redis::RedisError) -> Self {
        Self::store(err.to_string())
    }
}

#[cfg(feature = "mysql")]
impl From<sqlx::Error> for SidecarError {
    fn from(err: sqlx::Error) -> Self {
        Self::directory(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_classified() {
        assert!(SidecarError::InvalidIp("10.0.0".into()).is_validation());
        assert!(SidecarError::invalid_command("missing key").is_validation());
        assert!(!SidecarError::store("connection refused").is_validation());
        assert!(!SidecarError::QueueClosed.is_validation());
    }

    #[test]
    fn invalid_ip_message_names_the_address() {
        let err = SidecarError::InvalidIp("999.1.1.1".into());
        assert_eq!(err.to_string(), "Invalid IP address: 999.1.1.1");
    }
}
