//! Error types for the bridge.
//!
//! The bridge distinguishes four failure classes:
//!
//! - **Transient I/O** (socket reset, timeout, broker loss): recovered
//!   internally by the transport and publisher with fixed backoff and never
//!   surfaced through this type.
//! - **Malformed frames**: handled by decoder resynchronization, counted
//!   and logged, never propagated.
//! - **Expired telemetry**: a designed-for outcome, not an error at all.
//! - **Fatal misconfiguration**: the only startup-time hard failure, and
//!   the main thing [`BridgeError`] exists to report.
//!
//! ```rust
//! use jkbridge::BridgeError;
//!
//! let error = BridgeError::config_error("tcp transport selected but no host configured");
//! assert!(!error.is_retryable());
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Main error type for bridge operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("transport failure: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("broker failure: {reason}")]
    Broker {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },
}

impl BridgeError {
    /// Returns whether this error is potentially recoverable through retry.
    ///
    /// Configuration errors are local mistakes no amount of backoff can fix;
    /// everything else on the wire is expected to resolve externally
    /// (gateway reboot, broker restart) and is retried forever by the
    /// owning component.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Config { .. } => false,
            BridgeError::Transport { .. } => true,
            BridgeError::Broker { .. } => true,
            BridgeError::Timeout { .. } => true,
        }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(reason: impl Into<String>) -> Self {
        BridgeError::Config { reason: reason.into() }
    }

    /// Helper constructor for transport errors.
    pub fn transport_failed(reason: impl Into<String>) -> Self {
        BridgeError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport errors with source.
    pub fn transport_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        BridgeError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for broker errors.
    pub fn broker_failed(reason: impl Into<String>) -> Self {
        BridgeError::Broker { reason: reason.into(), source: None }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Transport { reason: err.to_string(), source: Some(Box::new(err)) }
    }
}

impl From<tokio_serial::Error> for BridgeError {
    fn from(err: tokio_serial::Error) -> Self {
        BridgeError::Transport { reason: err.to_string(), source: Some(Box::new(err)) }
    }
}
