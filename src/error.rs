//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole node.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur while operating instruments, from serial
//! timeouts to an unreachable relay node.
//!
//! ## Error Hierarchy
//!
//! - **`TransportTimeout`**: A handshake or sample read exceeded its deadline.
//! - **`Protocol`**: The instrument answered, but with unexpected content.
//! - **`Configuration`**: Semantic configuration errors, such as invalid detector
//!   widths or ratios. These are caught at construction time.
//! - **`Config`**: Wraps errors from `figment` while loading the settings file.
//! - **`DispatchUnavailable`**: The relay node could not be woken, resolved or
//!   refused the message. It never leaves the dispatcher.
//! - **`Io`**: Wraps standard `std::io::Error`, covering serial, file and network I/O.
//!
//! Retry decisions inside the sampling cycle are made with
//! [`DaqError::is_retryable`]; nothing in this enum is fatal to the process.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {timeout_ms} ms during {operation}")]
    TransportTimeout {
        /// Step that timed out (e.g. "read_until", "attention").
        operation: &'static str,
        /// Deadline that was exceeded.
        timeout_ms: u64,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Instrument did not answer attention probe after {tries} tries")]
    AttentionFailed {
        /// Number of probes written.
        tries: u32,
    },

    #[error("Power control error: {0}")]
    Power(String),

    #[error("Sample parse error: {0}")]
    Parse(String),

    #[error("Relay unavailable: {0}")]
    DispatchUnavailable(String),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Whether a sampling attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DaqError::TransportTimeout { .. }
                | DaqError::Protocol(_)
                | DaqError::AttentionFailed { .. }
                | DaqError::Io(_)
                | DaqError::Power(_)
        )
    }

    pub(crate) fn timeout(operation: &'static str, timeout: std::time::Duration) -> Self {
        DaqError::TransportTimeout {
            operation,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}
