//! Error types for the capture pipeline.
//!
//! Most failures in a running stream are recoverable and only ever reach the
//! log: transfer errors, buffer overflow/underflow and disconnects are stream
//! events, not errors. `UvcError` covers what a caller can actually observe:
//! a device that never showed up, a driver call that failed, bad arguments
//! and bad configuration.

use std::time::Duration;

use thiserror::Error;

use crate::capture::StreamHandle;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, UvcError>;

#[derive(Error, Debug)]
pub enum UvcError {
    /// No device could be opened within the open timeout. Retried by the session.
    #[error("timed out after {0:?} waiting for a UVC device")]
    OpenTimeout(Duration),

    #[error("no capture device found at {0}")]
    DeviceNotFound(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller error, surfaced synchronously and never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unknown stream {0}")]
    UnknownStream(StreamHandle),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl UvcError {
    /// Whether the session should keep retrying after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            UvcError::InvalidArgument(_) | UvcError::Config(_) | UvcError::InvalidConfig(_)
        )
    }
}
