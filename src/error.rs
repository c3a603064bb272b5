//! Custom error types for the load control library.
//!
//! This module defines `LoadError`, the single error type returned by the
//! protocol engine, the transport and the program scheduler. Using the
//! `thiserror` crate it keeps the failure taxonomy explicit:
//!
//! - **Fatal connection**: `Timeout`, `Io` and `Serial` mean the link is gone and
//!   the caller has to reconnect manually.
//! - **Handshake**: `WrongDevice` is raised after every identification attempt
//!   failed.
//! - **Validation**: `Range` and `UnsupportedMode` are raised synchronously at the
//!   point of a `set` call and never touch device state.
//! - **Protocol**: `Protocol` covers malformed text responses during discovery.
//!
//! CRC mismatches, device-reported errors and watchdog trips are deliberately
//! absent: those are handled internally and reported through [`crate::events`].

use crate::protocol::RunMode;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Errors returned synchronously by the library.
#[derive(Error, Debug)]
pub enum LoadError {
    /// A serial read or write did not finish in time. Fatal for the link.
    #[error("Serial {operation} timed out after {timeout:?}")]
    Timeout {
        /// `"read"` or `"write"`.
        operation: &'static str,
        /// Limit that was exceeded.
        timeout: Duration,
    },

    /// Low-level I/O failure on the link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened or configured.
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Every identification attempt got the wrong answer.
    #[error("Wrong device: no MightyWatt R3 answered on {port} after {attempts} attempt(s)")]
    WrongDevice {
        /// Port that was tried.
        port: String,
        /// Attempts made.
        attempts: u32,
    },

    /// The operation needs an open link.
    #[error("Load is not connected")]
    NotConnected,

    /// Set-point outside `0..=limit` for its mode.
    #[error("Set {mode} out of range: {value} (allowed 0 to {limit})")]
    Range {
        /// Requested mode.
        mode: RunMode,
        /// Rejected value.
        value: f64,
        /// Device limit for `mode`.
        limit: f64,
    },

    /// The mode is not valid in this context, e.g. a ramp in MPPT.
    #[error("Mode {0} cannot be used here")]
    UnsupportedMode(RunMode),

    /// The device answered with something unparseable.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration could not be read or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A background task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl LoadError {
    /// Whether this error means the serial link is unusable and a full
    /// disconnect is required.
    pub fn is_fatal_connection(&self) -> bool {
        matches!(
            self,
            LoadError::Timeout { .. } | LoadError::Io(_) | LoadError::Serial(_)
        )
    }

    /// Whether this error is a set-point validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, LoadError::Range { .. } | LoadError::UnsupportedMode(_))
    }
}

impl From<figment::Error> for LoadError {
    fn from(value: figment::Error) -> Self {
        LoadError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_io_are_fatal() {
        let timeout = LoadError::Timeout {
            operation: "read",
            timeout: Duration::from_millis(500),
        };
        assert!(timeout.is_fatal_connection());
        assert!(timeout.to_string().contains("read"));

        let io: LoadError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(io.is_fatal_connection());
    }

    #[test]
    fn range_is_validation_not_fatal() {
        let err = LoadError::Range {
            mode: RunMode::Current,
            value: 12.0,
            limit: 10.0,
        };
        assert!(err.is_validation());
        assert!(!err.is_fatal_connection());
        assert_eq!(
            err.to_string(),
            "Set current out of range: 12 (allowed 0 to 10)"
        );
    }

    #[test]
    fn wrong_device_mentions_port() {
        let err = LoadError::WrongDevice {
            port: "/dev/ttyACM0".into(),
            attempts: 2,
        };
        assert!(err.to_string().contains("/dev/ttyACM0"));
        assert!(!err.is_fatal_connection());
    }
}
