//! Error types shared by every beamline crate.
//!
//! `BeamlineError` is the single domain error. Capability traits and plans
//! return `anyhow::Result` and attach context; code that needs to branch on
//! the failure kind (registry lookups, connection waits, metadata storage)
//! uses `BeamlineError` directly or downcasts from `anyhow::Error`.
//!
//! ## Error Taxonomy
//!
//! - **`Configuration`**: a required parameter is missing or malformed
//!   (for example a ranged motor factory without a prefix template).
//!   Fatal, raised at definition time.
//! - **`Lookup` / `Ambiguous`**: a named or labelled device is absent, or a
//!   label matched more than one device where exactly one was required.
//!   Fatal unless the caller uses an absent-allowed query.
//! - **`DuplicateName`**: registering a second device under an existing name.
//! - **`UnknownDeviceType`**: a devices file names a type with no factory.
//! - **`ConnectionTimeout` / `Disconnected`**: the control link to a PV was
//!   never established within the configured timeout, or dropped.
//! - **`Storage`**: the metadata backing store is unavailable. Recovered by
//!   the orchestrator binder, which continues without persistence.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the domain error type.
pub type AppResult<T> = std::result::Result<T, BeamlineError>;

/// Primary error type for beamline instrument control.
#[derive(Error, Debug)]
pub enum BeamlineError {
    /// A required configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No registered device matches the requested name or label.
    #[error("No device registered under '{0}'")]
    Lookup(String),

    /// A label lookup matched several devices where one was required.
    #[error("'{key}' matches {count} devices: {names:?}")]
    Ambiguous {
        key: String,
        count: usize,
        names: Vec<String>,
    },

    /// A device with the same name is already registered.
    #[error("Device name '{0}' is already registered")]
    DuplicateName(String),

    /// A devices file referenced a type with no registered factory.
    #[error("Unknown device type '{0}'")]
    UnknownDeviceType(String),

    /// A connection wait exceeded the configured timeout.
    #[error("Timed out after {timeout:?} waiting for '{name}' to connect")]
    ConnectionTimeout { name: String, timeout: Duration },

    /// The control channel for a PV is not available.
    #[error("PV '{0}' is not connected")]
    Disconnected(String),

    /// Attempted to write through a signal that has no setpoint PV.
    #[error("Signal '{0}' is read-only")]
    ReadOnly(String),

    /// A value had a different type than the operation expected.
    #[error("Type mismatch for '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: String,
    },

    /// Metadata or catalog persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Underlying file system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BeamlineError {
    /// Whether this error is a lookup miss (absent device).
    pub fn is_lookup(&self) -> bool {
        matches!(self, BeamlineError::Lookup(_))
    }

    /// Whether this error came from a connection wait.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BeamlineError::ConnectionTimeout { .. } | BeamlineError::Disconnected(_)
        )
    }
}

impl From<figment::Error> for BeamlineError {
    fn from(err: figment::Error) -> Self {
        BeamlineError::Configuration(err.to_string())
    }
}
