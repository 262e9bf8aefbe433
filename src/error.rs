//! Error types for the tile storage core

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tile storage core
#[derive(Error, Debug)]
pub enum Error {
    /// Caller supplied an argument outside the accepted domain
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Named entity (policy, layer, tile set) is not registered
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration rejected at validation time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metadata and blob store disagree, or a backend reported an inconsistency
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Locking Errors
    // =========================================================================
    /// Lock could not be obtained before the configured timeout
    #[error("Timed out after {waited:?} waiting for lock on key '{key}'")]
    LockTimeout { key: String, waited: Duration },

    /// Lock wait was interrupted by a cancellation request
    #[error("Interrupted while waiting for lock on key '{key}'")]
    LockInterrupted { key: String },

    // =========================================================================
    // Expiration Errors
    // =========================================================================
    /// Sweep or background task was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// True for the errors callers may treat as "could not lock" rather than a hard failure
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, Error::LockTimeout { .. } | Error::LockInterrupted { .. })
    }
}
