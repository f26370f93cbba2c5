//! Unified error handling for mqtail
//!
//! Per-record problems (send failures, overflows, pool exhaustion) are
//! handled locally in the pipeline with logging and counters; only
//! structural failures surface through [`MqtailError`] and terminate
//! the daemon.

use thiserror::Error;

/// Main error type for mqtail operations
#[derive(Debug, Error)]
pub enum MqtailError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pool/arena allocation errors at startup
    #[error("Memory error: {0}")]
    Memory(String),

    /// Backend-specific errors
    #[error("Backend '{backend}' error: {message}")]
    Backend { backend: String, message: String },

    /// Worker thread could not be spawned
    #[error("Cannot spawn worker thread: {0}")]
    Spawn(String),

    /// Every worker slot has exceeded its restart budget
    #[error("All worker threads abandoned")]
    WorkersExhausted,
}

/// Convenience type alias for Results using MqtailError
pub type MqtailResult<T> = std::result::Result<T, MqtailError>;

/// Short alias, equivalent to `MqtailResult<T>`
pub type Result<T> = MqtailResult<T>;

impl From<serde_yaml::Error> for MqtailError {
    fn from(err: serde_yaml::Error) -> Self {
        MqtailError::Config(format!("YAML parse error: {}", err))
    }
}

// Helper methods
impl MqtailError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        MqtailError::Config(msg.into())
    }

    /// Create a memory error with a custom message
    pub fn memory<S: Into<String>>(msg: S) -> Self {
        MqtailError::Memory(msg.into())
    }

    /// Create a backend error with backend name and message
    pub fn backend<S: Into<String>, T: Into<String>>(backend: S, message: T) -> Self {
        MqtailError::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }
}
