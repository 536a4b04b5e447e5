//! Error types for subscriber setup

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while installing the global subscriber
#[derive(Debug, Error)]
pub enum LogError {
    /// A level or filter directive could not be parsed
    #[error("invalid filter directive {directive:?}: {reason}")]
    InvalidDirective { directive: String, reason: String },

    /// The log directory or file could not be created
    #[error("failed to open log output at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The rolling appender rejected its configuration
    #[error("rolling appender error: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    /// A global subscriber was already installed
    #[error("subscriber already initialized: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Result type for logging setup
pub type LogResult<T> = Result<T, LogError>;
