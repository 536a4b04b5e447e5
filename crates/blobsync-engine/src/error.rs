//! Error types for the sync engine

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the sync engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] blobsync_storage::StorageError),

    /// Bus error
    #[error("Bus error: {0}")]
    Bus(#[from] blobsync_bus::BusError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Blob could not be decoded into owner state
    #[error("Decode error: {0}")]
    Decode(String),

    /// Owner state could not be encoded into a blob
    #[error("Encode error: {0}")]
    Encode(String),

    /// The I/O worker pool could not be started
    #[error("Failed to start I/O workers: {0}")]
    IoPool(#[source] std::io::Error),

    /// Engine is shutting down and no longer accepts attachments
    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read or written
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Config could not be rendered as TOML
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    /// Cleanup pattern is not a valid regular expression
    #[error("invalid cleanup pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type alias for engine operations
pub type SyncResult<T> = Result<T, SyncError>;
