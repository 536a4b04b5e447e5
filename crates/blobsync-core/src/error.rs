//! Error types for blobsync-core

use thiserror::Error;

/// Errors related to identifiers
#[derive(Debug, Error)]
pub enum IdError {
    #[error("Invalid entity id format: {0}")]
    InvalidFormat(String),

    #[error("Invalid id length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Origin id must not be empty")]
    EmptyOrigin,
}
