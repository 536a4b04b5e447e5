//! Error types for blobsync-bus

use thiserror::Error;

/// Errors that can occur on the replication bus
#[derive(Debug, Error)]
pub enum BusError {
    /// Failed to subscribe to the channel
    #[error("failed to subscribe to channel: {0}")]
    SubscribeFailed(String),

    /// Failed to publish a message
    #[error("failed to publish message: {0}")]
    PublishFailed(String),

    /// Failed to encode message
    #[error("failed to encode message: {0}")]
    EncodeFailed(String),

    /// Failed to decode message
    #[error("failed to decode message: {0}")]
    DecodeFailed(String),

    /// A listener is already running for this bus
    #[error("already subscribed to channel")]
    AlreadySubscribed,

    /// Receiver fell behind and messages were dropped
    #[error("receiver lagged, {0} messages dropped")]
    Lagged(u64),

    /// Channel closed
    #[error("channel closed")]
    ChannelClosed,

    /// The network endpoint could not be bound
    #[error("failed to bind endpoint: {0}")]
    Bind(String),

    /// A bootstrap peer id is malformed
    #[error("invalid peer id {0}")]
    InvalidPeer(String),

    /// The endpoint key could not be loaded or stored
    #[error("endpoint key error: {0}")]
    Key(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::DecodeFailed(e.to_string())
    }
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;
