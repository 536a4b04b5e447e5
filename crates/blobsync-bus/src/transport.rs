//! Transport seam for the replication bus
//!
//! The bus client's connection management lives behind [`BusTransport`];
//! the replication layer only needs channel-addressed publish and a
//! subscription stream of raw payloads.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BusResult;

/// Channel-addressed pub/sub transport
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Publish a raw payload to every current subscriber of `channel`
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()>;

    /// Open a subscription to `channel`
    async fn subscribe(&self, channel: &str) -> BusResult<Box<dyn BusSubscription>>;
}

/// Stream of raw payloads from one channel
#[async_trait]
pub trait BusSubscription: Send {
    /// Receive the next payload
    ///
    /// Returns `None` when the subscription is closed. An `Err` is not
    /// terminal; the caller may keep receiving.
    async fn recv(&mut self) -> Option<BusResult<Bytes>>;
}
