//! In-process transport
//!
//! One `tokio::sync::broadcast` sender per channel. Every bus created on the
//! same [`MemoryTransport`] sees every other bus's publications, including
//! its own, which is what makes self-echo suppression observable in tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::trace;

use crate::error::{BusError, BusResult};
use crate::transport::{BusSubscription, BusTransport};

/// Default per-channel buffer
const DEFAULT_CAPACITY: usize = 1024;

/// In-memory pub/sub hub
#[derive(Debug)]
pub struct MemoryTransport {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
    failing: AtomicBool,
    published: AtomicU64,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a hub whose channels buffer `capacity` messages per receiver
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            failing: AtomicBool::new(false),
            published: AtomicU64::new(0),
        }
    }

    /// Make every publish fail (simulates an unreachable broker)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of payloads accepted for publication
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Number of live receivers on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl BusTransport for MemoryTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::PublishFailed("transport unavailable".into()));
        }

        self.published.fetch_add(1, Ordering::SeqCst);
        // No receivers is not an error: nobody is listening yet
        if self.sender(channel).send(payload).is_err() {
            trace!(channel, "Published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BusResult<Box<dyn BusSubscription>> {
        Ok(Box::new(MemorySubscription {
            rx: self.sender(channel).subscribe(),
        }))
    }
}

/// Receiver half of a [`MemoryTransport`] channel
pub struct MemorySubscription {
    rx: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn recv(&mut self) -> Option<BusResult<Bytes>> {
        match self.rx.recv().await {
            Ok(payload) => Some(Ok(payload)),
            Err(RecvError::Lagged(skipped)) => Some(Err(BusError::Lagged(skipped))),
            Err(RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out() {
        let hub = MemoryTransport::new();
        let mut a = hub.subscribe("chan").await.unwrap();
        let mut b = hub.subscribe("chan").await.unwrap();
        let mut other = hub.subscribe("other").await.unwrap();

        hub.publish("chan", Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap().unwrap(), "hello");
        assert_eq!(hub.subscriber_count("chan"), 2);

        hub.publish("other", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(other.recv().await.unwrap().unwrap(), "x");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = MemoryTransport::new();
        hub.publish("empty", Bytes::from_static(b"lost")).await.unwrap();
        assert_eq!(hub.published_count(), 1);
    }

    #[tokio::test]
    async fn test_lag_is_reported_not_fatal() {
        let hub = MemoryTransport::with_capacity(2);
        let mut rx = hub.subscribe("chan").await.unwrap();

        for i in 0..5u8 {
            hub.publish("chan", Bytes::from(vec![i])).await.unwrap();
        }

        assert!(matches!(rx.recv().await, Some(Err(BusError::Lagged(_)))));
        // Still usable afterwards
        assert!(matches!(rx.recv().await, Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_failing_transport() {
        let hub = MemoryTransport::new();
        hub.set_failing(true);
        assert!(matches!(
            hub.publish("chan", Bytes::new()).await,
            Err(BusError::PublishFailed(_))
        ));
        assert_eq!(hub.published_count(), 0);
    }
}
