//! Replication bus client
//!
//! One [`ReplicationBus`] per process. It publishes state changes tagged with
//! this process's [`OriginId`] and runs at most one listener task that decodes
//! inbound payloads, drops the ones this process sent, and hands the rest to
//! a caller-supplied handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use blobsync_core::{EntityId, OriginId};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{BusError, BusResult};
use crate::message::SyncMessage;
use crate::transport::{BusSubscription, BusTransport};

/// Default channel name shared by all processes
pub const DEFAULT_CHANNEL: &str = "blobsync:sync";

/// How long `close` waits for the listener before aborting it
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Counters for bus activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Messages handed to the transport successfully
    pub published: u64,
    /// Publish attempts that failed
    pub publish_failures: u64,
    /// Foreign messages delivered to the handler
    pub delivered: u64,
    /// Messages carrying our own origin, dropped
    pub own_dropped: u64,
    /// Payloads that could not be decoded, dropped
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    delivered: AtomicU64,
    own_dropped: AtomicU64,
    malformed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            own_dropped: self.own_dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the bus handle and its listener task
#[derive(Debug)]
struct Shared {
    origin: OriginId,
    counters: Counters,
}

impl Shared {
    fn is_own(&self, message: &SyncMessage) -> bool {
        message.origin_id == self.origin
    }
}

/// Publish/subscribe client bound to one channel and one origin
pub struct ReplicationBus {
    transport: Arc<dyn BusTransport>,
    channel: String,
    shared: Arc<Shared>,
    /// Set once a listener has been requested
    subscribed: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    close_timeout: Duration,
}

impl ReplicationBus {
    /// Create a bus on `channel` with a fresh random origin
    pub fn new(transport: Arc<dyn BusTransport>, channel: impl Into<String>) -> Self {
        Self::with_origin(transport, channel, OriginId::generate())
    }

    /// Create a bus with an explicit origin
    pub fn with_origin(
        transport: Arc<dyn BusTransport>,
        channel: impl Into<String>,
        origin: OriginId,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            transport,
            channel: channel.into(),
            shared: Arc::new(Shared {
                origin,
                counters: Counters::default(),
            }),
            subscribed: AtomicBool::new(false),
            listener: Mutex::new(None),
            shutdown_tx,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Set how long `close` waits for the listener to stop
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// This process's origin tag
    pub fn origin(&self) -> &OriginId {
        &self.shared.origin
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether a message was published by this process
    ///
    /// The listener drops these before they reach the handler.
    pub fn is_own(&self, message: &SyncMessage) -> bool {
        self.shared.is_own(message)
    }

    /// Whether the listener has been started
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BusStats {
        self.shared.counters.snapshot()
    }

    /// Publish a state change, reporting failure to the caller
    #[instrument(skip(self, blob), fields(entity = %entity_id.short(), len = blob.len()))]
    pub async fn try_publish(
        &self,
        entity_id: EntityId,
        blob: &[u8],
        updated_at: i64,
    ) -> BusResult<()> {
        let message = SyncMessage::new(entity_id, blob.to_vec(), updated_at, self.origin().clone());
        let payload = message.encode()?;

        match self.transport.publish(&self.channel, payload).await {
            Ok(()) => {
                Counters::bump(&self.shared.counters.published);
                trace!(updated_at, "Published state change");
                Ok(())
            }
            Err(e) => {
                Counters::bump(&self.shared.counters.publish_failures);
                Err(e)
            }
        }
    }

    /// Publish a state change; failures are logged and swallowed
    pub async fn publish(&self, entity_id: EntityId, blob: &[u8], updated_at: i64) {
        if let Err(e) = self.try_publish(entity_id, blob, updated_at).await {
            warn!(entity = %entity_id.short(), error = %e, "Publish failed");
        }
    }

    /// Start the listener task
    ///
    /// `handler` runs on the listener task for every decoded message whose
    /// origin differs from ours. It must not block. Only one listener may
    /// exist per bus; a second call returns [`BusError::AlreadySubscribed`].
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self, handler), fields(channel = %self.channel))]
    pub async fn subscribe<F>(&self, handler: F) -> BusResult<()>
    where
        F: Fn(SyncMessage) + Send + Sync + 'static,
    {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadySubscribed);
        }

        let subscription = match self.transport.subscribe(&self.channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.subscribed.store(false, Ordering::SeqCst);
                return Err(BusError::SubscribeFailed(e.to_string()));
            }
        };

        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_listener(
            subscription,
            self.shared.clone(),
            handler,
            shutdown_rx,
        ));

        *self.listener.lock() = Some(handle);
        info!(origin = %self.shared.origin, "Subscribed to replication channel");
        Ok(())
    }

    /// Stop the listener
    ///
    /// Waits up to the close timeout for the listener to exit, then aborts it.
    /// Safe to call more than once.
    #[instrument(skip(self), fields(channel = %self.channel))]
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());

        let handle = self.listener.lock().take();
        let Some(handle) = handle else {
            return;
        };

        let abort = handle.abort_handle();
        match tokio::time::timeout(self.close_timeout, handle).await {
            Ok(Ok(())) => debug!("Listener stopped"),
            Ok(Err(e)) => warn!(error = %e, "Listener task failed"),
            Err(_) => {
                warn!("Listener did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for ReplicationBus {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_listener<F>(
    mut subscription: Box<dyn BusSubscription>,
    shared: Arc<Shared>,
    handler: F,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    F: Fn(SyncMessage) + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Listener shutting down");
                break;
            }
            next = subscription.recv() => {
                match next {
                    Some(Ok(payload)) => {
                        let message = match SyncMessage::decode(&payload) {
                            Ok(message) => message,
                            Err(e) => {
                                // Log and skip invalid messages
                                Counters::bump(&shared.counters.malformed);
                                warn!(error = %e, "Dropping malformed sync message");
                                continue;
                            }
                        };

                        if shared.is_own(&message) {
                            Counters::bump(&shared.counters.own_dropped);
                            trace!(entity = %message.entity_id.short(), "Ignoring own message");
                            continue;
                        }

                        Counters::bump(&shared.counters.delivered);
                        handler(message);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Subscription error");
                    }
                    None => {
                        info!("Subscription closed");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use tokio::sync::mpsc;

    fn hub() -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::new())
    }

    #[test]
    fn test_is_own() {
        let bus = ReplicationBus::with_origin(hub(), DEFAULT_CHANNEL, OriginId::new("a").unwrap());
        let entity = EntityId::generate();

        let own = SyncMessage::new(entity, vec![], 1, OriginId::new("a").unwrap());
        let foreign = SyncMessage::new(entity, vec![], 1, OriginId::new("b").unwrap());

        assert!(bus.is_own(&own));
        assert!(!bus.is_own(&foreign));
    }

    #[test]
    fn test_origins_are_unique() {
        let transport = hub();
        let a = ReplicationBus::new(transport.clone(), DEFAULT_CHANNEL);
        let b = ReplicationBus::new(transport, DEFAULT_CHANNEL);
        assert_ne!(a.origin(), b.origin());
    }

    #[tokio::test]
    async fn test_subscribe_only_once() {
        let bus = ReplicationBus::new(hub(), DEFAULT_CHANNEL);
        bus.subscribe(|_| {}).await.unwrap();
        assert!(bus.is_subscribed());
        assert!(matches!(
            bus.subscribe(|_| {}).await,
            Err(BusError::AlreadySubscribed)
        ));
        bus.close().await;
    }

    #[tokio::test]
    async fn test_own_messages_are_dropped() {
        let transport = hub();
        let bus = ReplicationBus::new(transport.clone(), DEFAULT_CHANNEL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(move |m| {
            let _ = tx.send(m);
        })
        .await
        .unwrap();

        let entity = EntityId::generate();
        bus.publish(entity, b"mine", 1).await;

        let other = ReplicationBus::new(transport, DEFAULT_CHANNEL);
        other.publish(entity, b"theirs", 2).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.blob, b"theirs");
        assert_eq!(received.origin_id, *other.origin());
        assert_eq!(bus.stats().own_dropped, 1);
        assert_eq!(bus.stats().delivered, 1);

        bus.close().await;
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let transport = hub();
        transport.set_failing(true);
        let bus = ReplicationBus::new(transport, DEFAULT_CHANNEL);

        bus.publish(EntityId::generate(), b"x", 1).await;
        assert!(bus.try_publish(EntityId::generate(), b"x", 1).await.is_err());
        assert_eq!(bus.stats().publish_failures, 2);
        assert_eq!(bus.stats().published, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = ReplicationBus::new(hub(), DEFAULT_CHANNEL);
        bus.close().await;
        bus.subscribe(|_| {}).await.unwrap();
        bus.close().await;
        bus.close().await;
    }
}
