//! Networked transport over iroh-gossip
//!
//! Each server process binds one iroh endpoint and joins one gossip topic per
//! bus channel. The topic id is the blake3 hash of the channel name, so every
//! process configured with the same channel meets in the same swarm. Peers
//! are found through the configured bootstrap endpoint ids.
//!
//! Gossip never hands a process its own broadcasts, so unlike
//! [`MemoryTransport`](crate::MemoryTransport) one transport must not be
//! shared by several buses that expect to hear each other.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointId, PublicKey, SecretKey};
use iroh_gossip::api::{Event, GossipReceiver, GossipSender};
use iroh_gossip::net::{GOSSIP_ALPN, Gossip};
use iroh_gossip::proto::TopicId;
use n0_future::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{BusError, BusResult};
use crate::transport::{BusSubscription, BusTransport};

/// Largest payload gossip will carry; blobs are whole entity states
const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Gossip transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// File holding this process's 32-byte endpoint key; created on first
    /// bind. Without it the endpoint id changes on every start.
    pub key_path: Option<PathBuf>,
    /// Hex endpoint ids of peers to join through
    pub bootstrap: Vec<String>,
    /// Upper bound on one encoded sync message
    pub max_message_size: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            key_path: None,
            bootstrap: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl GossipConfig {
    /// Parse the bootstrap list into endpoint ids
    pub fn bootstrap_ids(&self) -> BusResult<Vec<EndpointId>> {
        self.bootstrap.iter().map(|peer| parse_endpoint_id(peer)).collect()
    }
}

/// Parse a hex-encoded endpoint id
pub fn parse_endpoint_id(hex_id: &str) -> BusResult<EndpointId> {
    let bytes = hex::decode(hex_id.trim())
        .map_err(|e| BusError::InvalidPeer(format!("{hex_id}: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| BusError::InvalidPeer(format!("{hex_id}: expected 32 bytes, got {}", b.len())))?;
    PublicKey::from_bytes(&bytes).map_err(|e| BusError::InvalidPeer(format!("{hex_id}: {e}")))
}

/// Gossip topic for a bus channel
pub fn topic_for_channel(channel: &str) -> TopicId {
    TopicId::from(*blake3::hash(channel.as_bytes()).as_bytes())
}

/// Load the endpoint key at `path`, generating and saving one if missing
pub fn load_or_generate_key(path: &Path) -> BusResult<SecretKey> {
    if path.exists() {
        let bytes = std::fs::read(path)
            .map_err(|e| BusError::Key(format!("failed to read {}: {e}", path.display())))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            BusError::Key(format!("{}: expected 32 bytes, got {}", path.display(), b.len()))
        })?;
        let key = SecretKey::from_bytes(&bytes);
        debug!(endpoint = %key.public().fmt_short(), "Loaded endpoint key");
        return Ok(key);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| BusError::Key(format!("failed to create {}: {e}", parent.display())))?;
    }
    let key = SecretKey::generate(&mut rand::rng());
    std::fs::write(path, key.to_bytes())
        .map_err(|e| BusError::Key(format!("failed to write {}: {e}", path.display())))?;
    info!(endpoint = %key.public().fmt_short(), path = %path.display(), "Generated endpoint key");
    Ok(key)
}

/// Topic membership kept alive for publishing
struct Joined {
    sender: Arc<TokioMutex<GossipSender>>,
    /// Held when the topic was joined for publishing only
    _receiver: Option<GossipReceiver>,
}

/// [`BusTransport`] backed by an iroh endpoint and iroh-gossip
pub struct GossipTransport {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    bootstrap: Vec<EndpointId>,
    joined: DashMap<String, Joined>,
}

impl GossipTransport {
    /// Bind an endpoint and start serving the gossip protocol
    #[instrument(skip(config), fields(bootstrap = config.bootstrap.len()))]
    pub async fn bind(config: GossipConfig) -> BusResult<Self> {
        let bootstrap = config.bootstrap_ids()?;
        let secret_key = match &config.key_path {
            Some(path) => load_or_generate_key(path)?,
            None => SecretKey::generate(&mut rand::rng()),
        };

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .bind()
            .await
            .map_err(|e| BusError::Bind(e.to_string()))?;

        let gossip = Gossip::builder()
            .max_message_size(config.max_message_size)
            .spawn(endpoint.clone());
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();

        info!(
            endpoint = %hex::encode(endpoint.id().as_bytes()),
            "Gossip transport bound"
        );

        Ok(Self {
            endpoint,
            gossip,
            router,
            bootstrap,
            joined: DashMap::new(),
        })
    }

    /// This process's endpoint id, the value other processes bootstrap with
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Channels this transport has joined
    pub fn joined_channels(&self) -> Vec<String> {
        self.joined.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Leave every topic and stop the endpoint
    pub async fn close(&self) {
        self.joined.clear();
        if let Err(e) = self.router.shutdown().await {
            warn!(error = %e, "Gossip router did not shut down cleanly");
        }
    }

    async fn join(&self, channel: &str) -> BusResult<(GossipSender, GossipReceiver)> {
        let topic = self
            .gossip
            .subscribe(topic_for_channel(channel), self.bootstrap.clone())
            .await
            .map_err(|e| BusError::SubscribeFailed(e.to_string()))?;
        debug!(channel, peers = self.bootstrap.len(), "Joined gossip topic");
        Ok(topic.split())
    }

    async fn sender(&self, channel: &str) -> BusResult<Arc<TokioMutex<GossipSender>>> {
        if let Some(joined) = self.joined.get(channel) {
            return Ok(joined.sender.clone());
        }

        let (sender, receiver) = self.join(channel).await?;
        let joined = self.joined.entry(channel.to_string()).or_insert(Joined {
            sender: Arc::new(TokioMutex::new(sender)),
            _receiver: Some(receiver),
        });
        Ok(joined.sender.clone())
    }
}

#[async_trait]
impl BusTransport for GossipTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender(channel).await?;
        sender
            .lock()
            .await
            .broadcast(payload)
            .await
            .map_err(|e| BusError::PublishFailed(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> BusResult<Box<dyn BusSubscription>> {
        let (sender, receiver) = self.join(channel).await?;
        // Publishing reuses this membership instead of joining twice
        self.joined.insert(
            channel.to_string(),
            Joined {
                sender: Arc::new(TokioMutex::new(sender)),
                _receiver: None,
            },
        );
        Ok(Box::new(GossipSubscription { receiver }))
    }
}

/// Receiving half of a joined gossip topic
pub struct GossipSubscription {
    receiver: GossipReceiver,
}

#[async_trait]
impl BusSubscription for GossipSubscription {
    async fn recv(&mut self) -> Option<BusResult<Bytes>> {
        loop {
            match self.receiver.try_next().await {
                Ok(Some(Event::Received(message))) => return Some(Ok(message.content)),
                Ok(Some(Event::Lagged)) => return Some(Err(BusError::Lagged(0))),
                Ok(Some(Event::NeighborUp(peer))) => {
                    debug!(peer = %peer.fmt_short(), "Gossip neighbor up");
                }
                Ok(Some(Event::NeighborDown(peer))) => {
                    debug!(peer = %peer.fmt_short(), "Gossip neighbor down");
                }
                Ok(None) => return None,
                Err(e) => {
                    trace!(error = %e, "Gossip receive error");
                    return Some(Err(BusError::SubscribeFailed(e.to_string())));
                }
            }
        }
    }
}
