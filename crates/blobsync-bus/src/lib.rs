//! # Blobsync Bus
//!
//! Best-effort pub/sub replication of state changes between processes.
//!
//! Every process that shares a state store also shares one channel. After a
//! successful save, the saving process publishes a [`SyncMessage`] tagged
//! with its [`OriginId`]; every other process applies it to its live copy.
//! Delivery is at-most-once: lost messages are repaired by the next load
//! from the store.
//!
//! Two transports ship with the crate: [`GossipTransport`] carries messages
//! between server processes over iroh-gossip, and [`MemoryTransport`]
//! connects buses inside one process for tests and simulation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use blobsync_bus::{MemoryTransport, ReplicationBus, DEFAULT_CHANNEL};
//!
//! let hub = Arc::new(MemoryTransport::new());
//! let bus = ReplicationBus::new(hub, DEFAULT_CHANNEL);
//!
//! bus.subscribe(|message| println!("{} changed", message.entity_id)).await?;
//! bus.publish(entity_id, &blob, updated_at).await;
//! bus.close().await;
//! ```

pub mod bus;
pub mod error;
pub mod gossip;
pub mod memory;
pub mod message;
pub mod transport;

pub use bus::{BusStats, DEFAULT_CHANNEL, ReplicationBus};
pub use error::{BusError, BusResult};
pub use gossip::{GossipConfig, GossipSubscription, GossipTransport};
pub use memory::{MemorySubscription, MemoryTransport};
pub use message::SyncMessage;
pub use transport::{BusSubscription, BusTransport};
