//! # Blobsync Engine
//!
//! Keeps one opaque state blob per entity consistent across processes that
//! share a [`StateStore`](blobsync_storage::StateStore) and a
//! [`ReplicationBus`](blobsync_bus::ReplicationBus).
//!
//! - Apply is last-writer-wins by timestamp and ignores repeated content.
//! - Save hashes the blob and skips the write when nothing changed, or when
//!   the content was just loaded (the post-load grace window).
//! - A process never applies its own broadcasts.
//! - Attach loads from the store and re-applies the loaded state on later
//!   ticks, so an owner that is not ready yet still converges.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::collections::HashMap;
//! use blobsync_engine::{PostcardCodec, SyncConfig, SyncEngine};
//!
//! let mut engine = SyncEngine::builder(PostcardCodec::<Notes>::new())
//!     .config(SyncConfig::default())
//!     .transport(hub)
//!     .build()?;
//! engine.start().await?;
//!
//! let mut owners: HashMap<EntityId, NotesOwner> = HashMap::new();
//! engine.attach(entity_id)?;
//! owners.insert(entity_id, NotesOwner::default());
//!
//! // Once per host tick
//! engine.tick(&mut owners);
//!
//! // After a local change
//! engine.save(&owners, entity_id)?;
//! ```

pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod owner;
pub mod scheduler;
pub mod stats;
pub mod tracker;

pub use cleanup::CleanupFilter;
pub use config::{BusSection, StoreSection, SyncConfig};
pub use engine::{ApplyOutcome, SaveOutcome, SyncEngine, SyncEngineBuilder};
pub use error::{ConfigError, SyncError, SyncResult};
pub use owner::{EntityHost, PostcardCodec, StateCodec, StateOwner};
pub use scheduler::DelayedTaskScheduler;
pub use stats::EngineStats;
pub use tracker::{ApplyCheck, EntityTracker, SaveDecision, TrackingEntry};
