//! # Blobsync Storage
//!
//! Durable keyed storage of the latest state blob per entity. The store is
//! the source of truth; the replication bus is only a latency optimization
//! on top of it.
//!
//! ## Features
//!
//! - **StateStore trait**: one record per entity id, upsert in place
//! - **RedbStateStore**: redb-backed implementation for production
//! - **InMemoryStateStore**: `DashMap` implementation for tests and simulation
//!
//! ## Example
//!
//! ```rust,ignore
//! use blobsync_core::EntityId;
//! use blobsync_storage::{InMemoryStateStore, StateStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = InMemoryStateStore::new();
//!     let entity = EntityId::generate();
//!
//!     store.save(entity, b"state".to_vec(), Some(10)).await.unwrap();
//!
//!     let record = store.load(&entity).await.unwrap();
//!     assert_eq!(record.updated_at, 10);
//! }
//! ```

pub mod error;
pub mod memory;
pub mod persistent;

// Re-exports
pub use error::StorageError;
pub use memory::InMemoryStateStore;
pub use persistent::{RedbStateStore, RedbStoreConfig};

use async_trait::async_trait;
use blobsync_core::{EntityId, StateRecord};
use tracing::warn;

/// Durable per-entity state storage
///
/// Implementations must guarantee at most one record per entity id. All
/// operations are I/O-bound and are only ever called from the background
/// worker pool, never from the thread that owns entity state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create the backing schema if it is missing
    ///
    /// Must be idempotent; called once at process start.
    async fn ensure_schema(&self) -> Result<(), StorageError>;

    /// Look up the stored record for an entity
    async fn lookup(&self, entity_id: &EntityId) -> Result<Option<StateRecord>, StorageError>;

    /// Insert or replace the record for `record.entity_id`
    async fn upsert(&self, record: &StateRecord) -> Result<(), StorageError>;

    /// Release the backend
    ///
    /// Every later operation fails with [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;

    /// Load the stored record, treating failures as "no known state yet"
    ///
    /// Transient errors are logged and surfaced as `None`; callers cannot
    /// distinguish them from a missing record.
    async fn load(&self, entity_id: &EntityId) -> Option<StateRecord> {
        match self.lookup(entity_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(entity = %entity_id, error = %e, "State load failed");
                None
            }
        }
    }

    /// Upsert a blob, stamping it with the current time when `updated_at` is `None`
    async fn save(
        &self,
        entity_id: EntityId,
        blob: Vec<u8>,
        updated_at: Option<i64>,
    ) -> Result<(), StorageError> {
        let updated_at = updated_at.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        self.upsert(&StateRecord::new(entity_id, blob, updated_at))
            .await
    }
}
