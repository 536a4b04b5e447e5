//! In-memory storage implementation
//!
//! Suitable for tests and simulation. Several engines in one process can
//! share a single instance to model the shared database.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use blobsync_core::{EntityId, StateRecord};
use dashmap::DashMap;
use tracing::trace;

use crate::StateStore;
use crate::error::StorageError;

/// In-memory implementation of [`StateStore`]
///
/// Uses `DashMap` for concurrent access. Counts successful writes and can be
/// switched into a failing mode to exercise transient-error paths.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: DashMap<EntityId, StateRecord>,
    writes: AtomicUsize,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful upserts so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of distinct entities stored
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Make every operation fail with [`StorageError::Unavailable`]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Peek at a record without going through the async API
    pub fn get(&self, entity_id: &EntityId) -> Option<StateRecord> {
        self.records.get(entity_id).map(|r| r.value().clone())
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.check()
    }

    async fn lookup(&self, entity_id: &EntityId) -> Result<Option<StateRecord>, StorageError> {
        self.check()?;
        Ok(self.get(entity_id))
    }

    async fn upsert(&self, record: &StateRecord) -> Result<(), StorageError> {
        self.check()?;
        trace!(entity = %record.entity_id, updated_at = record.updated_at, "Upserting record");
        // Last physical write wins, whatever its timestamp
        self.records.insert(record.entity_id, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
