//! Per-server handle onto the shared database

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use blobsync_core::{EntityId, StateRecord};
use blobsync_storage::{StateStore, StorageError};
use tracing::debug;

/// One server's connection to a store shared by the whole cluster
///
/// Closing a handle only affects that server; the cluster closes the
/// underlying store once every server has shut down.
pub struct ProcessStore {
    inner: Arc<dyn StateStore>,
    closed: AtomicBool,
}

impl ProcessStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for ProcessStore {
    async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.check_open()?;
        self.inner.ensure_schema().await
    }

    async fn lookup(&self, entity_id: &EntityId) -> Result<Option<StateRecord>, StorageError> {
        self.check_open()?;
        self.inner.lookup(entity_id).await
    }

    async fn upsert(&self, record: &StateRecord) -> Result<(), StorageError> {
        self.check_open()?;
        self.inner.upsert(record).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Released store handle");
        }
        Ok(())
    }
}
