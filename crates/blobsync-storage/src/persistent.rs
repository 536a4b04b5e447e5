//! redb-backed state store
//!
//! One table, keyed by the 16 raw bytes of the entity id, so the
//! one-record-per-entity invariant is the table's primary key.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, ReadableTableMetadata, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use blobsync_core::{EntityId, StateRecord};

use crate::StateStore;
use crate::error::StorageError;

// Key: entity id bytes, Value: serialized StoredState
pub const STATE_RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("state_records");

/// Configuration for the redb store
#[derive(Debug, Clone)]
pub struct RedbStoreConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Cache size in bytes
    pub cache_size: usize,
    /// Create the table at open if it is missing
    pub create_schema: bool,
}

impl Default for RedbStoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/blobsync.redb"),
            cache_size: 64 * 1024 * 1024, // 64MB
            create_schema: true,
        }
    }
}

impl RedbStoreConfig {
    pub fn with_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }
}

/// Value stored per entity
#[derive(Debug, Serialize, Deserialize)]
struct StoredState {
    blob: Vec<u8>,
    updated_at: i64,
}

/// redb implementation of [`StateStore`]
pub struct RedbStateStore {
    db: RwLock<Option<Arc<Database>>>,
    config: RedbStoreConfig,
}

impl RedbStateStore {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbStoreConfig) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::builder()
            .set_cache_size(config.cache_size)
            .create(&config.db_path)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        info!("Opened redb state store");

        let store = Self {
            db: RwLock::new(Some(Arc::new(db))),
            config,
        };

        if store.config.create_schema {
            store.create_tables()?;
        }

        Ok(store)
    }

    /// Get the configuration
    pub fn config(&self) -> &RedbStoreConfig {
        &self.config
    }

    /// Number of stored records
    pub fn record_count(&self) -> Result<u64, StorageError> {
        let db = self.database()?;
        let read_txn = db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = match read_txn.open_table(STATE_RECORDS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(e) => return Err(StorageError::Database(e.to_string())),
        };

        table.len().map_err(|e| StorageError::Database(e.to_string()))
    }

    fn database(&self) -> Result<Arc<Database>, StorageError> {
        self.db.read().clone().ok_or(StorageError::Closed)
    }

    fn create_tables(&self) -> Result<(), StorageError> {
        let db = self.database()?;
        let write_txn = db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        // Opening a table in a write transaction creates it if it doesn't exist
        write_txn
            .open_table(STATE_RECORDS)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        debug!("Ensured state_records table");
        Ok(())
    }

    fn get(&self, entity_id: &EntityId) -> Result<Option<StateRecord>, StorageError> {
        let db = self.database()?;
        let read_txn = db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = match read_txn.open_table(STATE_RECORDS) {
            Ok(table) => table,
            // Schema creation disabled and nothing written yet
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(StorageError::Database(e.to_string())),
        };

        let Some(value) = table
            .get(entity_id.as_bytes().as_slice())
            .map_err(|e| StorageError::Database(e.to_string()))?
        else {
            return Ok(None);
        };

        let stored: StoredState = postcard::from_bytes(value.value())?;
        Ok(Some(StateRecord::new(
            *entity_id,
            stored.blob,
            stored.updated_at,
        )))
    }

    fn put(&self, record: &StateRecord) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(&StoredState {
            blob: record.blob.clone(),
            updated_at: record.updated_at,
        })
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let db = self.database()?;
        let write_txn = db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        {
            let mut table = write_txn
                .open_table(STATE_RECORDS)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            table
                .insert(record.entity_id.as_bytes().as_slice(), value.as_slice())
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for RedbStateStore {
    async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.create_tables()
    }

    async fn lookup(&self, entity_id: &EntityId) -> Result<Option<StateRecord>, StorageError> {
        self.get(entity_id)
    }

    async fn upsert(&self, record: &StateRecord) -> Result<(), StorageError> {
        self.put(record)
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.db.write().take().is_some() {
            info!(path = %self.config.db_path.display(), "Closed redb state store");
        }
        Ok(())
    }
}
