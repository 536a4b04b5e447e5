//! Persisted state record

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::identity::EntityId;

/// Latest known state for one entity
///
/// The blob is opaque and always represents the complete state, never a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Entity this state belongs to
    pub entity_id: EntityId,
    /// Encoded state
    pub blob: Vec<u8>,
    /// Last update time (Unix millis)
    pub updated_at: i64,
}

impl StateRecord {
    pub fn new(entity_id: EntityId, blob: Vec<u8>, updated_at: i64) -> Self {
        Self {
            entity_id,
            blob,
            updated_at,
        }
    }

    /// Create a record stamped with the current wall-clock time
    pub fn now(entity_id: EntityId, blob: Vec<u8>) -> Self {
        Self::new(entity_id, blob, chrono::Utc::now().timestamp_millis())
    }

    /// Hash of the blob bytes
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of(&self.blob)
    }

    /// Whether this record supersedes another by timestamp
    pub fn is_newer_than(&self, other: &StateRecord) -> bool {
        self.updated_at > other.updated_at
    }
}
