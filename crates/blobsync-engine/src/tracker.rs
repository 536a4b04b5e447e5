//! Per-entity tracking shared between the owning thread and I/O workers
//!
//! Every check-and-set runs under the entity's shard lock, so a save on a
//! worker and an apply on the owning thread see a consistent entry. Distinct
//! entities never contend on a global lock.

use blobsync_core::{ContentHash, EntityId};
use dashmap::DashMap;

/// What this process knows about one entity's state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingEntry {
    /// Timestamp of the last successfully applied record
    pub last_applied_at: Option<i64>,
    /// Hash of the last successfully applied blob
    pub last_applied_hash: Option<ContentHash>,
    /// Hash of the last blob persisted (or known persisted) by this process
    pub last_saved_hash: Option<ContentHash>,
    /// When the last join load completed
    pub last_loaded_at: Option<i64>,
    /// Attach generation that owns this entry
    pub generation: u64,
}

/// Result of checking an inbound record against tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyCheck {
    /// Not newer than the last applied record
    Stale,
    /// Same content as the last applied record
    Duplicate,
    Proceed,
}

/// Result of claiming a save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDecision {
    /// Content equals what was just loaded, inside the grace window
    SkipGrace,
    /// Content equals what was last saved
    SkipUnchanged,
    /// Tracking was released; nothing is written
    Untracked,
    /// Claimed; `previous` restores the entry if the write fails
    Proceed { previous: Option<ContentHash> },
}

/// Concurrent map of tracking entries
#[derive(Debug, Default)]
pub struct EntityTracker {
    entries: DashMap<EntityId, TrackingEntry>,
}

impl EntityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of an entity's entry
    pub fn get(&self, entity_id: &EntityId) -> Option<TrackingEntry> {
        self.entries.get(entity_id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hand the entry to a new attach generation, creating it if missing
    pub fn begin_attach(&self, entity_id: EntityId, generation: u64) {
        self.entries.entry(entity_id).or_default().generation = generation;
    }

    pub fn check_apply(&self, entity_id: &EntityId, updated_at: i64, hash: &ContentHash) -> ApplyCheck {
        let Some(entry) = self.entries.get(entity_id) else {
            return ApplyCheck::Proceed;
        };

        if entry.last_applied_at.is_some_and(|last| updated_at <= last) {
            ApplyCheck::Stale
        } else if entry.last_applied_hash.as_ref() == Some(hash) {
            ApplyCheck::Duplicate
        } else {
            ApplyCheck::Proceed
        }
    }

    /// Record a successful apply
    ///
    /// The applied content came from the store or from another process that
    /// already stored it, so it also counts as saved.
    pub fn record_apply(&self, entity_id: EntityId, updated_at: i64, hash: ContentHash) {
        let mut entry = self.entries.entry(entity_id).or_default();
        entry.last_applied_at = Some(updated_at);
        entry.last_applied_hash = Some(hash);
        entry.last_saved_hash = Some(hash);
    }

    /// Stamp the completion time of a join load
    pub fn mark_loaded(&self, entity_id: EntityId, at: i64) {
        self.entries.entry(entity_id).or_default().last_loaded_at = Some(at);
    }

    /// Decide whether a save of `hash` requested at `now` should persist
    ///
    /// On `Proceed` the hash is already recorded as saved, so a concurrent
    /// save of the same content skips. Never creates an entry: a save that
    /// settles after detach released tracking reports `Untracked`.
    pub fn begin_save(
        &self,
        entity_id: EntityId,
        hash: ContentHash,
        now: i64,
        grace_ms: i64,
    ) -> SaveDecision {
        let Some(mut entry) = self.entries.get_mut(&entity_id) else {
            return SaveDecision::Untracked;
        };

        let in_grace = entry
            .last_loaded_at
            .is_some_and(|loaded| now.saturating_sub(loaded) < grace_ms);
        if in_grace && entry.last_applied_hash == Some(hash) {
            return SaveDecision::SkipGrace;
        }

        if entry.last_saved_hash == Some(hash) {
            return SaveDecision::SkipUnchanged;
        }

        let previous = entry.last_saved_hash.replace(hash);
        SaveDecision::Proceed { previous }
    }

    /// Undo a claim made by [`begin_save`](Self::begin_save) after a failed write
    ///
    /// Only restores when the claim is still current.
    pub fn rollback_save(&self, entity_id: &EntityId, hash: ContentHash, previous: Option<ContentHash>) {
        if let Some(mut entry) = self.entries.get_mut(entity_id) {
            if entry.last_saved_hash == Some(hash) {
                entry.last_saved_hash = previous;
            }
        }
    }

    /// Remove the entry if it still belongs to `generation`
    pub fn forget_if(&self, entity_id: &EntityId, generation: u64) -> bool {
        self.entries
            .remove_if(entity_id, |_, entry| entry.generation == generation)
            .is_some()
    }
}
