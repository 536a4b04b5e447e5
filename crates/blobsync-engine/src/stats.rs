//! Engine counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of engine activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Records applied to an owner
    pub applied: u64,
    /// Records rejected as not newer than the last applied one
    pub stale: u64,
    /// Records rejected as identical to the last applied one
    pub duplicate: u64,
    /// Apply attempts with no owner available
    pub owner_unavailable: u64,
    /// Blobs that failed to decode
    pub decode_failures: u64,
    /// Saves handed to the worker pool
    pub saves_dispatched: u64,
    /// Saves written to the store
    pub saves_persisted: u64,
    /// Saves skipped inside the post-load grace window
    pub saves_skipped_grace: u64,
    /// Saves skipped because the content was already saved
    pub saves_skipped_unchanged: u64,
    /// Saves dropped because tracking was released before they ran
    pub saves_untracked: u64,
    /// Saves whose store write failed
    pub save_failures: u64,
    /// Foreign messages received from the bus
    pub remote_received: u64,
    /// Messages dropped because the inbox was full
    pub inbox_dropped: u64,
    /// Own messages discarded by the bus listener
    pub self_echo_discarded: u64,
    /// Entities currently attached
    pub attached: usize,
    /// Entities with a tracking entry
    pub tracked: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub applied: AtomicU64,
    pub stale: AtomicU64,
    pub duplicate: AtomicU64,
    pub owner_unavailable: AtomicU64,
    pub decode_failures: AtomicU64,
    pub saves_dispatched: AtomicU64,
    pub saves_persisted: AtomicU64,
    pub saves_skipped_grace: AtomicU64,
    pub saves_skipped_unchanged: AtomicU64,
    pub saves_untracked: AtomicU64,
    pub save_failures: AtomicU64,
    pub remote_received: AtomicU64,
    pub inbox_dropped: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStats {
            applied: load(&self.applied),
            stale: load(&self.stale),
            duplicate: load(&self.duplicate),
            owner_unavailable: load(&self.owner_unavailable),
            decode_failures: load(&self.decode_failures),
            saves_dispatched: load(&self.saves_dispatched),
            saves_persisted: load(&self.saves_persisted),
            saves_skipped_grace: load(&self.saves_skipped_grace),
            saves_skipped_unchanged: load(&self.saves_skipped_unchanged),
            saves_untracked: load(&self.saves_untracked),
            save_failures: load(&self.save_failures),
            remote_received: load(&self.remote_received),
            inbox_dropped: load(&self.inbox_dropped),
            ..EngineStats::default()
        }
    }
}
