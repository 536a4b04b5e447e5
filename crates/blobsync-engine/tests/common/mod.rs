//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use blobsync_bus::MemoryTransport;
use blobsync_core::{EntityId, ManualClock, StateRecord};
use blobsync_engine::{PostcardCodec, StateCodec, StateOwner, SyncConfig, SyncEngine};
use blobsync_storage::{InMemoryStateStore, StateStore};
use regex::Regex;

pub type Notes = BTreeMap<String, String>;
pub type Engine = SyncEngine<PostcardCodec<Notes>>;

/// Owner that counts how often its state was replaced
#[derive(Debug, Default)]
pub struct NotesOwner {
    pub notes: Notes,
    pub replaced: usize,
}

impl NotesOwner {
    pub fn with(entries: &[(&str, &str)]) -> Self {
        Self {
            notes: notes(entries),
            replaced: 0,
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.notes.insert(key.to_string(), value.to_string());
    }
}

impl StateOwner for NotesOwner {
    type State = Notes;

    fn snapshot(&self) -> Notes {
        self.notes.clone()
    }

    fn replace(&mut self, state: Notes) {
        self.notes = state;
        self.replaced += 1;
    }

    fn prune_matching(&mut self, pattern: &Regex) -> usize {
        let before = self.notes.len();
        self.notes.retain(|key, _| !pattern.is_match(key));
        before - self.notes.len()
    }
}

pub fn notes(entries: &[(&str, &str)]) -> Notes {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A record whose blob encodes `entries`
pub fn record(entity_id: EntityId, entries: &[(&str, &str)], updated_at: i64) -> StateRecord {
    let blob = PostcardCodec::<Notes>::new()
        .encode(&notes(entries))
        .expect("encode");
    StateRecord::new(entity_id, blob, updated_at)
}

/// One simulated server process
pub struct Node {
    pub engine: Engine,
    pub owners: HashMap<EntityId, NotesOwner>,
    pub clock: Arc<ManualClock>,
}

impl Node {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn StateStore>,
        hub: Option<Arc<MemoryTransport>>,
        start_millis: i64,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start_millis));
        let mut builder = SyncEngine::builder(PostcardCodec::<Notes>::new())
            .config(config)
            .store(store)
            .clock(clock.clone());
        if let Some(hub) = hub {
            builder = builder.transport(hub);
        }

        Self {
            engine: builder.build().expect("build engine"),
            owners: HashMap::new(),
            clock,
        }
    }

    /// Node on a fresh in-memory store with no bus
    pub fn standalone() -> (Self, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        let node = Self::new(
            SyncConfig::testing().with_bus_enabled(false),
            store.clone(),
            None,
            1_000,
        );
        (node, store)
    }

    pub fn tick(&mut self) {
        self.engine.tick(&mut self.owners);
    }

    pub fn apply(&mut self, record: &StateRecord) -> blobsync_engine::SyncResult<blobsync_engine::ApplyOutcome> {
        self.engine.apply(&mut self.owners, record)
    }

    pub fn save(&self, entity_id: EntityId) -> blobsync_engine::SaveOutcome {
        self.engine.save(&self.owners, entity_id).expect("save")
    }

    pub fn notes(&self, entity_id: &EntityId) -> Option<&Notes> {
        self.owners.get(entity_id).map(|owner| &owner.notes)
    }

    /// Tick with short sleeps until `done` holds; false on timeout
    pub async fn tick_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..400 {
            self.tick();
            if done(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}
