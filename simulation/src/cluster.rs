//! Several sync engines sharing one database and one bus

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, ensure};
use blobsync_bus::MemoryTransport;
use blobsync_core::{EntityId, ManualClock, OriginId};
use blobsync_engine::{
    EngineStats, PostcardCodec, SaveOutcome, StateCodec, SyncConfig, SyncEngine, SyncResult,
};
use blobsync_storage::{RedbStateStore, RedbStoreConfig, StateStore};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::store::ProcessStore;
use crate::types::{Document, DocumentOwner, SimEngine};

/// Rounds [`Cluster::run_until`] waits before giving up
const MAX_ROUNDS: usize = 500;

/// Pause between rounds so bus listeners can deliver
const ROUND_PAUSE: Duration = Duration::from_millis(2);

/// Settings for a simulated cluster
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Number of servers (A, B, C, ...)
    pub servers: usize,
    /// Directory holding the shared database; a temporary one when `None`
    pub data_dir: Option<PathBuf>,
    /// Engine configuration used by every server
    pub sync: SyncConfig,
    /// Clock value at startup, in milliseconds
    pub start_millis: i64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            servers: 2,
            data_dir: None,
            sync: SyncConfig::testing()
                .with_join_retry_ticks([5, 10])
                .with_post_apply_cleanup("^cursor:"),
            start_millis: 1_000_000,
        }
    }
}

impl ClusterOptions {
    pub fn with_servers(mut self, servers: usize) -> Self {
        self.servers = servers;
        self
    }

    pub fn with_data_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.data_dir = dir;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }
}

/// One simulated server process
pub struct SimServer {
    name: char,
    engine: SimEngine,
    owners: HashMap<EntityId, DocumentOwner>,
}

impl SimServer {
    pub fn name(&self) -> char {
        self.name
    }

    pub fn engine(&self) -> &SimEngine {
        &self.engine
    }

    /// Take over an entity: create its owner and start the join sequence
    pub fn join(&mut self, entity_id: EntityId) -> SyncResult<()> {
        self.owners.entry(entity_id).or_default();
        self.engine.attach(entity_id)
    }

    /// Hand an entity off: final save, then drop the owner
    pub fn leave(&mut self, entity_id: EntityId) -> SyncResult<()> {
        self.engine.detach(&self.owners, entity_id)?;
        self.owners.remove(&entity_id);
        Ok(())
    }

    /// Whether the join load for `entity_id` has completed
    pub fn has_loaded(&self, entity_id: &EntityId) -> bool {
        self.engine
            .tracker()
            .get(entity_id)
            .is_some_and(|entry| entry.last_loaded_at.is_some())
    }

    pub fn edit(&mut self, entity_id: EntityId, field: impl Into<String>, value: impl Into<String>) -> bool {
        match self.owners.get_mut(&entity_id) {
            Some(owner) => {
                owner.edit(field, value);
                true
            }
            None => false,
        }
    }

    pub fn save(&self, entity_id: EntityId) -> SyncResult<SaveOutcome> {
        self.engine.save(&self.owners, entity_id)
    }

    pub fn owner(&self, entity_id: &EntityId) -> Option<&DocumentOwner> {
        self.owners.get(entity_id)
    }

    pub fn document(&self, entity_id: &EntityId) -> Option<&Document> {
        self.owners.get(entity_id).map(DocumentOwner::fields)
    }

    pub fn tracked(&self) -> usize {
        self.engine.tracker().len()
    }

    fn tick(&mut self) {
        self.engine.tick(&mut self.owners);
    }
}

/// Servers on one machine sharing a redb file and an in-memory bus
pub struct Cluster {
    servers: Vec<SimServer>,
    store: Arc<RedbStateStore>,
    hub: Arc<MemoryTransport>,
    clock: Arc<ManualClock>,
    codec: PostcardCodec<Document>,
    _temp_dir: Option<TempDir>,
}

impl Cluster {
    /// Open the shared database and start every server
    ///
    /// Must be called inside a tokio runtime.
    pub async fn start(options: ClusterOptions) -> anyhow::Result<Self> {
        ensure!(
            (1..=26).contains(&options.servers),
            "cluster needs between 1 and 26 servers, got {}",
            options.servers
        );

        let (dir, temp_dir) = match options.data_dir {
            Some(dir) => (dir, None),
            None => {
                let temp = TempDir::new().context("creating temporary data directory")?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        let db_path = dir.join("blobsync-sim.redb");
        let store = Arc::new(
            RedbStateStore::open(RedbStoreConfig::with_path(&db_path))
                .with_context(|| format!("opening {}", db_path.display()))?,
        );
        let hub = Arc::new(MemoryTransport::new());
        let clock = Arc::new(ManualClock::new(options.start_millis));

        let mut servers = Vec::with_capacity(options.servers);
        for (index, name) in ('A'..='Z').take(options.servers).enumerate() {
            let engine = SyncEngine::builder(PostcardCodec::<Document>::new())
                .config(options.sync.clone())
                .store(Arc::new(ProcessStore::new(store.clone())))
                .transport(hub.clone())
                .clock(clock.clone())
                .origin(OriginId::new(format!("sim-{name}"))?)
                .build()
                .with_context(|| format!("building server {name}"))?;
            engine.start().await?;
            debug!(server = %name, index, "Server started");

            servers.push(SimServer {
                name,
                engine,
                owners: HashMap::new(),
            });
        }

        info!(servers = servers.len(), path = %db_path.display(), "Cluster started");
        Ok(Self {
            servers,
            store,
            hub,
            clock,
            codec: PostcardCodec::new(),
            _temp_dir: temp_dir,
        })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn server(&self, index: usize) -> &SimServer {
        &self.servers[index]
    }

    pub fn server_mut(&mut self, index: usize) -> &mut SimServer {
        &mut self.servers[index]
    }

    pub fn servers(&self) -> &[SimServer] {
        &self.servers
    }

    pub fn advance_clock(&self, millis: i64) -> i64 {
        self.clock.advance(millis)
    }

    /// Messages published on the bus so far
    pub fn published(&self) -> u64 {
        self.hub.published_count()
    }

    pub fn hub(&self) -> Arc<MemoryTransport> {
        self.hub.clone()
    }

    pub fn records_stored(&self) -> anyhow::Result<u64> {
        Ok(self.store.record_count()?)
    }

    /// The stored document for `entity_id`, decoded
    pub async fn stored_document(&self, entity_id: &EntityId) -> anyhow::Result<Option<Document>> {
        match self.store.lookup(entity_id).await? {
            Some(record) => Ok(Some(self.codec.decode(&record.blob)?)),
            None => Ok(None),
        }
    }

    /// Wait for in-flight loads and saves on every server
    pub async fn quiesce(&self) {
        for server in &self.servers {
            server.engine.quiesce().await;
        }
    }

    /// Tick every server once
    pub fn tick(&mut self) {
        for server in &mut self.servers {
            server.tick();
        }
    }

    /// Run rounds of quiesce-then-tick until `done` holds; false on timeout
    pub async fn run_until(&mut self, mut done: impl FnMut(&Cluster) -> bool) -> bool {
        for _ in 0..MAX_ROUNDS {
            self.quiesce().await;
            self.tick();
            if done(self) {
                return true;
            }
            tokio::time::sleep(ROUND_PAUSE).await;
        }
        false
    }

    /// Wait until every server heard every published message, then tick
    /// once more so the last deliveries are drained from the inboxes
    pub async fn settle(&mut self) -> bool {
        let published = self.hub.published_count();
        let heard = self
            .run_until(|c| {
                c.servers.iter().all(|s| {
                    let stats = s.engine.stats();
                    stats.remote_received + stats.self_echo_discarded >= published
                })
            })
            .await;
        tokio::time::sleep(ROUND_PAUSE).await;
        self.tick();
        heard
    }

    /// Shut every server down, then close the shared database
    pub async fn shutdown(mut self) -> anyhow::Result<Vec<(char, EngineStats)>> {
        let mut stats = Vec::with_capacity(self.servers.len());
        for server in &mut self.servers {
            server.engine.shutdown(&server.owners).await;
            stats.push((server.name, server.engine.stats()));
        }
        self.store.close().await?;
        info!("Cluster shut down");
        Ok(stats)
    }
}
