//! The sync engine
//!
//! A [`SyncEngine`] lives on the thread that owns entity state (the owning
//! thread). Everything that touches owner state runs there: `attach`,
//! `detach`, `apply`, `save`'s snapshot, and `tick`. Store and bus I/O run
//! on a pool of `io_workers` threads the engine owns, or on a runtime the
//! caller hands to the builder. Results come back through a bounded inbox
//! that `tick` drains before doing anything else.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use blobsync_bus::{BusTransport, ReplicationBus, SyncMessage};
use blobsync_core::{Clock, ContentHash, EntityId, OriginId, StateRecord, SystemClock};
use blobsync_storage::{RedbStateStore, StateStore};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, info, instrument, trace, warn};

use crate::cleanup::CleanupFilter;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::owner::{EntityHost, StateCodec, StateOwner};
use crate::scheduler::DelayedTaskScheduler;
use crate::stats::{Counters, EngineStats};
use crate::tracker::{ApplyCheck, EntityTracker, SaveDecision};

/// Result of an apply attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Owner state replaced
    Applied,
    /// Not newer than the last applied record
    Stale,
    /// Same content as the last applied record
    Duplicate,
    /// The owner is not available yet; nothing recorded
    OwnerUnavailable,
}

/// Result of a save request
///
/// Whether the save is persisted is decided on the worker; see
/// [`EngineStats`] for the outcome counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Snapshot taken and handed to the worker pool
    Dispatched,
    /// No owner to snapshot
    OwnerUnavailable,
    /// The entity is not attached to this engine
    NotAttached,
}

/// Work coming back to the owning thread
#[derive(Debug)]
enum Inbound {
    Loaded {
        entity_id: EntityId,
        generation: u64,
        record: Option<StateRecord>,
    },
    Remote(StateRecord),
}

/// Scheduled re-apply of the staged record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinPass {
    entity_id: EntityId,
    generation: u64,
    pass: usize,
}

#[derive(Debug)]
struct Attachment {
    generation: u64,
    /// Freshest record seen since attach, re-applied by join passes
    staged: Option<StateRecord>,
}

impl Attachment {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            staged: None,
        }
    }

    /// Keep `record` if it is newer than what is staged; return the staged record
    fn stage(&mut self, record: StateRecord) -> StateRecord {
        match &self.staged {
            Some(staged) if !record.is_newer_than(staged) => staged.clone(),
            _ => {
                self.staged = Some(record.clone());
                record
            }
        }
    }
}

/// Count of dispatched I/O tasks still running
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Runtime the engine dispatches I/O onto
///
/// Either a handle the caller passed in, or a multi-thread pool of
/// `io_workers` threads owned by the engine.
struct IoRuntime {
    handle: Handle,
    owned: Option<Runtime>,
}

impl IoRuntime {
    fn shared(handle: Handle) -> Self {
        Self { handle, owned: None }
    }

    fn owned(workers: usize) -> SyncResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("blobsync-io")
            .enable_all()
            .build()
            .map_err(SyncError::IoPool)?;
        debug!(workers, "Started I/O worker pool");
        Ok(Self {
            handle: runtime.handle().clone(),
            owned: Some(runtime),
        })
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        // Blocking shutdown panics when dropped from async code
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}

struct SaveJob {
    entity_id: EntityId,
    blob: Vec<u8>,
    hash: ContentHash,
    requested_at: i64,
    /// Release tracking for this generation once the save settles
    forget: Option<u64>,
}

/// Everything a worker needs to run a save
#[derive(Clone)]
struct SaveWorker {
    tracker: Arc<EntityTracker>,
    store: Arc<dyn StateStore>,
    bus: Option<Arc<ReplicationBus>>,
    counters: Arc<Counters>,
    grace_ms: i64,
}

impl SaveWorker {
    async fn run(self, job: SaveJob) {
        let entity = job.entity_id.short();

        match self
            .tracker
            .begin_save(job.entity_id, job.hash, job.requested_at, self.grace_ms)
        {
            SaveDecision::SkipGrace => {
                Counters::bump(&self.counters.saves_skipped_grace);
                debug!(entity = %entity, "Skipping save of freshly loaded state");
            }
            SaveDecision::SkipUnchanged => {
                Counters::bump(&self.counters.saves_skipped_unchanged);
                trace!(entity = %entity, "Skipping unchanged save");
            }
            SaveDecision::Untracked => {
                Counters::bump(&self.counters.saves_untracked);
                trace!(entity = %entity, "Dropping save, tracking already released");
            }
            SaveDecision::Proceed { previous } => {
                match self
                    .store
                    .save(job.entity_id, job.blob.clone(), Some(job.requested_at))
                    .await
                {
                    Ok(()) => {
                        Counters::bump(&self.counters.saves_persisted);
                        debug!(
                            entity = %entity,
                            updated_at = job.requested_at,
                            hash = %job.hash.short(),
                            "Saved state"
                        );
                        if let Some(bus) = &self.bus {
                            bus.publish(job.entity_id, &job.blob, job.requested_at).await;
                        }
                    }
                    Err(e) => {
                        self.tracker.rollback_save(&job.entity_id, job.hash, previous);
                        Counters::bump(&self.counters.save_failures);
                        warn!(entity = %entity, error = %e, "Failed to save state");
                    }
                }
            }
        }

        if let Some(generation) = job.forget {
            if self.tracker.forget_if(&job.entity_id, generation) {
                trace!(entity = %entity, generation, "Released tracking");
            }
        }
    }
}

/// Builder for [`SyncEngine`]
pub struct SyncEngineBuilder<C> {
    codec: C,
    config: SyncConfig,
    store: Option<Arc<dyn StateStore>>,
    transport: Option<Arc<dyn BusTransport>>,
    origin: Option<OriginId>,
    clock: Option<Arc<dyn Clock>>,
    runtime: Option<Handle>,
}

impl<C: StateCodec> SyncEngineBuilder<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            config: SyncConfig::default(),
            store: None,
            transport: None,
            origin: None,
            clock: None,
            runtime: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this store instead of opening the configured redb file
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Transport for the replication bus
    pub fn transport(mut self, transport: Arc<dyn BusTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Fixed origin id instead of a random one
    pub fn origin(mut self, origin: OriginId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Run I/O on this runtime instead of an engine-owned pool of
    /// `io_workers` threads
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine<C>> {
        let config = self.config;
        config.validate()?;

        let runtime = match self.runtime {
            Some(handle) => IoRuntime::shared(handle),
            None => IoRuntime::owned(config.io_workers)?,
        };

        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None => Arc::new(RedbStateStore::open(config.store_config())?),
        };

        let bus = match (config.bus.enabled, self.transport) {
            (true, Some(transport)) => {
                let origin = self.origin.unwrap_or_else(OriginId::generate);
                let bus = ReplicationBus::with_origin(transport, config.bus.channel.clone(), origin)
                    .with_close_timeout(config.shutdown_timeout());
                Some(Arc::new(bus))
            }
            (true, None) => {
                warn!("Replication enabled but no transport given, running without bus");
                None
            }
            (false, _) => None,
        };

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };

        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity);
        let last_autosave_at = clock.now_millis();

        Ok(SyncEngine {
            cleanup: CleanupFilter::new(config.post_apply_cleanup.clone()),
            codec: self.codec,
            store,
            bus,
            clock,
            runtime,
            tracker: Arc::new(EntityTracker::new()),
            scheduler: DelayedTaskScheduler::new(),
            attached: HashMap::new(),
            inbox_tx,
            inbox_rx,
            next_generation: 0,
            accepting: true,
            in_flight: Arc::new(InFlight::default()),
            counters: Arc::new(Counters::default()),
            last_autosave_at,
            config,
        })
    }
}

/// Per-process synchronization engine
pub struct SyncEngine<C: StateCodec> {
    config: SyncConfig,
    codec: C,
    store: Arc<dyn StateStore>,
    bus: Option<Arc<ReplicationBus>>,
    clock: Arc<dyn Clock>,
    runtime: IoRuntime,
    tracker: Arc<EntityTracker>,
    scheduler: DelayedTaskScheduler<JoinPass>,
    attached: HashMap<EntityId, Attachment>,
    inbox_tx: mpsc::Sender<Inbound>,
    inbox_rx: mpsc::Receiver<Inbound>,
    next_generation: u64,
    accepting: bool,
    cleanup: CleanupFilter,
    in_flight: Arc<InFlight>,
    counters: Arc<Counters>,
    last_autosave_at: i64,
}

impl<C: StateCodec> SyncEngine<C> {
    pub fn builder(codec: C) -> SyncEngineBuilder<C> {
        SyncEngineBuilder::new(codec)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn bus(&self) -> Option<&Arc<ReplicationBus>> {
        self.bus.as_ref()
    }

    /// Origin id stamped on this engine's broadcasts
    pub fn origin(&self) -> Option<&OriginId> {
        self.bus.as_ref().map(|bus| bus.origin())
    }

    /// Runtime that runs store and bus I/O
    pub fn io_handle(&self) -> &Handle {
        &self.runtime.handle
    }

    pub fn tracker(&self) -> &EntityTracker {
        &self.tracker
    }

    pub fn is_attached(&self, entity_id: &EntityId) -> bool {
        self.attached.contains_key(entity_id)
    }

    pub fn attached(&self) -> impl Iterator<Item = &EntityId> {
        self.attached.keys()
    }

    /// Join passes still waiting on the scheduler
    pub fn pending_join_passes(&self) -> usize {
        self.scheduler.len()
    }

    /// Dispatched I/O tasks still running
    pub fn pending_io(&self) -> usize {
        self.in_flight.count()
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = self.counters.snapshot();
        stats.self_echo_discarded = self.bus.as_ref().map_or(0, |bus| bus.stats().own_dropped);
        stats.attached = self.attached.len();
        stats.tracked = self.tracker.len();
        stats
    }

    /// Prepare the store and start listening for remote changes
    #[instrument(skip(self))]
    pub async fn start(&self) -> SyncResult<()> {
        if self.config.storage.create_schema {
            self.store.ensure_schema().await?;
        }

        let Some(bus) = &self.bus else {
            info!("Sync engine started without replication");
            return Ok(());
        };

        let inbox = self.inbox_tx.clone();
        let counters = self.counters.clone();
        let handler = move |message: SyncMessage| {
            Counters::bump(&counters.remote_received);
            let entity = message.entity_id;
            match inbox.try_send(Inbound::Remote(message.into_record())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    Counters::bump(&counters.inbox_dropped);
                    warn!(entity = %entity.short(), "Inbox full, dropping remote change");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(entity = %entity.short(), "Engine gone, dropping remote change");
                }
            }
        };

        // The listener task lands on the runtime that calls subscribe
        let listener_bus = bus.clone();
        self.runtime
            .handle
            .spawn(async move { listener_bus.subscribe(handler).await })
            .await
            .map_err(|e| SyncError::IoPool(std::io::Error::other(e)))??;

        info!(origin = %bus.origin(), channel = bus.channel(), "Sync engine started");
        Ok(())
    }

    /// Begin tracking an entity that just arrived on this process
    ///
    /// Dispatches the join load and schedules the retry passes. Re-attaching
    /// an attached entity supersedes the previous attachment.
    #[instrument(skip(self), fields(entity = %entity_id.short()))]
    pub fn attach(&mut self, entity_id: EntityId) -> SyncResult<()> {
        if !self.accepting {
            return Err(SyncError::ShuttingDown);
        }

        self.next_generation += 1;
        let generation = self.next_generation;

        if self.attached.insert(entity_id, Attachment::new(generation)).is_some() {
            debug!("Superseding previous attachment");
            self.scheduler.retain(|pass| pass.entity_id != entity_id);
        }
        self.tracker.begin_attach(entity_id, generation);

        if self.config.load_on_join {
            self.dispatch_load(entity_id, generation);
            for (index, delay) in self.config.join_retry_ticks.iter().enumerate() {
                self.scheduler.schedule(
                    *delay,
                    JoinPass {
                        entity_id,
                        generation,
                        pass: index + 1,
                    },
                );
            }
        }

        debug!(generation, "Attached");
        Ok(())
    }

    /// Stop tracking an entity that is leaving this process
    ///
    /// Runs a final save when configured, then releases tracking unless the
    /// entity has been attached again meanwhile.
    #[instrument(skip(self, host), fields(entity = %entity_id.short()))]
    pub fn detach<H>(&mut self, host: &H, entity_id: EntityId) -> SyncResult<()>
    where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        let Some(attachment) = self.attached.remove(&entity_id) else {
            debug!("Not attached");
            return Ok(());
        };
        self.scheduler.retain(|pass| pass.entity_id != entity_id);

        if self.config.save_on_detach {
            self.dispatch_save(host, entity_id, Some(attachment.generation))?;
        } else {
            self.tracker.forget_if(&entity_id, attachment.generation);
        }

        debug!(generation = attachment.generation, "Detached");
        Ok(())
    }

    /// Apply a record to the entity's owner
    ///
    /// Stale and duplicate records are no-ops. The blob is fully decoded
    /// before anything is recorded or replaced, so a decode error leaves both
    /// owner and tracking untouched.
    pub fn apply<H>(&self, host: &mut H, record: &StateRecord) -> SyncResult<ApplyOutcome>
    where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        let entity_id = record.entity_id;
        let Some(owner) = host.owner_mut(&entity_id) else {
            Counters::bump(&self.counters.owner_unavailable);
            trace!(entity = %entity_id.short(), "Owner not available");
            return Ok(ApplyOutcome::OwnerUnavailable);
        };

        let hash = record.content_hash();
        match self.tracker.check_apply(&entity_id, record.updated_at, &hash) {
            ApplyCheck::Stale => {
                Counters::bump(&self.counters.stale);
                trace!(entity = %entity_id.short(), updated_at = record.updated_at, "Ignoring stale state");
                return Ok(ApplyOutcome::Stale);
            }
            ApplyCheck::Duplicate => {
                Counters::bump(&self.counters.duplicate);
                trace!(entity = %entity_id.short(), "Ignoring duplicate state");
                return Ok(ApplyOutcome::Duplicate);
            }
            ApplyCheck::Proceed => {}
        }

        let state = match self.codec.decode(&record.blob) {
            Ok(state) => state,
            Err(e) => {
                Counters::bump(&self.counters.decode_failures);
                warn!(entity = %entity_id.short(), error = %e, "Failed to decode state");
                return Err(e);
            }
        };

        self.tracker.record_apply(entity_id, record.updated_at, hash);
        owner.replace(state);

        if let Some(pattern) = self.cleanup.regex() {
            let pruned = owner.prune_matching(pattern);
            if pruned > 0 {
                debug!(entity = %entity_id.short(), pruned, "Pruned entries after apply");
            }
        }

        Counters::bump(&self.counters.applied);
        debug!(
            entity = %entity_id.short(),
            updated_at = record.updated_at,
            hash = %hash.short(),
            "Applied state"
        );
        Ok(ApplyOutcome::Applied)
    }

    /// Snapshot the owner and hand the save to the worker pool
    ///
    /// Never blocks on I/O. The worker skips the write when the content is
    /// unchanged or was just loaded, and publishes after a successful write.
    /// Entities that are not attached are refused; their tracking is gone.
    pub fn save<H>(&self, host: &H, entity_id: EntityId) -> SyncResult<SaveOutcome>
    where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        if !self.attached.contains_key(&entity_id) {
            debug!(entity = %entity_id.short(), "Refusing save for an entity not attached here");
            return Ok(SaveOutcome::NotAttached);
        }
        self.dispatch_save(host, entity_id, None)
    }

    /// Save every attached entity; one entity's failure does not stop the rest
    pub fn autosave<H>(&self, host: &H) -> usize
    where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        let mut dispatched = 0;
        for entity_id in self.attached.keys() {
            match self.save(host, *entity_id) {
                Ok(SaveOutcome::Dispatched) => dispatched += 1,
                Ok(SaveOutcome::OwnerUnavailable | SaveOutcome::NotAttached) => {}
                Err(e) => warn!(entity = %entity_id.short(), error = %e, "Autosave failed"),
            }
        }
        debug!(dispatched, "Autosave sweep");
        dispatched
    }

    /// Periodic signal from the host, on the owning thread
    ///
    /// Drains completed loads and remote changes, runs due join passes, then
    /// runs the autosave sweep when it is due.
    pub fn tick<H>(&mut self, host: &mut H)
    where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        self.drain_inbox(host);

        for pass in self.scheduler.tick() {
            self.run_join_pass(host, pass);
        }

        if let Some(interval) = self.config.autosave_interval_millis() {
            let now = self.clock.now_millis();
            if now.saturating_sub(self.last_autosave_at) >= interval {
                self.last_autosave_at = now;
                self.autosave(&*host);
            }
        }
    }

    /// Wait until no dispatched I/O is in flight
    pub async fn quiesce(&self) {
        self.in_flight.wait_idle().await;
    }

    /// Stop the engine
    ///
    /// Refuses new attachments, saves every attached entity, waits for I/O up
    /// to the shutdown timeout, then closes the bus and the store. Every step
    /// runs even when an earlier one failed.
    #[instrument(skip(self, host))]
    pub async fn shutdown<H>(&mut self, host: &H)
    where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        self.accepting = false;

        let attached: Vec<EntityId> = self.attached.keys().copied().collect();
        for entity_id in &attached {
            if let Err(e) = self.save(host, *entity_id) {
                warn!(entity = %entity_id.short(), error = %e, "Final save failed");
            }
        }
        self.scheduler.clear();

        if tokio::time::timeout(self.config.shutdown_timeout(), self.quiesce())
            .await
            .is_err()
        {
            warn!(pending = self.pending_io(), "Timed out waiting for in-flight I/O");
        }

        if let Some(bus) = &self.bus {
            bus.close().await;
        }

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close state store");
        }

        info!(saved = attached.len(), "Sync engine shut down");
    }

    fn dispatch_load(&self, entity_id: EntityId, generation: u64) {
        let store = self.store.clone();
        let inbox = self.inbox_tx.clone();
        let guard = self.in_flight.enter();

        self.runtime.handle.spawn(async move {
            let record = store.load(&entity_id).await;
            let loaded = Inbound::Loaded {
                entity_id,
                generation,
                record,
            };
            if inbox.send(loaded).await.is_err() {
                debug!(entity = %entity_id.short(), "Engine gone, dropping load result");
            }
            drop(guard);
        });
    }

    fn dispatch_save<H>(
        &self,
        host: &H,
        entity_id: EntityId,
        forget: Option<u64>,
    ) -> SyncResult<SaveOutcome>
    where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        let Some(owner) = host.owner(&entity_id) else {
            if let Some(generation) = forget {
                self.tracker.forget_if(&entity_id, generation);
            }
            debug!(entity = %entity_id.short(), "No owner to save");
            return Ok(SaveOutcome::OwnerUnavailable);
        };

        let blob = match self.codec.encode(&owner.snapshot()) {
            Ok(blob) => blob,
            Err(e) => {
                if let Some(generation) = forget {
                    self.tracker.forget_if(&entity_id, generation);
                }
                return Err(e);
            }
        };

        let job = SaveJob {
            entity_id,
            hash: ContentHash::of(&blob),
            blob,
            requested_at: self.clock.now_millis(),
            forget,
        };
        let worker = SaveWorker {
            tracker: self.tracker.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            counters: self.counters.clone(),
            grace_ms: self.config.grace_window_millis(),
        };
        let guard = self.in_flight.enter();

        Counters::bump(&self.counters.saves_dispatched);
        self.runtime.handle.spawn(async move {
            worker.run(job).await;
            drop(guard);
        });
        Ok(SaveOutcome::Dispatched)
    }

    fn drain_inbox<H>(&mut self, host: &mut H)
    where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        // Bounded so a busy bus cannot starve the rest of the tick
        for _ in 0..self.config.inbox_capacity {
            match self.inbox_rx.try_recv() {
                Ok(Inbound::Loaded {
                    entity_id,
                    generation,
                    record,
                }) => self.on_loaded(host, entity_id, generation, record),
                Ok(Inbound::Remote(record)) => self.on_remote(host, record),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn on_loaded<H>(
        &mut self,
        host: &mut H,
        entity_id: EntityId,
        generation: u64,
        record: Option<StateRecord>,
    ) where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        let Some(attachment) = self.attached.get_mut(&entity_id) else {
            trace!(entity = %entity_id.short(), "Load finished after detach");
            return;
        };
        if attachment.generation != generation {
            trace!(entity = %entity_id.short(), generation, "Load belongs to a previous attachment");
            return;
        }

        self.tracker.mark_loaded(entity_id, self.clock.now_millis());

        let Some(record) = record else {
            debug!(entity = %entity_id.short(), "No stored state");
            return;
        };
        let staged = attachment.stage(record);
        self.try_apply(host, &staged);
    }

    fn on_remote<H>(&mut self, host: &mut H, record: StateRecord)
    where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        let Some(attachment) = self.attached.get_mut(&record.entity_id) else {
            trace!(entity = %record.entity_id.short(), "Remote change for an entity not attached here");
            return;
        };
        let staged = attachment.stage(record);
        self.try_apply(host, &staged);
    }

    fn run_join_pass<H>(&self, host: &mut H, pass: JoinPass)
    where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        let staged = match self.attached.get(&pass.entity_id) {
            Some(attachment) if attachment.generation == pass.generation => attachment.staged.clone(),
            _ => return,
        };
        let Some(record) = staged else {
            trace!(entity = %pass.entity_id.short(), pass = pass.pass, "Nothing loaded yet");
            return;
        };

        trace!(entity = %pass.entity_id.short(), pass = pass.pass, "Join pass");
        self.try_apply(host, &record);
    }

    fn try_apply<H>(&self, host: &mut H, record: &StateRecord)
    where
        H: EntityHost,
        H::Owner: StateOwner<State = C::State>,
    {
        if let Err(e) = self.apply(host, record) {
            trace!(entity = %record.entity_id.short(), error = %e, "Staged record not applied");
        }
    }
}
