//! Pre-defined replication scenarios
//!
//! Each scenario drives a [`Cluster`], checks whether every server ended up
//! with the expected state and returns a [`ScenarioReport`].

use std::fmt;

use blobsync_core::EntityId;
use blobsync_engine::{CleanupFilter, EngineStats};
use tracing::{info, warn};

use crate::cluster::{Cluster, ClusterOptions};
use crate::types::{CURSOR_PREFIX, Document, without_matching};

/// Outcome of one scenario run
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    /// Every check the scenario made held
    pub converged: bool,
    pub entities: usize,
    pub records_stored: u64,
    pub messages_published: u64,
    pub servers: Vec<(char, EngineStats)>,
    pub notes: Vec<String>,
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} ===", self.scenario)?;
        writeln!(f, "  converged:          {}", self.converged)?;
        writeln!(f, "  entities:           {}", self.entities)?;
        writeln!(f, "  records stored:     {}", self.records_stored)?;
        writeln!(f, "  messages published: {}", self.messages_published)?;
        for (name, stats) in &self.servers {
            writeln!(
                f,
                "  server {name}: applied={} stale={} duplicate={} persisted={} skipped={} echo_dropped={}",
                stats.applied,
                stats.stale,
                stats.duplicate,
                stats.saves_persisted,
                stats.saves_skipped_grace + stats.saves_skipped_unchanged,
                stats.self_echo_discarded,
            )?;
        }
        for note in &self.notes {
            writeln!(f, "  - {note}")?;
        }
        Ok(())
    }
}

struct Tally {
    converged: bool,
    notes: Vec<String>,
}

impl Tally {
    fn new() -> Self {
        Self {
            converged: true,
            notes: Vec::new(),
        }
    }

    fn check(&mut self, ok: bool, what: impl Into<String>) {
        if !ok {
            let what = what.into();
            warn!(check = %what, "Check failed");
            self.notes.push(format!("FAILED: {what}"));
            self.converged = false;
        }
    }

    fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

async fn finish(
    cluster: Cluster,
    scenario: &'static str,
    entities: usize,
    tally: Tally,
) -> anyhow::Result<ScenarioReport> {
    let records_stored = cluster.records_stored()?;
    let hub = cluster.hub();
    let servers = cluster.shutdown().await?;
    let messages_published = hub.published_count();

    Ok(ScenarioReport {
        scenario,
        converged: tally.converged,
        entities,
        records_stored,
        messages_published,
        servers,
        notes: tally.notes,
    })
}

async fn join_all(cluster: &mut Cluster, entity_id: EntityId) -> anyhow::Result<bool> {
    for index in 0..cluster.len() {
        cluster.server_mut(index).join(entity_id)?;
    }
    Ok(cluster
        .run_until(|c| c.servers().iter().all(|s| s.has_loaded(&entity_id)))
        .await)
}

/// An entity moves from server to server around the cluster
///
/// The holder edits the document, including a per-server cursor field, then
/// leaves; the next server joins and must load exactly the shared part of
/// what the previous holder saved.
pub async fn run_handoff(options: ClusterOptions, hops: usize) -> anyhow::Result<ScenarioReport> {
    info!("=== Running handoff scenario ===");
    let cleanup = CleanupFilter::new(options.sync.post_apply_cleanup.clone());
    let mut cluster = Cluster::start(options).await?;
    let mut tally = Tally::new();
    let entity = EntityId::generate();

    let mut holder = 0;
    cluster.server_mut(holder).join(entity)?;
    let loaded = cluster.run_until(|c| c.server(0).has_loaded(&entity)).await;
    tally.check(loaded, "first holder finished its join load");

    for hop in 0..hops {
        let name = cluster.server(holder).name();
        let server = cluster.server_mut(holder);
        server.edit(entity, "hop", hop.to_string());
        server.edit(entity, format!("written-by-{name}"), hop.to_string());
        server.edit(entity, format!("{CURSOR_PREFIX}{name}"), format!("{}", hop * 7));
        let expected = server
            .owner(&entity)
            .map(|owner| owner.shared_view(cleanup.regex()))
            .unwrap_or_default();

        cluster.advance_clock(1_000);
        cluster.server_mut(holder).leave(entity)?;
        cluster.quiesce().await;
        let heard = cluster.settle().await;
        tally.check(heard, format!("hop {hop}: every server heard {name}'s save"));

        let next = (holder + 1) % cluster.len();
        cluster.server_mut(next).join(entity)?;
        let arrived = cluster
            .run_until(|c| c.server(next).document(&entity) == Some(&expected))
            .await;
        let next_name = cluster.server(next).name();
        tally.check(arrived, format!("hop {hop}: {name} -> {next_name} carried the document"));
        info!(hop, from = %name, to = %next_name, arrived, "Handoff");

        holder = next;
    }

    let final_view = cluster
        .server(holder)
        .owner(&entity)
        .map(|owner| owner.shared_view(cleanup.regex()));
    let stored = cluster.stored_document(&entity).await?;
    tally.check(
        stored.map(|document| without_matching(&document, cleanup.regex())) == final_view,
        "store matches the final holder",
    );
    tally.note(format!("{hops} hops, final holder {}", cluster.server(holder).name()));

    finish(cluster, "handoff", 1, tally).await
}

/// Servers take turns writing one shared entity while the others hold
/// unsaved local drafts; every server must end on the last writer's state
pub async fn run_contention(options: ClusterOptions, rounds: usize) -> anyhow::Result<ScenarioReport> {
    info!("=== Running contention scenario ===");
    let mut cluster = Cluster::start(options).await?;
    let mut tally = Tally::new();
    let entity = EntityId::generate();

    let joined = join_all(&mut cluster, entity).await?;
    tally.check(joined, "every server finished its join load");

    let mut last_written = Document::new();
    for round in 0..rounds {
        let writer = round % cluster.len();
        let writer_name = cluster.server(writer).name();

        for index in 0..cluster.len() {
            let server = cluster.server_mut(index);
            let name = server.name();
            server.edit(entity, "value", format!("{name}-draft-{round}"));
        }

        cluster.advance_clock(250);
        let server = cluster.server_mut(writer);
        server.edit(entity, "value", format!("{writer_name}-{round}"));
        server.edit(entity, "round", round.to_string());
        server.save(entity)?;
        last_written = server.document(&entity).cloned().unwrap_or_default();

        let settled = cluster
            .run_until(|c| {
                c.servers()
                    .iter()
                    .all(|s| s.document(&entity) == Some(&last_written))
            })
            .await;
        tally.check(settled, format!("round {round}: all servers adopted {writer_name}'s write"));
        cluster.settle().await;
    }

    let stored = cluster.stored_document(&entity).await?;
    tally.check(
        stored.as_ref() == Some(&last_written),
        "store holds the last writer's state",
    );
    tally.note(format!("{rounds} rounds over {} servers", cluster.len()));

    finish(cluster, "contention", 1, tally).await
}

/// Many short-lived entities pass through one server; tracking must be
/// released as they leave
pub async fn run_churn(
    options: ClusterOptions,
    batches: usize,
    per_batch: usize,
) -> anyhow::Result<ScenarioReport> {
    info!("=== Running churn scenario ===");
    let mut cluster = Cluster::start(options).await?;
    let mut tally = Tally::new();
    let mut peak_tracked = 0;
    let records_before = cluster.records_stored()?;

    for batch in 0..batches {
        let entities: Vec<EntityId> = (0..per_batch).map(|_| EntityId::generate()).collect();

        for entity in &entities {
            cluster.server_mut(0).join(*entity)?;
        }
        let loaded = cluster
            .run_until(|c| entities.iter().all(|e| c.server(0).has_loaded(e)))
            .await;
        tally.check(loaded, format!("batch {batch}: join loads finished"));

        cluster.advance_clock(100);
        for (slot, entity) in entities.iter().enumerate() {
            cluster
                .server_mut(0)
                .edit(*entity, "slot", format!("{batch}/{slot}"));
        }
        peak_tracked = peak_tracked.max(cluster.server(0).tracked());

        for entity in &entities {
            cluster.server_mut(0).leave(*entity)?;
        }
        cluster.quiesce().await;
        cluster.tick();
    }

    let churner = cluster.server(0);
    tally.check(churner.tracked() == 0, "tracking released for departed entities");
    tally.check(churner.engine().attached().count() == 0, "no attachments left");
    tally.check(churner.engine().pending_join_passes() == 0, "no join passes left");

    let total = batches * per_batch;
    let added = cluster.records_stored()? - records_before;
    tally.check(added == total as u64, format!("{total} records persisted"));
    tally.note(format!("peak tracked entities: {peak_tracked}"));

    finish(cluster, "churn", total, tally).await
}
