//! Save path: dedup, grace window, failure handling, detach

mod common;

use std::sync::Arc;

use blobsync_bus::MemoryTransport;
use blobsync_core::EntityId;
use blobsync_engine::{SaveOutcome, SyncConfig};
use blobsync_storage::{InMemoryStateStore, StateStore};
use common::{Node, NotesOwner, record};

fn node_with_bus() -> (Node, Arc<InMemoryStateStore>, Arc<MemoryTransport>) {
    let store = Arc::new(InMemoryStateStore::new());
    let hub = Arc::new(MemoryTransport::new());
    let node = Node::new(SyncConfig::testing(), store.clone(), Some(hub.clone()), 1_000);
    (node, store, hub)
}

/// Attach `id` with `owner` on a node whose store has nothing for it
async fn attach_fresh(node: &mut Node, id: EntityId, owner: NotesOwner) {
    node.engine.attach(id).unwrap();
    node.owners.insert(id, owner);
    node.engine.quiesce().await;
    node.tick();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_identical_saves_write_once() {
    let (mut node, store, hub) = node_with_bus();
    let id = EntityId::generate();
    attach_fresh(&mut node, id, NotesOwner::with(&[("a", "1")])).await;

    assert_eq!(node.save(id), SaveOutcome::Dispatched);
    assert_eq!(node.save(id), SaveOutcome::Dispatched);
    node.engine.quiesce().await;

    assert_eq!(store.write_count(), 1);
    assert_eq!(hub.published_count(), 1);

    let stats = node.engine.stats();
    assert_eq!(stats.saves_dispatched, 2);
    assert_eq!(stats.saves_persisted, 1);
    assert_eq!(stats.saves_skipped_unchanged, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_stamps_request_time() {
    let (mut node, store, _) = node_with_bus();
    let id = EntityId::generate();
    attach_fresh(&mut node, id, NotesOwner::with(&[("a", "1")])).await;

    node.clock.set(42_000);
    node.save(id);
    node.engine.quiesce().await;

    let stored = store.get(&id).unwrap();
    assert_eq!(stored.updated_at, 42_000);
    assert_eq!(
        node.engine.tracker().get(&id).unwrap().last_saved_hash,
        Some(stored.content_hash())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_changed_content_saves_again() {
    let (mut node, store, _) = node_with_bus();
    let id = EntityId::generate();
    attach_fresh(&mut node, id, NotesOwner::with(&[("a", "1")])).await;

    node.save(id);
    node.engine.quiesce().await;
    node.owners.get_mut(&id).unwrap().set("a", "2");
    node.clock.advance(10);
    node.save(id);
    node.engine.quiesce().await;

    assert_eq!(store.write_count(), 2);
    assert_eq!(store.get(&id).unwrap().updated_at, 1_010);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_grace_window_after_load() {
    let store = Arc::new(InMemoryStateStore::new());
    let id = EntityId::generate();
    store.save(id, record(id, &[("title", "stored")], 500).blob, Some(500))
        .await
        .unwrap();

    let mut node = Node::new(
        SyncConfig::testing().with_bus_enabled(false),
        store.clone(),
        None,
        1_000,
    );
    node.owners.insert(id, NotesOwner::default());
    node.engine.attach(id).unwrap();
    node.engine.quiesce().await;
    node.tick();
    assert_eq!(node.notes(&id).unwrap()["title"], "stored");

    // Unchanged content one millisecond after the load
    node.clock.advance(1);
    node.save(id);
    node.engine.quiesce().await;
    assert_eq!(node.engine.stats().saves_skipped_grace, 1);
    assert_eq!(store.write_count(), 1);

    // Changed content inside the window still saves
    node.owners.get_mut(&id).unwrap().set("title", "edited");
    node.save(id);
    node.engine.quiesce().await;
    assert_eq!(node.engine.stats().saves_persisted, 1);
    assert_eq!(store.write_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unchanged_after_grace_is_still_deduplicated() {
    let store = Arc::new(InMemoryStateStore::new());
    let id = EntityId::generate();
    store.save(id, record(id, &[("k", "v")], 500).blob, Some(500))
        .await
        .unwrap();

    let mut node = Node::new(
        SyncConfig::testing().with_bus_enabled(false),
        store.clone(),
        None,
        1_000,
    );
    node.owners.insert(id, NotesOwner::default());
    node.engine.attach(id).unwrap();
    node.engine.quiesce().await;
    node.tick();

    node.clock.advance(60_000);
    node.save(id);
    node.engine.quiesce().await;

    let stats = node.engine.stats();
    assert_eq!(stats.saves_skipped_grace, 0);
    assert_eq!(stats.saves_skipped_unchanged, 1);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_write_is_retried_and_not_published() {
    let (mut node, store, hub) = node_with_bus();
    let id = EntityId::generate();
    attach_fresh(&mut node, id, NotesOwner::with(&[("a", "1")])).await;

    store.set_failing(true);
    node.save(id);
    node.engine.quiesce().await;
    assert_eq!(node.engine.stats().save_failures, 1);
    assert_eq!(hub.published_count(), 0);

    store.set_failing(false);
    node.save(id);
    node.engine.quiesce().await;
    assert_eq!(node.engine.stats().saves_persisted, 1);
    assert_eq!(hub.published_count(), 1);
    assert!(store.get(&id).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_without_owner() {
    let (mut node, store, _) = node_with_bus();
    let id = EntityId::generate();
    node.engine.attach(id).unwrap();

    assert_eq!(node.save(id), SaveOutcome::OwnerUnavailable);
    node.engine.quiesce().await;
    assert!(store.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_refuses_unattached_entity() {
    let (mut node, store, hub) = node_with_bus();
    let id = EntityId::generate();
    node.owners.insert(id, NotesOwner::with(&[("a", "1")]));

    assert_eq!(node.save(id), SaveOutcome::NotAttached);
    node.engine.quiesce().await;

    assert!(store.is_empty());
    assert_eq!(hub.published_count(), 0);
    assert_eq!(node.engine.stats().saves_dispatched, 0);
    assert!(node.engine.tracker().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_after_detach_leaves_no_tracking() {
    let (mut node, store, _) = node_with_bus();
    let id = EntityId::generate();
    attach_fresh(&mut node, id, NotesOwner::with(&[("a", "1")])).await;

    node.engine.detach(&node.owners, id).unwrap();
    node.engine.quiesce().await;
    assert_eq!(store.write_count(), 1);

    node.owners.get_mut(&id).unwrap().set("a", "late edit");
    assert_eq!(node.save(id), SaveOutcome::NotAttached);
    node.engine.quiesce().await;

    let stats = node.engine.stats();
    assert_eq!(stats.attached, 0);
    assert_eq!(stats.tracked, 0);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_saves_in_flight_during_detach_do_not_leak_tracking() {
    let (mut node, store, _) = node_with_bus();
    let id = EntityId::generate();
    node.owners.insert(id, NotesOwner::default());

    for round in 0..300 {
        node.engine.attach(id).unwrap();
        node.owners.get_mut(&id).unwrap().set("round", &round.to_string());
        node.save(id);
        node.owners.get_mut(&id).unwrap().set("after", &round.to_string());
        // Detach while the save above may still be queued on a worker
        node.engine.detach(&node.owners, id).unwrap();
        node.engine.quiesce().await;
        node.tick();

        assert!(
            node.engine.tracker().get(&id).is_none(),
            "tracking leaked after round {round}"
        );
    }

    let stats = node.engine.stats();
    assert_eq!(stats.tracked, 0);
    assert_eq!(stats.attached, 0);
    assert!(store.get(&id).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detach_saves_and_releases_tracking() {
    let (mut node, store, _) = node_with_bus();
    let id = EntityId::generate();

    node.engine.attach(id).unwrap();
    node.owners.insert(id, NotesOwner::with(&[("draft", "unsaved")]));
    node.engine.quiesce().await;
    node.tick();

    node.engine.detach(&node.owners, id).unwrap();
    node.engine.quiesce().await;

    assert_eq!(store.get(&id).unwrap().blob, record(id, &[("draft", "unsaved")], 0).blob);
    assert!(!node.engine.is_attached(&id));
    assert!(node.engine.tracker().get(&id).is_none());
    assert_eq!(node.engine.pending_join_passes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detach_without_save() {
    let store = Arc::new(InMemoryStateStore::new());
    let config = SyncConfig::testing()
        .with_bus_enabled(false)
        .with_save_on_detach(false);
    let mut node = Node::new(config, store.clone(), None, 0);
    let id = EntityId::generate();

    node.engine.attach(id).unwrap();
    node.owners.insert(id, NotesOwner::with(&[("a", "1")]));
    node.engine.detach(&node.owners, id).unwrap();
    node.engine.quiesce().await;

    assert!(store.is_empty());
    assert!(node.engine.tracker().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reattach_keeps_new_tracking() {
    let (mut node, _, _) = node_with_bus();
    let id = EntityId::generate();
    node.owners.insert(id, NotesOwner::with(&[("a", "1")]));

    node.engine.attach(id).unwrap();
    node.engine.detach(&node.owners, id).unwrap();
    node.engine.attach(id).unwrap();
    node.engine.quiesce().await;

    let entry = node.engine.tracker().get(&id).unwrap();
    assert_eq!(entry.generation, 2);
    assert!(node.engine.is_attached(&id));
}
