//! Two engines sharing one store and one bus

mod common;

use std::sync::Arc;

use blobsync_bus::MemoryTransport;
use blobsync_core::EntityId;
use blobsync_engine::{SyncConfig, SyncError};
use blobsync_storage::InMemoryStateStore;
use common::{Node, NotesOwner, notes, record};

struct Cluster {
    a: Node,
    b: Node,
    store: Arc<InMemoryStateStore>,
    hub: Arc<MemoryTransport>,
}

async fn cluster() -> Cluster {
    let store = Arc::new(InMemoryStateStore::new());
    let hub = Arc::new(MemoryTransport::new());
    let a = Node::new(SyncConfig::testing(), store.clone(), Some(hub.clone()), 10_000);
    let b = Node::new(SyncConfig::testing(), store.clone(), Some(hub.clone()), 10_000);
    a.engine.start().await.unwrap();
    b.engine.start().await.unwrap();
    Cluster { a, b, store, hub }
}

/// Attach with an empty owner and let the join load settle
async fn join(node: &mut Node, id: EntityId) {
    node.engine.attach(id).unwrap();
    node.owners.insert(id, NotesOwner::default());
    node.engine.quiesce().await;
    node.tick();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_change_on_one_process_reaches_the_other() {
    let Cluster {
        mut a, mut b, store, ..
    } = cluster().await;
    let id = EntityId::generate();

    join(&mut a, id).await;
    join(&mut b, id).await;

    a.owners.get_mut(&id).unwrap().set("title", "from a");
    a.clock.advance(5);
    a.save(id);
    a.engine.quiesce().await;

    let expected = notes(&[("title", "from a")]);
    assert!(b.tick_until(|n| n.notes(&id) == Some(&expected)).await);
    assert_eq!(store.get(&id).unwrap().updated_at, 10_005);
    assert!(b.engine.stats().remote_received >= 1);

    // The publisher hears its own message and drops it before apply
    assert!(a.tick_until(|n| n.engine.stats().self_echo_discarded == 1).await);
    assert_eq!(a.engine.stats().applied, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_applied_remote_change_is_not_rebroadcast() {
    let Cluster {
        mut a, mut b, store, hub,
    } = cluster().await;
    let id = EntityId::generate();

    join(&mut a, id).await;
    join(&mut b, id).await;

    a.owners.get_mut(&id).unwrap().set("k", "v");
    a.save(id);
    a.engine.quiesce().await;
    assert!(b.tick_until(|n| n.engine.stats().applied == 1).await);

    // B saving the state it just received writes and publishes nothing
    b.clock.advance(60_000);
    b.save(id);
    b.engine.autosave(&b.owners);
    b.engine.quiesce().await;

    assert_eq!(store.write_count(), 1);
    assert_eq!(hub.published_count(), 1);
    assert_eq!(b.engine.stats().saves_persisted, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_own_origin_never_reaches_apply() {
    let Cluster { mut a, .. } = cluster().await;
    let id = EntityId::generate();
    a.engine.attach(id).unwrap();
    a.owners.insert(id, NotesOwner::with(&[("local", "state")]));

    let forged = record(id, &[("echo", "x")], 99_999);
    a.engine
        .bus()
        .unwrap()
        .publish(id, &forged.blob, forged.updated_at)
        .await;

    assert!(a.tick_until(|n| n.engine.stats().self_echo_discarded == 1).await);
    assert_eq!(a.notes(&id).unwrap(), &notes(&[("local", "state")]));
    assert_eq!(a.engine.stats().remote_received, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_change_for_unattached_entity_is_ignored() {
    let Cluster { mut a, mut b, .. } = cluster().await;
    let id = EntityId::generate();

    a.engine.attach(id).unwrap();
    a.owners.insert(id, NotesOwner::with(&[("a", "1")]));
    b.owners.insert(id, NotesOwner::default());

    a.save(id);
    a.engine.quiesce().await;

    assert!(b.tick_until(|n| n.engine.stats().remote_received == 1).await);
    b.tick();
    assert!(b.notes(&id).unwrap().is_empty());
    assert_eq!(b.engine.stats().applied, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_newer_remote_state_wins() {
    let Cluster { mut a, mut b, .. } = cluster().await;
    let id = EntityId::generate();
    join(&mut a, id).await;
    join(&mut b, id).await;

    b.clock.set(15_000);
    b.owners.get_mut(&id).unwrap().set("v", "from b");
    b.save(id);
    b.engine.quiesce().await;
    assert!(a.tick_until(|n| n.notes(&id).unwrap().get("v").map(String::as_str) == Some("from b")).await);

    a.clock.set(20_000);
    a.owners.get_mut(&id).unwrap().set("v", "from a");
    a.save(id);
    a.engine.quiesce().await;
    assert!(b.tick_until(|n| n.notes(&id).unwrap()["v"] == "from a").await);

    // Replaying the older state is rejected
    let replay = record(id, &[("v", "from b")], 15_000);
    assert_eq!(b.apply(&replay).unwrap(), blobsync_engine::ApplyOutcome::Stale);
    assert_eq!(b.notes(&id).unwrap()["v"], "from a");
}

#[tokio::test]
async fn test_start_twice_fails() {
    let Cluster { a, .. } = cluster().await;
    assert!(matches!(a.engine.start().await, Err(SyncError::Bus(_))));
}

#[tokio::test]
async fn test_bus_disabled_publishes_nothing() {
    let store = Arc::new(InMemoryStateStore::new());
    let hub = Arc::new(MemoryTransport::new());
    let mut node = Node::new(
        SyncConfig::testing().with_bus_enabled(false),
        store.clone(),
        Some(hub.clone()),
        0,
    );
    node.engine.start().await.unwrap();
    assert!(node.engine.bus().is_none());

    let id = EntityId::generate();
    node.engine.attach(id).unwrap();
    node.owners.insert(id, NotesOwner::with(&[("a", "1")]));
    node.save(id);
    node.engine.quiesce().await;

    assert_eq!(store.write_count(), 1);
    assert_eq!(hub.published_count(), 0);
}
