//! Stress tests for blobsync-storage
//!
//! These tests verify the one-record-per-entity invariant under concurrent
//! writers, for both backends.

use std::sync::Arc;
use std::time::Instant;

use blobsync_core::EntityId;
use blobsync_storage::{InMemoryStateStore, RedbStateStore, RedbStoreConfig, StateStore};
use tempfile::TempDir;

// ============================================================================
// Concurrent writers
// ============================================================================

async fn hammer(store: Arc<dyn StateStore>, entities: &[EntityId], writers: usize, rounds: i64) {
    let mut handles = Vec::new();

    for writer in 0..writers {
        let store = store.clone();
        let entities = entities.to_vec();
        handles.push(tokio::spawn(async move {
            for round in 0..rounds {
                for entity in &entities {
                    let blob = format!("w{writer}-r{round}").into_bytes();
                    store
                        .save(*entity, blob, Some(round))
                        .await
                        .expect("save failed");
                }
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
}

/// Many writers on the same entities still leave exactly one record each
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_store_concurrent_upserts() {
    let store = Arc::new(InMemoryStateStore::new());
    let entities: Vec<_> = (0..20).map(|_| EntityId::generate()).collect();

    let start = Instant::now();
    hammer(store.clone(), &entities, 8, 50).await;
    println!("8 writers x 50 rounds x 20 entities in {:?}", start.elapsed());

    assert_eq!(store.len(), entities.len());
    assert_eq!(store.write_count(), 8 * 50 * 20);

    for entity in &entities {
        let record = store.load(entity).await.unwrap();
        // Whichever write landed last, blob and timestamp come from the same write
        let suffix = format!("-r{}", record.updated_at);
        assert!(record.blob.ends_with(suffix.as_bytes()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redb_store_concurrent_upserts() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(
        RedbStateStore::open(RedbStoreConfig::with_path(temp_dir.path().join("stress.redb")))
            .unwrap(),
    );
    let entities: Vec<_> = (0..5).map(|_| EntityId::generate()).collect();

    hammer(store.clone(), &entities, 4, 10).await;

    assert_eq!(store.record_count().unwrap(), entities.len() as u64);
    for entity in &entities {
        let record = store.lookup(entity).await.unwrap().unwrap();
        assert!((0..10).contains(&record.updated_at));
        let suffix = format!("-r{}", record.updated_at);
        assert!(record.blob.ends_with(suffix.as_bytes()));
    }
}

/// A store shared by several "processes" sees every process's writes
#[tokio::test]
async fn test_shared_store_between_handles() {
    let store = Arc::new(InMemoryStateStore::new());
    let a: Arc<dyn StateStore> = store.clone();
    let b: Arc<dyn StateStore> = store.clone();
    let entity = EntityId::generate();

    a.save(entity, b"from-a".to_vec(), Some(1)).await.unwrap();
    assert_eq!(b.load(&entity).await.unwrap().blob, b"from-a");

    b.save(entity, b"from-b".to_vec(), Some(2)).await.unwrap();
    assert_eq!(a.load(&entity).await.unwrap().blob, b"from-b");
}
