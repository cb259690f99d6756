use futures::future::join_all;
use mqttpool_cluster::{KeySpace, LeaseLock, PEER_LIVENESS_LEASE};
use mqttpool_common::CoordinationStore;
use mqttpool_storage::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

fn lease(store: &MemoryStore, ttl: Duration) -> LeaseLock {
    LeaseLock::new(
        Arc::new(store.clone()),
        &KeySpace::new("test:"),
        PEER_LIVENESS_LEASE,
        ttl,
        Duration::from_millis(10),
    )
}

#[tokio::test]
async fn test_concurrent_acquire_has_single_winner() {
    let store = MemoryStore::new();

    for _ in 0..20 {
        let contenders: Vec<LeaseLock> = (0..8)
            .map(|_| lease(&store, Duration::from_secs(5)))
            .collect();

        let results = join_all(contenders.iter().map(|lock| lock.try_acquire())).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);

        for lock in &contenders {
            if lock.is_held().await {
                lock.release().await.unwrap();
            }
        }
    }
}

#[tokio::test]
async fn test_concurrent_acquire_across_tasks() {
    let store = MemoryStore::new();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let lock = lease(&store, Duration::from_secs(5));
            tokio::spawn(async move { lock.try_acquire().await.unwrap() })
        })
        .collect();

    let winners = join_all(handles)
        .await
        .into_iter()
        .filter(|won| *won.as_ref().unwrap())
        .count();
    assert_eq!(winners, 1);
}

/// A holder whose critical section outlives the TTL overlaps with the next
/// holder. This is the documented cost of a lease without renewal.
#[tokio::test]
async fn test_overrunning_holder_overlaps_with_next() {
    let store = MemoryStore::new();
    let slow = lease(&store, Duration::from_millis(50));
    let next = lease(&store, Duration::from_secs(5));

    assert!(slow.try_acquire().await.unwrap());
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(next.try_acquire().await.unwrap());
    assert!(slow.is_held().await);
    assert!(next.is_held().await);

    // The late release must not delete the new holder's lease
    slow.release().await.unwrap();
    assert!(store
        .get("test:lease:peer-liveness")
        .await
        .unwrap()
        .is_some());

    let third = lease(&store, Duration::from_secs(5));
    assert!(!third.try_acquire().await.unwrap());

    next.release().await.unwrap();
    assert!(third.try_acquire().await.unwrap());
}

#[tokio::test]
#[should_panic(expected = "released while not held")]
async fn test_release_without_acquire_panics() {
    let store = MemoryStore::new();
    let lock = lease(&store, Duration::from_secs(5));
    let _ = lock.release().await;
}

#[tokio::test]
#[should_panic(expected = "released while not held")]
async fn test_double_release_panics() {
    let store = MemoryStore::new();
    let lock = lease(&store, Duration::from_secs(5));

    assert!(lock.try_acquire().await.unwrap());
    lock.release().await.unwrap();
    let _ = lock.release().await;
}
