mod common;

use common::{assignment, wait_until, TestCluster};
use mqttpool_cluster::{LeaseOutcome, PEER_LIVENESS_LEASE};
use mqttpool_common::CoordinationStore;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_eviction_requeues_exactly_bound_ids() {
    let cluster = TestCluster::new();
    let a = cluster.node("a", 10);
    let x = cluster.node("x", 10);

    x.ctx().registry.publish(&x.ctx().local).await.unwrap();
    for id in ["c1", "c2", "c3"] {
        x.manager.create_connection(assignment(id)).await.unwrap();
    }
    a.manager.create_connection(assignment("keep")).await.unwrap();
    a.ctx().pool.submit_pending(&assignment("already-pending")).await.unwrap();

    let report = a.manager.failover().evict("x").await.unwrap();

    assert_eq!(report.requeued, vec!["c1", "c2", "c3"]);
    assert!(report.corrupt.is_empty());
    assert!(report.removed_from_catalog);

    let pool = &a.ctx().pool;
    let pending: BTreeSet<String> = pool.pending().await.unwrap().into_iter().map(|p| p.id).collect();
    let expected: BTreeSet<String> = ["c1", "c2", "c3", "already-pending"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(pending, expected);

    assert!(pool.bound_ids("x").await.unwrap().is_empty());
    assert_eq!(pool.usage("x").await.unwrap(), 0);
    assert_eq!(pool.bound_ids("a").await.unwrap(), vec!["keep"]);
    assert_eq!(pool.usage("a").await.unwrap(), 1);
    assert!(a.ctx().registry.get_peer("mqtt", "x").await.unwrap().is_none());
}

#[tokio::test]
async fn test_eviction_is_idempotent() {
    let cluster = TestCluster::new();
    let a = cluster.node("a", 10);
    let x = cluster.node("x", 10);

    x.ctx().registry.publish(&x.ctx().local).await.unwrap();
    x.manager.create_connection(assignment("c1")).await.unwrap();

    let first = a.manager.failover().evict("x").await.unwrap();
    let second = a.manager.failover().evict("x").await.unwrap();

    assert!(first.removed_from_catalog);
    assert!(!second.removed_from_catalog);
    assert!(second.requeued.is_empty());
    assert_eq!(a.ctx().pool.pending().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_eviction_skips_corrupt_entries() {
    let cluster = TestCluster::new();
    let a = cluster.node("a", 10);
    let x = cluster.node("x", 10);

    x.ctx().registry.publish(&x.ctx().local).await.unwrap();
    x.manager.create_connection(assignment("c1")).await.unwrap();
    x.manager.create_connection(assignment("c2")).await.unwrap();
    cluster
        .store
        .hash_set("test:assignments:bound", "c1", "{truncated")
        .await
        .unwrap();

    let report = a.manager.failover().evict("x").await.unwrap();

    assert_eq!(report.requeued, vec!["c2"]);
    assert_eq!(report.corrupt, vec!["c1"]);
    assert!(report.removed_from_catalog);
    assert_eq!(a.ctx().pool.usage("x").await.unwrap(), 0);
}

#[tokio::test]
async fn test_eviction_store_failure_keeps_node_listed() {
    let cluster = TestCluster::new();
    let a = cluster.node("a", 10);
    let x = cluster.node("x", 10);

    x.ctx().registry.publish(&x.ctx().local).await.unwrap();
    cluster.store.set_unavailable(true);
    assert!(a.manager.failover().evict("x").await.is_err());
    cluster.store.set_unavailable(false);

    assert!(a.ctx().registry.get_peer("mqtt", "x").await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_probe_evicts_and_notifies() {
    let cluster = TestCluster::new();
    let a = cluster.node("a", 10);
    let b = cluster.node("b", 10);
    let c = cluster.node("c", 10);

    for node in [&a, &b, &c] {
        node.ctx().registry.publish(&node.ctx().local).await.unwrap();
    }
    c.manager.create_connection(assignment("c1")).await.unwrap();
    cluster.peers.kill("c");

    let outcome = a.manager.failover().probe_peers_once().await.unwrap();
    let reports = outcome.completed().unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].node, "c");
    assert_eq!(reports[0].requeued, vec!["c1"]);

    let peers = cluster.peers.clone();
    assert!(
        wait_until(Duration::from_secs(1), || {
            let peers = peers.clone();
            async move { peers.notices() == vec![("b".to_string(), "c".to_string())] }
        })
        .await
    );

    // The lease was released after the pass
    assert!(cluster
        .store
        .get("test:lease:peer-liveness")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_probe_skipped_while_lease_contended() {
    let cluster = TestCluster::new();
    let a = cluster.node("a", 10);
    let x = cluster.node("x", 10);

    x.ctx().registry.publish(&x.ctx().local).await.unwrap();
    cluster.peers.kill("x");

    let other = a.ctx().lease(PEER_LIVENESS_LEASE);
    assert!(other.try_acquire().await.unwrap());

    let outcome = a.manager.failover().probe_peers_once().await.unwrap();
    assert!(matches!(outcome, LeaseOutcome::Contended));
    assert!(a.ctx().registry.get_peer("mqtt", "x").await.unwrap().is_some());

    other.release().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_expiry_triggers_eviction() {
    let cluster = TestCluster::new();
    let a = cluster.node("a", 2);
    let b = cluster.node("b", 3);

    let cancel = CancellationToken::new();
    let listener = {
        let manager = b.manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.failover().run_expiry_listener(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    a.manager.create_connection(assignment("c1")).await.unwrap();
    a.manager.create_connection(assignment("c2")).await.unwrap();
    a.ctx().registry.publish(&a.ctx().local).await.unwrap();

    // No further heartbeats: the 60ms heartbeat lapses
    let ctx = b.ctx().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let ctx = ctx.clone();
            async move { ctx.pool.pending().await.unwrap().len() == 2 }
        })
        .await
    );

    assert!(b.ctx().registry.get_peer("mqtt", "a").await.unwrap().is_none());
    assert!(b.ctx().pool.bound_ids("a").await.unwrap().is_empty());
    assert_eq!(b.ctx().pool.usage("a").await.unwrap(), 0);

    cancel.cancel();
    listener.await.unwrap();
}

#[tokio::test]
async fn test_expiry_listener_resubscribes_after_loss() {
    let cluster = TestCluster::new();
    let a = cluster.node("a", 2);
    let b = cluster.node("b", 3);

    let cancel = CancellationToken::new();
    let listener = {
        let manager = b.manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.failover().run_expiry_listener(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    cluster.store.sever_subscriptions();
    tokio::time::sleep(Duration::from_millis(100)).await;

    a.manager.create_connection(assignment("c1")).await.unwrap();
    a.ctx().registry.publish(&a.ctx().local).await.unwrap();

    let ctx = b.ctx().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let ctx = ctx.clone();
            async move { ctx.pool.get_pending("c1").await.unwrap().is_some() }
        })
        .await
    );

    cancel.cancel();
    listener.await.unwrap();
}

#[tokio::test]
async fn test_startup_requeues_own_leftovers() {
    let cluster = TestCluster::new();
    let a = cluster.node("a", 5);
    a.manager.create_connection(assignment("c1")).await.unwrap();
    a.manager.create_connection(assignment("c2")).await.unwrap();

    let restarted = cluster.node("a", 5);
    let requeued = restarted.manager.failover().requeue_local().await.unwrap();

    assert_eq!(requeued, vec!["c1", "c2"]);
    assert_eq!(restarted.ctx().pool.usage("a").await.unwrap(), 0);
    assert!(restarted.ctx().pool.bound_ids("a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_eviction_requeues_unfinished_admission() {
    let cluster = TestCluster::new();
    let a = cluster.node("a", 5);
    let x = cluster.node("x", 5);
    x.ctx().registry.publish(&x.ctx().local).await.unwrap();

    // x claimed c1 and then died before its driver connected
    let pool = &a.ctx().pool;
    pool.submit_pending(&assignment("c1")).await.unwrap();
    assert!(pool.reserve(&assignment("c1"), "x").await.unwrap());
    pool.increment_usage("x").await.unwrap();

    let report = a.manager.failover().evict("x").await.unwrap();

    assert_eq!(report.requeued, vec!["c1"]);
    assert!(!pool.is_bound("c1").await.unwrap());
    assert!(pool.get_pending("c1").await.unwrap().unwrap().bound_node.is_none());
    assert!(pool.bound_ids("x").await.unwrap().is_empty());
    assert_eq!(pool.usage("x").await.unwrap(), 0);

    // The id can be admitted again
    assert_eq!(a.manager.create_connection(assignment("c1")).await.unwrap(), 1);
}
