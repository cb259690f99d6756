//! Simulated multi-node cluster sharing one in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use mqttpool_cluster::{
    driver_channel, ClusterConfig, ClusterContext, ClusterManager, ConnectionDriver, PeerApi,
};
use mqttpool_common::{
    ApiResponse, Assignment, ClusterError, ConnectionParams, CreateConnectionData,
    NodeDescriptor, Result,
};
use mqttpool_storage::MemoryStore;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn fast_config() -> ClusterConfig {
    ClusterConfig {
        namespace: "test:".to_string(),
        heartbeat_interval_ms: 50,
        lease_ttl_ms: 1000,
        lease_retry_interval_ms: 20,
        liveness_interval_ms: 50,
        reconcile_interval_ms: 50,
        peer_timeout_ms: 200,
        expiry_backoff_initial_ms: 20,
        expiry_backoff_max_ms: 200,
    }
}

pub fn assignment(id: &str) -> Assignment {
    Assignment::new(
        id,
        ConnectionParams {
            broker: "broker.local".to_string(),
            port: 1883,
            username: "device".to_string(),
            password: "secret".to_string(),
            sub_topic: format!("devices/{}/#", id),
        },
    )
}

/// Driver that succeeds unless told to fail; tracks open connections.
/// `delay_ms` stalls every connect, like a slow broker handshake.
#[derive(Default)]
pub struct FakeDriver {
    pub fail: AtomicBool,
    pub delay_ms: AtomicU64,
    pub open: DashSet<String>,
}

#[async_trait]
impl ConnectionDriver for FakeDriver {
    async fn connect(&self, assignment: &Assignment) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClusterError::DriverFailed {
                id: assignment.id.clone(),
                message: "connection refused".to_string(),
            });
        }
        self.open.insert(assignment.id.clone());
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<()> {
        self.open.remove(id);
        Ok(())
    }
}

/// Routes Control API calls straight to the target's manager
#[derive(Default)]
pub struct InProcessPeers {
    nodes: DashMap<String, Arc<ClusterManager>>,
    dead: DashSet<String>,
    pub notices: Mutex<Vec<(String, String)>>,
}

impl InProcessPeers {
    pub fn register(&self, manager: Arc<ClusterManager>) {
        self.nodes.insert(manager.local().name.clone(), manager);
    }

    pub fn kill(&self, name: &str) {
        self.dead.insert(name.to_string());
    }

    pub fn notices(&self) -> Vec<(String, String)> {
        self.notices.lock().unwrap().clone()
    }

    fn reach(&self, peer: &NodeDescriptor) -> Result<Arc<ClusterManager>> {
        if self.dead.contains(&peer.name) {
            return Err(ClusterError::PeerUnreachable {
                peer: peer.name.clone(),
                message: "connection refused".to_string(),
            });
        }
        self.nodes
            .get(&peer.name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::PeerUnreachable {
                peer: peer.name.clone(),
                message: "unknown peer".to_string(),
            })
    }
}

#[async_trait]
impl PeerApi for InProcessPeers {
    async fn probe_liveness(&self, peer: &NodeDescriptor) -> Result<()> {
        self.reach(peer).map(|_| ())
    }

    async fn create_connection(
        &self,
        peer: &NodeDescriptor,
        assignment: &Assignment,
    ) -> Result<ApiResponse<CreateConnectionData>> {
        let manager = self.reach(peer)?;
        match manager.create_connection(assignment.clone()).await {
            Ok(usage) => Ok(ApiResponse::ok(
                "connection created",
                CreateConnectionData {
                    id: assignment.id.clone(),
                    node: peer.name.clone(),
                    usage,
                },
            )),
            Err(e) => Ok(ApiResponse::from(&e)),
        }
    }

    async fn notify_node_failure(&self, peer: &NodeDescriptor, failed_node: &str) -> Result<()> {
        let manager = self.reach(peer)?;
        manager.handle_node_failure_notice(failed_node);
        self.notices
            .lock()
            .unwrap()
            .push((peer.name.clone(), failed_node.to_string()));
        Ok(())
    }
}

pub struct TestNode {
    pub manager: Arc<ClusterManager>,
    pub driver: Arc<FakeDriver>,
}

impl TestNode {
    pub fn ctx(&self) -> &Arc<ClusterContext> {
        self.manager.context()
    }
}

pub struct TestCluster {
    pub store: MemoryStore,
    pub peers: Arc<InProcessPeers>,
    pub config: ClusterConfig,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: ClusterConfig) -> Self {
        Self {
            store: MemoryStore::with_reap_interval(Duration::from_millis(10)),
            peers: Arc::new(InProcessPeers::default()),
            config,
        }
    }

    /// Build a node and register it with the in-process peer router. Nothing
    /// is published and no task is started.
    pub fn node(&self, name: &str, capacity: i64) -> TestNode {
        let descriptor = NodeDescriptor::new(name, "127.0.0.1", 0, "mqtt", capacity);
        let ctx = ClusterContext::new(self.config.clone(), descriptor, Arc::new(self.store.clone()));
        let driver = Arc::new(FakeDriver::default());
        let manager = Arc::new(ClusterManager::new(ctx, driver.clone(), self.peers.clone()));
        self.peers.register(manager.clone());
        TestNode { manager, driver }
    }

    /// Build, register and start a node with every background task running
    pub async fn start_node(&self, name: &str, capacity: i64) -> TestNode {
        let node = self.node(name, capacity);
        let (_events_tx, events_rx) = driver_channel();
        node.manager.start(events_rx).await.unwrap();
        node
    }
}

/// Poll `check` until it returns true or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
