use futures::future::join_all;
use mqttpool_common::{
    Assignment, ClusterError, ClusterStats, NodeDescriptor, NodeUsage, Result,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admission::Admission;
use crate::context::ClusterContext;
use crate::driver::{ConnectionDriver, DriverEventReceiver};
use crate::failover::FailoverCoordinator;
use crate::peer::PeerApi;
use crate::reconcile::Reconciler;

/// Owns every background task of one node and the operations exposed
/// through its Control API
pub struct ClusterManager {
    ctx: Arc<ClusterContext>,
    admission: Admission,
    failover: FailoverCoordinator,
    reconciler: Reconciler,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterManager {
    pub fn new(
        ctx: Arc<ClusterContext>,
        driver: Arc<dyn ConnectionDriver>,
        peers: Arc<dyn PeerApi>,
    ) -> Self {
        let reconciler = Reconciler::new(ctx.clone(), peers.clone());
        let failover = FailoverCoordinator::new(ctx.clone(), peers, reconciler.nudge_handle());
        let admission = Admission::new(ctx.clone(), driver);

        Self {
            ctx,
            admission,
            failover,
            reconciler,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    pub fn local(&self) -> &NodeDescriptor {
        &self.ctx.local
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn failover(&self) -> &FailoverCoordinator {
        &self.failover
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Requeue leftovers of a previous incarnation, publish once, then spawn
    /// the heartbeat publisher, expiry listener, liveness loop, reconciler
    /// and driver event consumer
    pub async fn start(self: &Arc<Self>, events: DriverEventReceiver) -> Result<()> {
        info!(
            "Starting cluster manager for {} (role {}, capacity {})",
            self.ctx.local.name, self.ctx.local.role, self.ctx.local.capacity
        );

        self.failover.requeue_local().await?;
        self.ctx.registry.publish(&self.ctx.local).await?;

        let mut tasks = self.tasks.lock().await;

        let manager = self.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .ctx
                .registry
                .run_publisher(manager.ctx.local.clone(), cancel)
                .await;
        }));

        let manager = self.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            manager.failover.run_expiry_listener(cancel).await;
        }));

        let manager = self.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            manager.failover.run_liveness_loop(cancel).await;
        }));

        let manager = self.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            manager.reconciler.run(cancel).await;
        }));

        let manager = self.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            manager.admission.run_driver_events(events, cancel).await;
        }));

        Ok(())
    }

    /// Cancel every background task and wait for them to stop
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Cluster manager for {} stopped", self.ctx.local.name);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Direct creation on this node
    pub async fn create_connection(&self, assignment: Assignment) -> Result<i64> {
        self.admission.create_connection(assignment).await
    }

    /// Add a config to the pending pool and wake the reconciler
    pub async fn submit(&self, assignment: Assignment) -> Result<()> {
        if assignment.id.trim().is_empty() {
            return Err(ClusterError::MalformedPayload {
                message: "assignment id must not be empty".to_string(),
            });
        }
        if self.ctx.pool.is_bound(&assignment.id).await? {
            return Err(ClusterError::DuplicateAssignment { id: assignment.id });
        }
        self.ctx.pool.submit_pending(&assignment).await?;
        self.reconciler.nudge();
        Ok(())
    }

    /// A peer announced that it evicted `failed`
    pub fn handle_node_failure_notice(&self, failed: &str) {
        info!("Peer reported eviction of {}", failed);
        self.reconciler.nudge();
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeDescriptor>> {
        self.ctx.registry.list_peers(self.ctx.role()).await
    }

    pub async fn node_usage(&self) -> Result<Vec<NodeUsage>> {
        let nodes = self.list_nodes().await?;
        let mut usage = Vec::with_capacity(nodes.len());
        for node in nodes {
            usage.push(self.ctx.pool.snapshot(&node.name, node.capacity).await?);
        }
        Ok(usage)
    }

    pub async fn get_bound(&self, id: &str) -> Result<Assignment> {
        self.ctx
            .pool
            .get_bound(id)
            .await?
            .ok_or_else(|| ClusterError::NotFound {
                message: format!("no bound assignment {}", id),
            })
    }

    pub async fn get_pending(&self, id: &str) -> Result<Assignment> {
        self.ctx
            .pool
            .get_pending(id)
            .await?
            .ok_or_else(|| ClusterError::NotFound {
                message: format!("no pending assignment {}", id),
            })
    }

    pub async fn stats(&self) -> Result<ClusterStats> {
        let usage = self.node_usage().await?;
        Ok(ClusterStats {
            nodes: usage.len(),
            pending: self.ctx.pool.pending().await?.len(),
            bound: self.ctx.pool.bound().await?.len(),
            total_capacity: usage.iter().map(|u| u.capacity).sum(),
            total_usage: usage.iter().map(|u| u.usage).sum(),
        })
    }

    /// Whether the coordination store answers
    pub async fn store_reachable(&self) -> bool {
        self.ctx
            .store
            .get(&self.ctx.keys.heartbeat(self.ctx.role(), self.ctx.node_name()))
            .await
            .is_ok()
    }
}
