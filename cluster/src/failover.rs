//! Failure detection and eviction.
//!
//! Two independent triggers evict a node: the reactive expiry listener, which
//! runs without any lease, and the proactive liveness loop, which runs under
//! the `peer-liveness` lease. Both may evict the same node concurrently;
//! eviction tolerates that because every step is idempotent.

use futures::future::join_all;
use futures::StreamExt;
use metrics::counter;
use mqttpool_common::{AssignmentId, ClusterError, NodeDescriptor, Result};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::ClusterContext;
use crate::lock::{LeaseLock, PEER_LIVENESS_LEASE};
use crate::peer::PeerApi;
use crate::types::{EvictionReport, LeaseOutcome};

pub struct FailoverCoordinator {
    ctx: Arc<ClusterContext>,
    peers: Arc<dyn PeerApi>,
    liveness: LeaseLock,
    /// Woken after an eviction requeued something
    requeued: Arc<Notify>,
}

impl FailoverCoordinator {
    pub fn new(ctx: Arc<ClusterContext>, peers: Arc<dyn PeerApi>, requeued: Arc<Notify>) -> Self {
        let liveness = ctx.lease(PEER_LIVENESS_LEASE);
        Self {
            ctx,
            peers,
            liveness,
            requeued,
        }
    }

    /// Move every id bound to `node` back to pending and clear its usage.
    /// Corrupt bound entries are logged and reported, never fatal.
    async fn requeue_bindings(
        &self,
        node: &str,
    ) -> Result<(Vec<AssignmentId>, Vec<AssignmentId>)> {
        let pool = &self.ctx.pool;
        pool.clear_usage(node).await?;

        let mut requeued = Vec::new();
        let mut corrupt = Vec::new();
        for id in pool.bound_ids(node).await? {
            match pool.unbind(&id, node).await {
                Ok(Some(_)) => requeued.push(id),
                Ok(None) => debug!("{} of {} was already requeued", id, node),
                Err(ClusterError::CorruptState { key, message }) => {
                    error!("Skipping corrupt bound entry {}: {}", key, message);
                    corrupt.push(id);
                }
                Err(e) => return Err(e),
            }
        }

        if !requeued.is_empty() {
            counter!("mqttpool.assignments.requeued").increment(requeued.len() as u64);
            self.requeued.notify_one();
        }
        Ok((requeued, corrupt))
    }

    /// Evict `node`: clear its usage, requeue its bound ids, then remove it
    /// from the catalog. A store failure part way leaves the node listed so
    /// the next liveness tick retries.
    pub async fn evict(&self, node: &str) -> Result<EvictionReport> {
        let mut report = EvictionReport::new(node);

        let (requeued, corrupt) = self.requeue_bindings(node).await?;
        report.requeued = requeued;
        report.corrupt = corrupt;
        report.removed_from_catalog = self
            .ctx
            .registry
            .remove_from_catalog(self.ctx.role(), node)
            .await?;

        counter!("mqttpool.evictions").increment(1);
        info!(
            "Evicted node {}: requeued {:?}, corrupt {:?}",
            node, report.requeued, report.corrupt
        );

        if report.removed_from_catalog {
            self.notify_peers(node);
        }
        Ok(report)
    }

    /// Requeue leftovers of a previous incarnation of this node
    pub async fn requeue_local(&self) -> Result<Vec<AssignmentId>> {
        let (requeued, corrupt) = self.requeue_bindings(self.ctx.node_name()).await?;
        if !requeued.is_empty() || !corrupt.is_empty() {
            info!(
                "Requeued {} leftover assignments of {} ({} corrupt)",
                requeued.len(),
                self.ctx.node_name(),
                corrupt.len()
            );
        }
        Ok(requeued)
    }

    /// Tell every other peer that `failed` was evicted, without waiting
    fn notify_peers(&self, failed: &str) {
        let ctx = self.ctx.clone();
        let peers = self.peers.clone();
        let failed = failed.to_string();

        tokio::spawn(async move {
            let targets = match ctx.registry.list_peers(ctx.role()).await {
                Ok(targets) => targets,
                Err(e) => {
                    warn!("Cannot list peers to announce failure of {}: {}", failed, e);
                    return;
                }
            };

            let timeout = ctx.config.peer_timeout();
            let calls = targets
                .iter()
                .filter(|peer| peer.name != failed && peer.name != ctx.node_name())
                .map(|peer| {
                    let peers = peers.clone();
                    let failed = failed.clone();
                    async move {
                        let outcome =
                            tokio::time::timeout(timeout, peers.notify_node_failure(peer, &failed))
                                .await;
                        match outcome {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!("Failure notice to {} failed: {}", peer.name, e),
                            Err(_) => warn!("Failure notice to {} timed out", peer.name),
                        }
                    }
                });
            join_all(calls).await;
        });
    }

    /// React to one expired key; ignores keys that are not heartbeats of the
    /// local role
    pub async fn handle_expired_key(&self, key: &str) {
        let Some(node) = self.ctx.keys.node_from_expired(self.ctx.role(), key) else {
            return;
        };
        warn!("Heartbeat of {} expired", node);
        if let Err(e) = self.evict(node).await {
            warn!("Eviction of {} after heartbeat expiry failed: {}", node, e);
        }
    }

    async fn probe(&self, peer: &NodeDescriptor) -> Result<()> {
        match tokio::time::timeout(self.ctx.config.peer_timeout(), self.peers.probe_liveness(peer))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ClusterError::PeerUnreachable {
                peer: peer.name.clone(),
                message: "liveness probe timed out".to_string(),
            }),
        }
    }

    /// One proactive pass: under the liveness lease, probe every peer
    /// concurrently and evict those that fail
    pub async fn probe_peers_once(&self) -> Result<LeaseOutcome<Vec<EvictionReport>>> {
        if !self.liveness.try_acquire().await? {
            debug!("Lease '{}' is held elsewhere, skipping probe", PEER_LIVENESS_LEASE);
            return Ok(LeaseOutcome::Contended);
        }

        let result = self.probe_and_evict().await;

        if let Err(e) = self.liveness.release().await {
            warn!("Releasing lease '{}' failed: {}", PEER_LIVENESS_LEASE, e);
        }
        result.map(LeaseOutcome::Completed)
    }

    async fn probe_and_evict(&self) -> Result<Vec<EvictionReport>> {
        let peers = self.ctx.registry.list_peers(self.ctx.role()).await?;
        let outcomes = join_all(peers.iter().map(|peer| self.probe(peer))).await;

        let mut reports = Vec::new();
        for (peer, outcome) in peers.iter().zip(outcomes) {
            let Err(e) = outcome else { continue };
            warn!("Liveness probe of {} failed: {}", peer.name, e);
            match self.evict(&peer.name).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Eviction of {} failed, will retry: {}", peer.name, e),
            }
        }
        Ok(reports)
    }

    /// Run `probe_peers_once` every liveness interval until cancelled
    pub async fn run_liveness_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.config.liveness_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.probe_peers_once().await {
                        warn!("Liveness pass failed: {}", e);
                    }
                }
            }
        }
        info!("Liveness loop stopped");
    }

    /// Evict nodes as their heartbeats expire. A failed subscription or a
    /// lost stream is retried with exponential backoff.
    pub async fn run_expiry_listener(&self, cancel: CancellationToken) {
        let initial = self.ctx.config.expiry_backoff_initial();
        let max = self.ctx.config.expiry_backoff_max();
        let mut backoff = initial;

        loop {
            let subscription = tokio::select! {
                _ = cancel.cancelled() => break,
                subscription = self.ctx.store.subscribe_expirations() => subscription,
            };

            match subscription {
                Ok(mut stream) => {
                    info!("Subscribed to key expirations");
                    backoff = initial;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                info!("Expiry listener stopped");
                                return;
                            }
                            key = stream.next() => match key {
                                Some(key) => self.handle_expired_key(&key).await,
                                None => break,
                            },
                        }
                    }
                    warn!("Expiration stream ended, resubscribing in {:?}", backoff);
                }
                Err(e) => warn!("Expiration subscribe failed, retrying in {:?}: {}", backoff, e),
            }

            counter!("mqttpool.expiry.resubscribes").increment(1);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(max);
        }
        info!("Expiry listener stopped");
    }
}
