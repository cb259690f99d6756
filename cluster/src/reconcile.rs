//! Placement of pending assignments onto peers with spare capacity.

use metrics::counter;
use mqttpool_common::{Assignment, ClusterError, NodeDescriptor, Result};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ClusterContext;
use crate::lock::{LeaseLock, PENDING_RECONCILE_LEASE};
use crate::peer::PeerApi;
use crate::types::{LeaseOutcome, ReconcileReport};

pub struct Reconciler {
    ctx: Arc<ClusterContext>,
    peers: Arc<dyn PeerApi>,
    lease: LeaseLock,
    nudge: Arc<Notify>,
}

impl Reconciler {
    pub fn new(ctx: Arc<ClusterContext>, peers: Arc<dyn PeerApi>) -> Self {
        let lease = ctx.lease(PENDING_RECONCILE_LEASE);
        Self {
            ctx,
            peers,
            lease,
            nudge: Arc::new(Notify::new()),
        }
    }

    /// Handle that wakes the loop ahead of its next tick
    pub fn nudge_handle(&self) -> Arc<Notify> {
        self.nudge.clone()
    }

    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    /// One pass over the pending pool under the `pending-reconcile` lease.
    ///
    /// The pass stops early once half the lease TTL has elapsed; whatever is
    /// left stays pending for the next pass.
    pub async fn reconcile_once(&self) -> Result<LeaseOutcome<ReconcileReport>> {
        if !self.lease.try_acquire().await? {
            debug!("Lease '{}' is held elsewhere, skipping pass", PENDING_RECONCILE_LEASE);
            return Ok(LeaseOutcome::Contended);
        }

        let result = self.place_pending().await;

        if let Err(e) = self.lease.release().await {
            warn!("Releasing lease '{}' failed: {}", PENDING_RECONCILE_LEASE, e);
        }
        result.map(LeaseOutcome::Completed)
    }

    async fn place_pending(&self) -> Result<ReconcileReport> {
        let started = Instant::now();
        let budget = self.lease.ttl() / 2;
        let mut report = ReconcileReport::default();

        for assignment in self.ctx.pool.pending().await? {
            if started.elapsed() >= budget {
                report.deferred.push(assignment.id);
                continue;
            }

            let Some(target) = self.ctx.selector.select_target(None).await? else {
                report.deferred.push(assignment.id);
                continue;
            };

            match self.place(&target, &assignment).await {
                Ok(()) => {
                    counter!("mqttpool.assignments.placed").increment(1);
                    info!("Placed {} on {}", assignment.id, target.name);
                    report.placed.push((assignment.id, target.name));
                }
                Err(e) => {
                    warn!("Placing {} on {} failed: {}", assignment.id, target.name, e);
                    report.deferred.push(assignment.id);
                }
            }
        }

        if !report.deferred.is_empty() {
            debug!("{} assignments left pending", report.deferred.len());
        }
        Ok(report)
    }

    async fn place(&self, target: &NodeDescriptor, assignment: &Assignment) -> Result<()> {
        let call = self.peers.create_connection(target, assignment);
        let response = match tokio::time::timeout(self.ctx.config.peer_timeout(), call).await {
            Ok(response) => response?,
            Err(_) => {
                return Err(ClusterError::PeerUnreachable {
                    peer: target.name.clone(),
                    message: "create-connection timed out".to_string(),
                })
            }
        };

        if response.is_ok() {
            Ok(())
        } else {
            Err(ClusterError::PlacementRejected {
                peer: target.name.clone(),
                status: response.status,
                message: response.message,
            })
        }
    }

    /// Run a pass every reconcile interval, or sooner when nudged
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.config.reconcile_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.nudge.notified() => debug!("Reconciler nudged"),
            }

            if let Err(e) = self.reconcile_once().await {
                warn!("Reconciliation pass failed: {}", e);
            }
        }
        info!("Reconciler stopped");
    }
}
