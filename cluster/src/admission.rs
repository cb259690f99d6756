//! Direct creation of hosted connections on the local node.
//!
//! The id is claimed in the bound pool with a single hash-set-if-absent
//! before anything else happens, so two processes admitting the same id
//! concurrently cannot both succeed. Capacity is claimed by incrementing the
//! usage counter first and rolling back on overflow.
//!
//! Each admission runs in its own task. A caller that gives up (a peer
//! timing out on create-connection) drops only its wait; the admission still
//! binds or rolls back.

use metrics::counter;
use mqttpool_common::{Assignment, ClusterError, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ClusterContext;
use crate::driver::{ConnectionDriver, DriverEvent, DriverEventReceiver};

#[derive(Clone)]
pub struct Admission {
    ctx: Arc<ClusterContext>,
    driver: Arc<dyn ConnectionDriver>,
}

impl Admission {
    pub fn new(ctx: Arc<ClusterContext>, driver: Arc<dyn ConnectionDriver>) -> Self {
        Self { ctx, driver }
    }

    /// Open `assignment` on this node and bind it here. Returns the usage
    /// counter after admission.
    ///
    /// Never forwards to another node: a full node rejects with
    /// `CapacityExceeded` and the caller retries elsewhere.
    pub async fn create_connection(&self, assignment: Assignment) -> Result<i64> {
        let id = assignment.id.clone();
        let admission = self.clone();
        tokio::spawn(async move { admission.admit(assignment).await })
            .await
            .map_err(|e| ClusterError::DriverFailed {
                id,
                message: format!("admission task ended abnormally: {}", e),
            })?
    }

    async fn admit(&self, assignment: Assignment) -> Result<i64> {
        if assignment.id.trim().is_empty() {
            return Err(ClusterError::MalformedPayload {
                message: "assignment id must not be empty".to_string(),
            });
        }

        let node = self.ctx.node_name();
        let capacity = self.ctx.local.capacity;
        let pool = &self.ctx.pool;

        if !pool.reserve(&assignment, node).await? {
            reject("duplicate");
            return Err(ClusterError::DuplicateAssignment {
                id: assignment.id.clone(),
            });
        }

        let usage = match pool.increment_usage(node).await {
            Ok(usage) => usage,
            Err(e) => {
                self.roll_back(&assignment.id, false).await;
                return Err(e);
            }
        };

        if usage > capacity {
            self.roll_back(&assignment.id, true).await;
            reject("capacity");
            return Err(ClusterError::CapacityExceeded {
                node: node.to_string(),
                usage: usage - 1,
                capacity,
            });
        }

        if let Err(e) = self.driver.connect(&assignment).await {
            self.roll_back(&assignment.id, true).await;
            reject("driver");
            return Err(match e {
                ClusterError::DriverFailed { .. } => e,
                other => ClusterError::DriverFailed {
                    id: assignment.id.clone(),
                    message: other.to_string(),
                },
            });
        }

        if let Err(e) = pool.bind(&assignment, node).await {
            warn!("Binding {} failed after connect, disconnecting: {}", assignment.id, e);
            if let Err(e) = self.driver.disconnect(&assignment.id).await {
                warn!("Disconnect of {} failed: {}", assignment.id, e);
            }
            self.roll_back(&assignment.id, true).await;
            return Err(e);
        }

        counter!("mqttpool.admission.accepted").increment(1);
        info!(
            "Admitted {} on {} (usage {}/{})",
            assignment.id, node, usage, capacity
        );
        Ok(usage)
    }

    async fn roll_back(&self, id: &str, usage_taken: bool) {
        let pool = &self.ctx.pool;
        if usage_taken {
            if let Err(e) = pool.decrement_usage(self.ctx.node_name()).await {
                warn!("Usage rollback for {} failed: {}", id, e);
            }
        }
        if let Err(e) = pool.release_reservation(id, self.ctx.node_name()).await {
            warn!("Reservation rollback for {} failed: {}", id, e);
        }
    }

    /// Apply one driver event to the pools
    pub async fn handle_driver_event(&self, event: DriverEvent) {
        let node = self.ctx.node_name();
        match event {
            DriverEvent::Disconnected { id, reason } => {
                warn!("Connection {} lost: {}", id, reason);
                counter!("mqttpool.connections.lost").increment(1);

                match self.ctx.pool.unbind(&id, node).await {
                    Ok(Some(_)) => {
                        if let Err(e) = self.ctx.pool.decrement_usage(node).await {
                            warn!("Usage decrement for {} failed: {}", id, e);
                        }
                        info!("Requeued {} after disconnect", id);
                    }
                    Ok(None) => debug!("Connection {} was no longer bound", id),
                    Err(e) => warn!("Requeue of {} after disconnect failed: {}", id, e),
                }
            }
        }
    }

    /// Consume driver events until cancelled or every sender is gone
    pub async fn run_driver_events(&self, mut events: DriverEventReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_driver_event(event).await,
                    None => break,
                },
            }
        }
        debug!("Driver event consumer stopped");
    }
}

fn reject(reason: &'static str) {
    counter!("mqttpool.admission.rejected", "reason" => reason).increment(1);
}
