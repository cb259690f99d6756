pub mod admission;
pub mod context;
pub mod driver;
pub mod failover;
pub mod keys;
pub mod lock;
pub mod manager;
pub mod membership;
pub mod peer;
pub mod pool;
pub mod reconcile;
pub mod selector;
pub mod types;

pub use admission::Admission;
pub use context::ClusterContext;
pub use driver::{driver_channel, ConnectionDriver, DriverEvent};
pub use failover::FailoverCoordinator;
pub use keys::KeySpace;
pub use lock::{LeaseLock, PEER_LIVENESS_LEASE, PENDING_RECONCILE_LEASE};
pub use manager::ClusterManager;
pub use membership::MembershipRegistry;
pub use peer::PeerApi;
pub use pool::AssignmentPool;
pub use reconcile::Reconciler;
pub use selector::NodeSelector;
pub use types::*;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Prefix applied to every store key
    pub namespace: String,

    /// Heartbeat publication interval (milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Lease time-to-live (milliseconds)
    pub lease_ttl_ms: u64,

    /// Retry interval for blocking lease acquisition (milliseconds)
    pub lease_retry_interval_ms: u64,

    /// Proactive liveness probe interval (milliseconds)
    pub liveness_interval_ms: u64,

    /// Pending pool reconciliation interval (milliseconds)
    pub reconcile_interval_ms: u64,

    /// Timeout for every call to a peer's control API (milliseconds)
    pub peer_timeout_ms: u64,

    /// First delay before resubscribing to expirations (milliseconds)
    pub expiry_backoff_initial_ms: u64,

    /// Cap on the resubscribe delay (milliseconds)
    pub expiry_backoff_max_ms: u64,
}

impl ClusterConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn lease_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lease_retry_interval_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn expiry_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.expiry_backoff_initial_ms)
    }

    pub fn expiry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.expiry_backoff_max_ms)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            heartbeat_interval_ms: 1000,
            lease_ttl_ms: 4000,
            lease_retry_interval_ms: 5000,
            liveness_interval_ms: 1000,
            reconcile_interval_ms: 1000,
            peer_timeout_ms: 1500,
            expiry_backoff_initial_ms: 500,
            expiry_backoff_max_ms: 30_000,
        }
    }
}
