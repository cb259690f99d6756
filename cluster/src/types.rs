use chrono::{DateTime, Utc};
use mqttpool_common::{AssignmentId, NodeName};
use serde::{Deserialize, Serialize};

/// Result of running a body under a lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome<T> {
    /// Another process held the lease; the tick was skipped
    Contended,
    Completed(T),
}

impl<T> LeaseOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            LeaseOutcome::Completed(value) => Some(value),
            LeaseOutcome::Contended => None,
        }
    }
}

/// What an eviction did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionReport {
    pub node: NodeName,
    /// Ids moved back to pending, in bound-list order
    pub requeued: Vec<AssignmentId>,
    /// Listed ids whose bound entry could not be decoded
    pub corrupt: Vec<AssignmentId>,
    /// Whether this call removed the node from the catalog. False when a
    /// concurrent eviction got there first.
    pub removed_from_catalog: bool,
    pub evicted_at: DateTime<Utc>,
}

impl EvictionReport {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            requeued: Vec::new(),
            corrupt: Vec::new(),
            removed_from_catalog: false,
            evicted_at: Utc::now(),
        }
    }
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// `(assignment id, node)` pairs accepted by their target
    pub placed: Vec<(AssignmentId, NodeName)>,
    /// Ids left pending for the next pass
    pub deferred: Vec<AssignmentId>,
}
