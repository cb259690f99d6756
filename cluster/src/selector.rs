//! Capacity-aware placement target selection.

use mqttpool_common::{NodeDescriptor, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::membership::MembershipRegistry;
use crate::pool::AssignmentPool;

/// Pick the eligible node with the smallest nominal capacity.
///
/// A node is eligible while its usage is strictly below its capacity. Ties
/// go to the first candidate encountered. Selection deliberately ranks by
/// declared capacity, not by remaining headroom.
pub fn pick_by_capacity<I>(candidates: I) -> Option<NodeDescriptor>
where
    I: IntoIterator<Item = (NodeDescriptor, i64)>,
{
    let mut best: Option<NodeDescriptor> = None;
    for (node, usage) in candidates {
        if usage >= node.capacity {
            continue;
        }
        match &best {
            Some(current) if current.capacity <= node.capacity => {}
            _ => best = Some(node),
        }
    }
    best
}

pub struct NodeSelector {
    registry: Arc<MembershipRegistry>,
    pool: Arc<AssignmentPool>,
    role: String,
}

impl NodeSelector {
    pub fn new(
        registry: Arc<MembershipRegistry>,
        pool: Arc<AssignmentPool>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            pool,
            role: role.into(),
        }
    }

    /// Choose a placement target among the peers of the local role
    pub async fn select_target(&self, exclude: Option<&str>) -> Result<Option<NodeDescriptor>> {
        let peers = self.registry.list_peers(&self.role).await?;

        let mut candidates = Vec::with_capacity(peers.len());
        for peer in peers {
            if exclude == Some(peer.name.as_str()) {
                continue;
            }
            match self.pool.usage(&peer.name).await {
                Ok(usage) => candidates.push((peer, usage)),
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => warn!("Ignoring candidate {}: {}", peer.name, e),
            }
        }

        let target = pick_by_capacity(candidates);
        match &target {
            Some(node) => debug!("Selected target {} (capacity {})", node.name, node.capacity),
            None => debug!("No eligible target among peers of role {}", self.role),
        }
        Ok(target)
    }
}
