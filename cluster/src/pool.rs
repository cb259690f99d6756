//! Pending/bound assignment pools, per-node bound lists and usage counters.
//!
//! Pool transitions chain several store calls without a transaction. A crash
//! between them can leave an id duplicated across pools or missing from a
//! bound list; readers tolerate both. Usage counters are advisory and are not
//! derived from the bound lists.

use mqttpool_common::{
    Assignment, AssignmentId, ClusterError, CoordinationStore, NodeUsage, Result,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::keys::KeySpace;

pub struct AssignmentPool {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
}

impl AssignmentPool {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    fn decode(key: String, json: &str) -> Result<Assignment> {
        serde_json::from_str(json).map_err(|e| ClusterError::corrupt(key, e.to_string()))
    }

    /// Insert into the pending pool, keyed by id
    pub async fn submit_pending(&self, assignment: &Assignment) -> Result<()> {
        let json = serde_json::to_string(&assignment.unbound())?;
        self.store
            .hash_set(&self.keys.pending_pool(), &assignment.id, &json)
            .await?;
        debug!("Assignment {} submitted as pending", assignment.id);
        Ok(())
    }

    /// Claim `assignment.id` in the bound pool for `node`, only if no node
    /// holds it. This is the atomic duplicate check used by admission.
    ///
    /// A successful claim is also listed in the node's bound list, so an
    /// eviction of `node` requeues it even if admission never completes.
    pub async fn reserve(&self, assignment: &Assignment, node: &str) -> Result<bool> {
        let json = serde_json::to_string(&assignment.bound_to(node))?;
        if !self
            .store
            .hash_set_if_absent(&self.keys.bound_pool(), &assignment.id, &json)
            .await?
        {
            return Ok(false);
        }
        self.store
            .list_push(&self.keys.bound_list(node), &assignment.id)
            .await?;
        Ok(true)
    }

    /// Drop a reservation taken by `reserve` that never completed. Leaves the
    /// entry alone if it has meanwhile been requeued and claimed by another
    /// node.
    pub async fn release_reservation(&self, id: &str, node: &str) -> Result<()> {
        let bound_pool = self.keys.bound_pool();
        if let Some(json) = self.store.hash_get(&bound_pool, id).await? {
            let owner = Self::decode(format!("{}/{}", bound_pool, id), &json)?.bound_node;
            if owner.as_deref() == Some(node) {
                self.store.hash_delete(&bound_pool, id).await?;
            }
        }
        self.store
            .list_remove(&self.keys.bound_list(node), id)
            .await?;
        Ok(())
    }

    /// Move `assignment` from pending to bound on `node`
    pub async fn bind(&self, assignment: &Assignment, node: &str) -> Result<()> {
        let bound = assignment.bound_to(node);
        let json = serde_json::to_string(&bound)?;
        let list = self.keys.bound_list(node);

        // A reservation already listed the id
        self.store.list_remove(&list, &assignment.id).await?;
        self.store.list_push(&list, &assignment.id).await?;
        self.store
            .hash_delete(&self.keys.pending_pool(), &assignment.id)
            .await?;
        self.store
            .hash_set(&self.keys.bound_pool(), &assignment.id, &json)
            .await?;

        debug!("Assignment {} bound to {}", assignment.id, node);
        Ok(())
    }

    /// Move `id` from `node` back to pending.
    ///
    /// Returns `Ok(None)` when the id has no bound entry or is bound to a
    /// different node (already moved by a concurrent eviction), and
    /// `CorruptState` when the entry cannot be decoded. A corrupt entry is
    /// left in the bound pool for inspection.
    pub async fn unbind(&self, id: &str, node: &str) -> Result<Option<Assignment>> {
        self.store
            .list_remove(&self.keys.bound_list(node), id)
            .await?;

        let bound_pool = self.keys.bound_pool();
        let Some(json) = self.store.hash_get(&bound_pool, id).await? else {
            debug!("Assignment {} already left the bound pool", id);
            return Ok(None);
        };
        let bound = Self::decode(format!("{}/{}", bound_pool, id), &json)?;
        if let Some(owner) = bound.bound_node.as_deref().filter(|owner| *owner != node) {
            debug!("Assignment {} is bound to {}, not {}; leaving it", id, owner, node);
            return Ok(None);
        }
        let assignment = bound.unbound();

        let pending = serde_json::to_string(&assignment)?;
        self.store
            .hash_set(&self.keys.pending_pool(), id, &pending)
            .await?;
        self.store.hash_delete(&bound_pool, id).await?;

        debug!("Assignment {} unbound from {}", id, node);
        Ok(Some(assignment))
    }

    /// Bound ids of `node`, in binding order
    pub async fn bound_ids(&self, node: &str) -> Result<Vec<AssignmentId>> {
        self.store.list_range(&self.keys.bound_list(node)).await
    }

    pub async fn is_bound(&self, id: &str) -> Result<bool> {
        self.store.hash_exists(&self.keys.bound_pool(), id).await
    }

    pub async fn get_bound(&self, id: &str) -> Result<Option<Assignment>> {
        let pool = self.keys.bound_pool();
        match self.store.hash_get(&pool, id).await? {
            Some(json) => Self::decode(format!("{}/{}", pool, id), &json).map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_pending(&self, id: &str) -> Result<Option<Assignment>> {
        let pool = self.keys.pending_pool();
        match self.store.hash_get(&pool, id).await? {
            Some(json) => Self::decode(format!("{}/{}", pool, id), &json).map(Some),
            None => Ok(None),
        }
    }

    /// Every decodable pending assignment; corrupt entries are skipped
    pub async fn pending(&self) -> Result<Vec<Assignment>> {
        self.decode_all(self.keys.pending_pool()).await
    }

    /// Every decodable bound assignment; corrupt entries are skipped
    pub async fn bound(&self) -> Result<Vec<Assignment>> {
        self.decode_all(self.keys.bound_pool()).await
    }

    async fn decode_all(&self, pool: String) -> Result<Vec<Assignment>> {
        let entries = self.store.hash_get_all(&pool).await?;
        let mut assignments = Vec::with_capacity(entries.len());
        for (id, json) in entries {
            match serde_json::from_str::<Assignment>(&json) {
                Ok(assignment) => assignments.push(assignment),
                Err(e) => warn!("Skipping corrupt entry {}/{}: {}", pool, id, e),
            }
        }
        Ok(assignments)
    }

    /// Current usage counter of `node`; a missing counter reads as 0
    pub async fn usage(&self, node: &str) -> Result<i64> {
        let key = self.keys.usage(node);
        match self.store.get(&key).await? {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ClusterError::corrupt(key, format!("not an integer: {}", value))),
            None => Ok(0),
        }
    }

    pub async fn increment_usage(&self, node: &str) -> Result<i64> {
        self.store.increment(&self.keys.usage(node)).await
    }

    pub async fn decrement_usage(&self, node: &str) -> Result<i64> {
        self.store.decrement(&self.keys.usage(node)).await
    }

    pub async fn clear_usage(&self, node: &str) -> Result<()> {
        self.store.delete(&self.keys.usage(node)).await
    }

    /// Usage, bound ids and resolved configs of one node
    pub async fn snapshot(&self, node: &str, capacity: i64) -> Result<NodeUsage> {
        let usage = match self.usage(node).await {
            Ok(usage) => usage,
            Err(ClusterError::CorruptState { key, message }) => {
                warn!("Corrupt usage counter {}: {}", key, message);
                0
            }
            Err(e) => return Err(e),
        };

        let bound_ids = self.bound_ids(node).await?;
        let mut assignments = Vec::with_capacity(bound_ids.len());
        for id in &bound_ids {
            match self.get_bound(id).await {
                Ok(Some(assignment)) => assignments.push(assignment),
                Ok(None) => debug!("Bound id {} of {} has no bound entry", id, node),
                Err(e) => warn!("Skipping bound id {} of {}: {}", id, node, e),
            }
        }

        Ok(NodeUsage {
            name: node.to_string(),
            usage,
            capacity,
            bound_ids,
            assignments,
        })
    }
}
