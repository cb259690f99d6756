//! Explicitly constructed coordination context shared by every component.

use mqttpool_common::{CoordinationStore, NodeDescriptor};
use std::sync::Arc;

use crate::keys::KeySpace;
use crate::lock::LeaseLock;
use crate::membership::MembershipRegistry;
use crate::pool::AssignmentPool;
use crate::selector::NodeSelector;
use crate::ClusterConfig;

pub struct ClusterContext {
    pub config: ClusterConfig,
    /// Descriptor this process publishes for itself
    pub local: NodeDescriptor,
    pub keys: KeySpace,
    pub store: Arc<dyn CoordinationStore>,
    pub registry: Arc<MembershipRegistry>,
    pub pool: Arc<AssignmentPool>,
    pub selector: NodeSelector,
}

impl ClusterContext {
    pub fn new(
        config: ClusterConfig,
        local: NodeDescriptor,
        store: Arc<dyn CoordinationStore>,
    ) -> Arc<Self> {
        let keys = KeySpace::new(config.namespace.clone());
        let registry = Arc::new(MembershipRegistry::new(
            store.clone(),
            keys.clone(),
            config.heartbeat_interval(),
        ));
        let pool = Arc::new(AssignmentPool::new(store.clone(), keys.clone()));
        let selector = NodeSelector::new(registry.clone(), pool.clone(), local.role.clone());

        Arc::new(Self {
            config,
            local,
            keys,
            store,
            registry,
            pool,
            selector,
        })
    }

    pub fn role(&self) -> &str {
        &self.local.role
    }

    pub fn node_name(&self) -> &str {
        &self.local.name
    }

    /// A fresh lock handle for the named lease, using the configured timings
    pub fn lease(&self, name: &str) -> LeaseLock {
        LeaseLock::new(
            self.store.clone(),
            &self.keys,
            name,
            self.config.lease_ttl(),
            self.config.lease_retry_interval(),
        )
    }
}
