//! Heartbeat publication and peer discovery.

use mqttpool_common::{ClusterError, CoordinationStore, NodeDescriptor, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::keys::KeySpace;

/// Heartbeat TTL for a publish interval: 1.2x, rounded up to the millisecond
pub fn heartbeat_ttl(interval: Duration) -> Duration {
    let millis = interval.as_millis() as u64;
    Duration::from_millis((millis * 6 + 4) / 5)
}

/// Membership registry backed by the coordination store
pub struct MembershipRegistry {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    interval: Duration,
}

impl MembershipRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace, interval: Duration) -> Self {
        Self {
            store,
            keys,
            interval,
        }
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        heartbeat_ttl(self.interval)
    }

    /// Refresh the heartbeat and upsert the descriptor into the catalog
    pub async fn publish(&self, descriptor: &NodeDescriptor) -> Result<()> {
        let heartbeat = self.keys.heartbeat(&descriptor.role, &descriptor.name);
        self.store
            .set_with_ttl(&heartbeat, &descriptor.name, self.heartbeat_ttl())
            .await?;

        let json = serde_json::to_string(descriptor)?;
        self.store
            .hash_set(&self.keys.catalog(&descriptor.role), &descriptor.name, &json)
            .await?;

        debug!("Published heartbeat for {}", descriptor.name);
        Ok(())
    }

    /// Every catalog entry for `role`, including nodes whose heartbeat has
    /// lapsed but which have not been evicted yet
    pub async fn list_peers(&self, role: &str) -> Result<Vec<NodeDescriptor>> {
        let catalog = self.keys.catalog(role);
        let entries = self.store.hash_get_all(&catalog).await?;

        let mut peers = Vec::with_capacity(entries.len());
        for (name, json) in entries {
            match serde_json::from_str::<NodeDescriptor>(&json) {
                Ok(descriptor) => peers.push(descriptor),
                Err(e) => warn!("Skipping corrupt catalog entry {}/{}: {}", catalog, name, e),
            }
        }
        Ok(peers)
    }

    pub async fn get_peer(&self, role: &str, name: &str) -> Result<Option<NodeDescriptor>> {
        let catalog = self.keys.catalog(role);
        match self.store.hash_get(&catalog, name).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| ClusterError::corrupt(format!("{}/{}", catalog, name), e.to_string())),
            None => Ok(None),
        }
    }

    /// Evict `name` from the catalog. Returns whether it was listed.
    pub async fn remove_from_catalog(&self, role: &str, name: &str) -> Result<bool> {
        let removed = self
            .store
            .hash_delete(&self.keys.catalog(role), name)
            .await?;
        if removed {
            info!("Removed node {} from {} catalog", name, role);
        }
        Ok(removed)
    }

    /// Whether the heartbeat of `name` is currently live
    pub async fn is_alive(&self, role: &str, name: &str) -> Result<bool> {
        Ok(self
            .store
            .get(&self.keys.heartbeat(role, name))
            .await?
            .is_some())
    }

    /// Publish `descriptor` every interval until cancelled
    pub async fn run_publisher(&self, descriptor: NodeDescriptor, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Heartbeat publisher started: node={}, interval={:?}, ttl={:?}",
            descriptor.name,
            self.interval,
            self.heartbeat_ttl()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.publish(&descriptor).await {
                        warn!("Heartbeat publish failed: {}", e);
                    }
                }
            }
        }

        info!("Heartbeat publisher stopped");
    }
}
