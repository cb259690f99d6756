//! Named, TTL-bounded lease over the coordination store.
//!
//! A lease is not a strict mutex. Expiry is independent of the critical
//! section, so a holder that outlives the TTL can overlap with the next
//! holder. Callers must keep critical sections well under the TTL.

use metrics::counter;
use mqttpool_common::{CoordinationStore, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::keys::KeySpace;

/// Guards the proactive liveness loop
pub const PEER_LIVENESS_LEASE: &str = "peer-liveness";

/// Guards the pending-pool reconciliation loop
pub const PENDING_RECONCILE_LEASE: &str = "pending-reconcile";

pub struct LeaseLock {
    store: Arc<dyn CoordinationStore>,
    name: String,
    key: String,
    ttl: Duration,
    retry_interval: Duration,
    /// Token of the live lease, if this instance believes it holds one
    token: Mutex<Option<String>>,
}

impl LeaseLock {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: &KeySpace,
        name: impl Into<String>,
        ttl: Duration,
        retry_interval: Duration,
    ) -> Self {
        let name = name.into();
        Self {
            store,
            key: keys.lease(&name),
            name,
            ttl,
            retry_interval,
            token: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether this instance believes it holds the lease. Stays true after
    /// passive expiry until `release` is called.
    pub async fn is_held(&self) -> bool {
        self.token.lock().await.is_some()
    }

    /// Acquire the lease if nobody holds a live one
    pub async fn try_acquire(&self) -> Result<bool> {
        let mut token = self.token.lock().await;
        if token.is_some() {
            return Ok(false);
        }

        let candidate = Uuid::new_v4().to_string();
        if self
            .store
            .set_if_absent(&self.key, &candidate, self.ttl)
            .await?
        {
            debug!("Acquired lease '{}'", self.name);
            counter!("mqttpool.lease.acquired", "lease" => self.name.clone()).increment(1);
            *token = Some(candidate);
            Ok(true)
        } else {
            counter!("mqttpool.lease.contended", "lease" => self.name.clone()).increment(1);
            Ok(false)
        }
    }

    /// Retry `try_acquire` on a fixed interval until it succeeds
    pub async fn acquire_blocking(&self) {
        loop {
            match self.try_acquire().await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!("Lease '{}' acquisition failed: {}", self.name, e),
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Release the lease.
    ///
    /// # Panics
    ///
    /// Panics if this instance does not hold the lease.
    pub async fn release(&self) -> Result<()> {
        let mut token = self.token.lock().await;
        let Some(held) = token.take() else {
            panic!("lease '{}' released while not held", self.name);
        };

        if !self.store.compare_and_delete(&self.key, &held).await? {
            warn!(
                "Lease '{}' expired before release; it may now belong to another holder",
                self.name
            );
        }
        Ok(())
    }
}
