use async_trait::async_trait;
use mqttpool_cluster::PeerApi;
use mqttpool_common::{
    ApiResponse, Assignment, ClusterError, CreateConnectionData, NodeDescriptor,
    NodeFailureNotice, Result,
};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument};

/// Control API client used for liveness probes, placement and failure
/// notices. Every request is bounded by the configured timeout.
#[derive(Clone)]
pub struct HttpPeerClient {
    client: Client,
    timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ClusterError::ConfigError {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn unreachable(peer: &NodeDescriptor, e: impl std::fmt::Display) -> ClusterError {
        ClusterError::PeerUnreachable {
            peer: peer.name.clone(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl PeerApi for HttpPeerClient {
    #[instrument(skip(self, peer), fields(peer = %peer.name))]
    async fn probe_liveness(&self, peer: &NodeDescriptor) -> Result<()> {
        let url = format!("{}/liveness", peer.base_url());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::unreachable(peer, e))?;

        if response.status() != StatusCode::OK {
            return Err(Self::unreachable(
                peer,
                format!("liveness returned {}", response.status()),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self, peer, assignment), fields(peer = %peer.name, id = %assignment.id))]
    async fn create_connection(
        &self,
        peer: &NodeDescriptor,
        assignment: &Assignment,
    ) -> Result<ApiResponse<CreateConnectionData>> {
        let url = format!("{}/create-connection", peer.base_url());
        let response = self
            .client
            .post(&url)
            .json(&assignment.unbound())
            .send()
            .await
            .map_err(|e| Self::unreachable(peer, e))?;

        let status = response.status();
        let envelope: ApiResponse<CreateConnectionData> = response
            .json()
            .await
            .map_err(|e| Self::unreachable(peer, format!("invalid reply ({}): {}", status, e)))?;

        debug!(
            "create-connection answered {} with envelope status {}",
            status, envelope.status
        );
        Ok(envelope)
    }

    #[instrument(skip(self, peer), fields(peer = %peer.name))]
    async fn notify_node_failure(&self, peer: &NodeDescriptor, failed_node: &str) -> Result<()> {
        let url = format!("{}/node-failure", peer.base_url());
        let notice = NodeFailureNotice {
            failed_node_name: failed_node.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&notice)
            .send()
            .await
            .map_err(|e| Self::unreachable(peer, e))?;

        if !response.status().is_success() {
            return Err(Self::unreachable(
                peer,
                format!("node-failure returned {}", response.status()),
            ));
        }
        Ok(())
    }
}
