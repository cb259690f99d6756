//! Seam to the Control API of peer nodes.

use async_trait::async_trait;
use mqttpool_common::{ApiResponse, Assignment, CreateConnectionData, NodeDescriptor, Result};

/// Calls a peer's Control API. Implementations must bound every call with a
/// timeout; a hung peer would otherwise stall the calling loop.
#[async_trait]
pub trait PeerApi: Send + Sync {
    /// `GET /liveness`. Any error means the probe failed.
    async fn probe_liveness(&self, peer: &NodeDescriptor) -> Result<()>;

    /// `POST /create-connection`. Transport failures are `Err`; a reply
    /// carrying a non-200 status is `Ok` with that envelope.
    async fn create_connection(
        &self,
        peer: &NodeDescriptor,
        assignment: &Assignment,
    ) -> Result<ApiResponse<CreateConnectionData>>;

    /// `POST /node-failure`
    async fn notify_node_failure(&self, peer: &NodeDescriptor, failed_node: &str) -> Result<()>;
}
