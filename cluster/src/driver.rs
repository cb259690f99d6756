//! Seam to the component that actually opens hosted connections.

use async_trait::async_trait;
use mqttpool_common::{Assignment, AssignmentId, Result};
use tokio::sync::mpsc;

/// Opens and closes hosted connections
#[async_trait]
pub trait ConnectionDriver: Send + Sync {
    /// Establish the connection described by `assignment`. Returns once the
    /// connection is up or has definitively failed.
    async fn connect(&self, assignment: &Assignment) -> Result<()>;

    /// Tear down the connection for `id`, if one is open
    async fn disconnect(&self, id: &str) -> Result<()>;
}

/// Lifecycle events emitted by a driver after `connect` succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// The connection dropped and will not be re-established by the driver
    Disconnected { id: AssignmentId, reason: String },
}

pub type DriverEventSender = mpsc::UnboundedSender<DriverEvent>;
pub type DriverEventReceiver = mpsc::UnboundedReceiver<DriverEvent>;

/// Channel carrying driver events to the admission task
pub fn driver_channel() -> (DriverEventSender, DriverEventReceiver) {
    mpsc::unbounded_channel()
}
