use thiserror::Error;

/// Errors raised by the coordination core and its collaborators
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Connectivity or protocol failure talking to the coordination store
    #[error("Coordination store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Direct creation rejected because the node is full
    #[error("Capacity exceeded on node {node}: usage {usage}, capacity {capacity}")]
    CapacityExceeded {
        node: String,
        usage: i64,
        capacity: i64,
    },

    /// The assignment id is already bound somewhere in the cluster
    #[error("Assignment already bound: {id}")]
    DuplicateAssignment { id: String },

    /// A peer did not answer a probe or control call
    #[error("Peer {peer} unreachable: {message}")]
    PeerUnreachable { peer: String, message: String },

    /// A peer answered create-connection with a non-success envelope
    #[error("Peer {peer} rejected placement ({status}): {message}")]
    PlacementRejected {
        peer: String,
        status: u16,
        message: String,
    },

    /// Request-level decode failure
    #[error("Malformed payload: {message}")]
    MalformedPayload { message: String },

    /// A stored record could not be decoded
    #[error("Corrupt state at {key}: {message}")]
    CorruptState { key: String, message: String },

    /// The connection driver could not establish the hosted connection
    #[error("Connection driver failed for {id}: {message}")]
    DriverFailed { id: String, message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn store(message: impl Into<String>) -> Self {
        ClusterError::StoreUnavailable {
            message: message.into(),
        }
    }

    pub fn corrupt(key: impl Into<String>, message: impl Into<String>) -> Self {
        ClusterError::CorruptState {
            key: key.into(),
            message: message.into(),
        }
    }

    /// HTTP-style status code used in control API envelopes
    pub fn status_code(&self) -> u16 {
        match self {
            ClusterError::MalformedPayload { .. }
            | ClusterError::DuplicateAssignment { .. }
            | ClusterError::CapacityExceeded { .. } => 400,
            ClusterError::NotFound { .. } => 404,
            ClusterError::DriverFailed { .. }
            | ClusterError::PeerUnreachable { .. }
            | ClusterError::PlacementRejected { .. } => 502,
            _ => 500,
        }
    }

    /// Whether a background loop may simply try again on its next tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::StoreUnavailable { .. } | ClusterError::PeerUnreachable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
