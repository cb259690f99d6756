use crate::error::ClusterError;
use serde::{Deserialize, Serialize};

/// Envelope returned by every control and operator endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub status: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            status: 200,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

impl<T> From<&ClusterError> for ApiResponse<T> {
    fn from(err: &ClusterError) -> Self {
        Self::error(err.status_code(), err.to_string())
    }
}

/// Reply data for an accepted create-connection call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConnectionData {
    pub id: String,
    pub node: String,
    pub usage: i64,
}

/// Body of `POST /node-failure`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFailureNotice {
    #[serde(alias = "error_node")]
    pub failed_node_name: String,
}
