use serde::{Deserialize, Serialize};

/// Unique identifier of an assignment (the MQTT client id)
pub type AssignmentId = String;

/// Name of a node, unique within its role
pub type NodeName = String;

/// Self-published description of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: NodeName,
    pub host: String,
    pub port: u16,
    pub role: String,
    /// Maximum number of hosted connections
    pub capacity: i64,
}

impl NodeDescriptor {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        role: impl Into<String>,
        capacity: i64,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            role: role.into(),
            capacity,
        }
    }

    /// Base URL of this node's control API
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Parameters needed to open one hosted MQTT connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub broker: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub sub_topic: String,
}

/// A unit of work: one connection configuration, pending or bound to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(alias = "client_id")]
    pub id: AssignmentId,
    #[serde(flatten)]
    pub params: ConnectionParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_node: Option<NodeName>,
}

impl Assignment {
    pub fn new(id: impl Into<String>, params: ConnectionParams) -> Self {
        Self {
            id: id.into(),
            params,
            bound_node: None,
        }
    }

    /// Copy of this assignment bound to `node`
    pub fn bound_to(&self, node: &str) -> Self {
        Self {
            bound_node: Some(node.to_string()),
            ..self.clone()
        }
    }

    /// Copy of this assignment with the binding cleared
    pub fn unbound(&self) -> Self {
        Self {
            bound_node: None,
            ..self.clone()
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound_node.is_some()
    }
}

/// Per-node usage snapshot for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUsage {
    pub name: NodeName,
    pub usage: i64,
    pub capacity: i64,
    pub bound_ids: Vec<AssignmentId>,
    pub assignments: Vec<Assignment>,
}

/// Cluster-wide counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterStats {
    pub nodes: usize,
    pub pending: usize,
    pub bound: usize,
    pub total_capacity: i64,
    pub total_usage: i64,
}
