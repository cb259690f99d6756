//! Store key layout.

/// Builds every key the cluster reads or writes, under one namespace prefix
#[derive(Debug, Clone, Default)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            prefix: namespace.into(),
        }
    }

    pub fn lease(&self, name: &str) -> String {
        format!("{}lease:{}", self.prefix, name)
    }

    pub fn heartbeat_prefix(&self, role: &str) -> String {
        format!("{}beat:{}:", self.prefix, role)
    }

    pub fn heartbeat(&self, role: &str, node: &str) -> String {
        format!("{}{}", self.heartbeat_prefix(role), node)
    }

    pub fn catalog(&self, role: &str) -> String {
        format!("{}register:{}", self.prefix, role)
    }

    pub fn usage(&self, node: &str) -> String {
        format!("{}usage:{}", self.prefix, node)
    }

    pub fn pending_pool(&self) -> String {
        format!("{}assignments:pending", self.prefix)
    }

    pub fn bound_pool(&self) -> String {
        format!("{}assignments:bound", self.prefix)
    }

    pub fn bound_list(&self, node: &str) -> String {
        format!("{}bound:{}", self.prefix, node)
    }

    /// Node name carried by an expired heartbeat key of `role`, if it is one
    pub fn node_from_expired<'a>(&self, role: &str, key: &'a str) -> Option<&'a str> {
        let name = key.strip_prefix(&self.heartbeat_prefix(role))?;
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}
