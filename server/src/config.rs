use config::{Config, Environment, File};
use mqttpool_cluster::ClusterConfig;
use mqttpool_common::{ClusterError, NodeDescriptor, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix; nested keys are separated by `__`
pub const ENV_PREFIX: &str = "MQTTPOOL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    /// Process-local store; only useful for a single node
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

/// Settings for hosted MQTT clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub keep_alive_secs: u64,
    /// How long to wait for CONNACK before giving up (milliseconds). Must
    /// stay below `cluster.peer_timeout_ms` so a peer placing work here gets
    /// an answer before it gives up.
    pub connect_timeout_ms: u64,
    /// Request channel capacity of each client
    pub channel_capacity: usize,
}

impl MqttSettings {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            keep_alive_secs: 30,
            connect_timeout_ms: 1000,
            channel_capacity: 10,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Descriptor published for this node; `port` is also the listen port
    pub node: NodeDescriptor,
    /// Interface the Control API binds to
    pub bind_address: String,
    pub store: StoreConfig,
    pub cluster: ClusterConfig,
    pub mqtt: MqttSettings,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node: NodeDescriptor::new("node1", "127.0.0.1", 8080, "mqtt", 100),
            bind_address: "0.0.0.0".to_string(),
            store: StoreConfig::default(),
            cluster: ClusterConfig::default(),
            mqtt: MqttSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Layer defaults, the YAML file at `path` (if present) and `MQTTPOOL__*`
    /// environment variables, in that order
    pub fn load(path: &Path) -> Result<Self> {
        let config_err = |e: config::ConfigError| ClusterError::ConfigError {
            message: e.to_string(),
        };

        let defaults = Config::try_from(&ServerConfig::default()).map_err(config_err)?;
        let settings = Config::builder()
            .add_source(defaults)
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_err)?;

        let config: ServerConfig = settings.try_deserialize().map_err(config_err)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            return Err(ClusterError::ConfigError {
                message: "node.name must not be empty".to_string(),
            });
        }
        if self.node.capacity < 0 {
            return Err(ClusterError::ConfigError {
                message: format!("node.capacity must be >= 0, got {}", self.node.capacity),
            });
        }
        if self.cluster.heartbeat_interval_ms == 0 {
            return Err(ClusterError::ConfigError {
                message: "cluster.heartbeat_interval_ms must be positive".to_string(),
            });
        }
        if self.cluster.peer_timeout_ms >= self.cluster.lease_ttl_ms {
            return Err(ClusterError::ConfigError {
                message: "cluster.peer_timeout_ms must stay below cluster.lease_ttl_ms".to_string(),
            });
        }
        if self.mqtt.connect_timeout_ms >= self.cluster.peer_timeout_ms {
            return Err(ClusterError::ConfigError {
                message: format!(
                    "mqtt.connect_timeout_ms ({}) must stay below cluster.peer_timeout_ms ({})",
                    self.mqtt.connect_timeout_ms, self.cluster.peer_timeout_ms
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(&dir.path().join("absent.yml")).unwrap();

        assert_eq!(config.node.name, "node1");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.cluster.lease_ttl_ms, 4000);
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let file = write_config(
            r#"
node:
  name: node2
  host: 10.0.0.2
  port: 8082
  role: mqtt
  capacity: 3
store:
  backend: memory
  url: ""
cluster:
  heartbeat_interval_ms: 500
mqtt:
  keep_alive_secs: 10
"#,
        );

        let config = ServerConfig::load(file.path()).unwrap();

        assert_eq!(config.node.name, "node2");
        assert_eq!(config.node.port, 8082);
        assert_eq!(config.node.capacity, 3);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.cluster.heartbeat_interval_ms, 500);
        assert_eq!(config.cluster.reconcile_interval_ms, 1000);
        assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(10));
        assert_eq!(config.mqtt.connect_timeout_ms, 1000);
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_config("cluster:\n  namespace: \"from-file:\"\n");
        std::env::set_var("MQTTPOOL__CLUSTER__NAMESPACE", "from-env:");

        let config = ServerConfig::load(file.path()).unwrap();
        std::env::remove_var("MQTTPOOL__CLUSTER__NAMESPACE");

        assert_eq!(config.cluster.namespace, "from-env:");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = write_config("node:\n  name: a\n  host: h\n  port: 1\n  role: mqtt\n  capacity: -1\n");
        assert!(matches!(
            ServerConfig::load(file.path()),
            Err(ClusterError::ConfigError { .. })
        ));

        let file = write_config("cluster:\n  peer_timeout_ms: 9000\n");
        assert!(ServerConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_connect_timeout_must_undercut_peer_timeout() {
        let file = write_config("mqtt:\n  connect_timeout_ms: 5000\n");
        let err = ServerConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("mqtt.connect_timeout_ms"));

        let file = write_config("mqtt:\n  connect_timeout_ms: 5000\ncluster:\n  peer_timeout_ms: 3000\n  lease_ttl_ms: 10000\n");
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.mqtt.connect_timeout(), Duration::from_millis(5000));
    }
}
