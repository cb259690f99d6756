//! mqttpool node: hosts pooled MQTT clients and takes part in the cluster.
//!
//! Usage:
//!   mqttpool-server --config app-node1.yml
//!   MQTTPOOL__NODE__NAME=node2 MQTTPOOL__NODE__PORT=8082 mqttpool-server

mod config;
mod health;
mod mqtt;
mod rest;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use mqttpool_client::HttpPeerClient;
use mqttpool_cluster::{driver_channel, ClusterContext, ClusterManager};
use mqttpool_common::CoordinationStore;
use mqttpool_storage::{MemoryStore, RedisStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ServerConfig, StoreBackend};
use crate::mqtt::MqttDriver;
use crate::rest::AppState;

#[derive(Parser, Debug)]
#[command(name = "mqttpool-server", version, about = "Cluster node hosting pooled MQTT clients")]
struct Cli {
    /// YAML configuration file; missing files fall back to defaults
    #[arg(short, long, default_value = "app-node1.yml")]
    config: PathBuf,

    /// Overrides `log_level` from the configuration
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("installing metrics recorder")?;

    let store: Arc<dyn CoordinationStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.store.url)
                .await
                .with_context(|| format!("connecting to {}", config.store.url))?,
        ),
        StoreBackend::Memory => {
            warn!("Using the in-process store; peers will not see this node");
            Arc::new(MemoryStore::new())
        }
    };

    let ctx = ClusterContext::new(config.cluster.clone(), config.node.clone(), store);
    let (events_tx, events_rx) = driver_channel();
    let driver = Arc::new(MqttDriver::new(config.mqtt.clone(), events_tx));
    let peers = Arc::new(HttpPeerClient::new(config.cluster.peer_timeout())?);

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.node.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_address))?;
    // Bound before the liveness loop starts, which probes this node too
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let manager = Arc::new(ClusterManager::new(ctx, driver.clone(), peers));
    manager.start(events_rx).await?;

    let shutdown = manager.cancellation_token();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));

    let state = AppState::new(manager.clone(), metrics);
    let served = rest::start_rest_server(listener, state, shutdown.clone()).await;

    // A failed listener still has to release the background tasks
    shutdown.cancel();
    manager.shutdown().await;
    info!("Closing {} MQTT sessions", driver.open_sessions());
    driver.disconnect_all().await;

    served?;
    info!("Node {} stopped", config.node.name);
    Ok(())
}

async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Ctrl+C handler unavailable: {}", e);
                return;
            }
            info!("Received Ctrl+C, shutting down");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}
