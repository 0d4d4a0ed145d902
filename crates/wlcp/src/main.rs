// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WLCP - Workspace Lifecycle Control Plane
//!
//! A node of the control plane:
//! - Leader loop (expiry stops, destroy sweeps, periodic sentinels)
//! - Follower loop (create/start/stop/destroy handlers over the provisioner)
//! - Agent API, coordinator sockets and the workspace proxy over HTTP

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use wlcp::bus::{InMemoryBus, MessageBus, RedisStreamsBus};
use wlcp::cluster::{ClusterConfig, ClusterNode, RedisClusterNode, StandaloneNode};
use wlcp::config::Config;
use wlcp::lock::DistributedLock;
use wlcp::migrations;
use wlcp::provisioner::ProvisionerClient;
use wlcp::runtime::ControlPlaneRuntime;
use wlcp::state::{Core, CoreSettings};

#[derive(Debug, Parser)]
#[command(name = "wlcp", version, about = "Workspace lifecycle control plane node")]
struct Args {
    /// Path of the YAML configuration file
    #[arg(long, env = "WLCP_CONFIG", default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wlcp=info,wlcp_protocol=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    info!(
        node_id = config.node_id,
        cluster = config.cluster,
        http_addr = %config.http_bind_addr,
        provisioners = config.provisioners.len(),
        "Starting WLCP node"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database schema verified");

    let (bus, cluster, lock) =
        match config.redis_url.as_deref().filter(|_| config.cluster) {
            Some(redis_url) => {
                let client = redis::Client::open(redis_url)?;
                let conn = client.get_connection_manager().await?;
                let cluster = RedisClusterNode::new(
                    conn.clone(),
                    config.node_id,
                    ClusterConfig {
                        cluster_name: config.cluster_name.clone(),
                        node_ttl: config.node_ttl,
                        ..ClusterConfig::default()
                    },
                );
                let bus = RedisStreamsBus::connect(redis_url, config.node_id).await?;
                let lock = DistributedLock::new(conn, config.cluster_name.clone());
                info!("Clustered mode over Redis");
                (
                    Arc::new(bus) as Arc<dyn MessageBus>,
                    Arc::new(cluster) as Arc<dyn ClusterNode>,
                    Some(lock),
                )
            }
            None => {
                info!("Standalone mode");
                (
                    Arc::new(InMemoryBus::new()) as Arc<dyn MessageBus>,
                    Arc::new(StandaloneNode::new(config.node_id, config.cluster_name.clone()))
                        as Arc<dyn ClusterNode>,
                    None,
                )
            }
        };

    let provisioner = Arc::new(ProvisionerClient::from_config(
        &config.provisioners,
        config.provisioner_tls_skip_verify,
    )?);
    info!(endpoints = provisioner.endpoint_count(), "Provisioner client initialized");

    let mut core = Core::builder()
        .node_id(config.node_id)
        .pool(pool)
        .bus(bus)
        .provisioner(provisioner)
        .settings(CoreSettings::from_config(&config));
    if let Some(lock) = lock {
        core = core.lock(lock);
    }
    let core = Arc::new(core.build()?);

    // Start the runtime
    let runtime = ControlPlaneRuntime::builder()
        .config(&config)
        .core(core)
        .cluster(cluster)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "WLCP node ready");

    // Wait for shutdown signal
    shutdown_signal().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("WLCP node shut down");

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
