// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for a control plane node.
//!
//! [`ControlPlaneRuntime`] registers the node in its cluster, runs the
//! leader and follower loops and serves the HTTP surfaces.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wlcp::cluster::StandaloneNode;
//! use wlcp::runtime::ControlPlaneRuntime;
//!
//! let runtime = ControlPlaneRuntime::builder()
//!     .core(core)
//!     .cluster(Arc::new(StandaloneNode::new(0, "wlcp")))
//!     .bind_addr("0.0.0.0:8080".parse()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... run until a shutdown signal ...
//!
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::cluster::ClusterNode;
use crate::config::Config;
use crate::coordinator::AgentConnections;
use crate::follower::{self, FollowerConfig, FollowerLoop};
use crate::leader::LeaderLoop;
use crate::routine::{NodeRoutine, NodeRoutineConfig};
use crate::state::Core;

type RouterHook = Box<dyn FnOnce(Router) -> Router + Send>;

/// Builder for creating a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeBuilder {
    core: Option<Arc<Core>>,
    cluster: Option<Arc<dyn ClusterNode>>,
    bind_addr: SocketAddr,
    node_address: String,
    leader_tick: Duration,
    follower: FollowerConfig,
    drain_timeout: Duration,
    router_hook: Option<RouterHook>,
}

impl Default for ControlPlaneRuntimeBuilder {
    fn default() -> Self {
        Self {
            core: None,
            cluster: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            node_address: "127.0.0.1".to_string(),
            leader_tick: Duration::from_secs(1),
            follower: FollowerConfig::default(),
            drain_timeout: Duration::from_secs(30),
            router_hook: None,
        }
    }
}

impl ControlPlaneRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the process-level settings of `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.bind_addr = config.http_bind_addr;
        self.node_address = config.node_address.clone();
        self.leader_tick = config.leader_tick;
        self.follower.pool_size = config.worker_pool_size;
        self.drain_timeout = config.drain_timeout;
        self
    }

    /// Set the shared node state (required).
    pub fn core(mut self, core: Arc<Core>) -> Self {
        self.core = Some(core);
        self
    }

    /// Set the cluster membership of this node (required).
    pub fn cluster(mut self, cluster: Arc<dyn ClusterNode>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Set the bind address of the HTTP server.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the address this node registers under.
    pub fn node_address(mut self, address: impl Into<String>) -> Self {
        self.node_address = address.into();
        self
    }

    /// Set the routine tick.
    ///
    /// Default: 1 second
    pub fn leader_tick(mut self, tick: Duration) -> Self {
        self.leader_tick = tick;
        self
    }

    /// Set the follower worker pool configuration.
    pub fn follower(mut self, config: FollowerConfig) -> Self {
        self.follower = config;
        self
    }

    /// Set how long shutdown waits for in-flight handlers.
    ///
    /// Default: 30 seconds
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Wrap the HTTP router, e.g. with the layer that attaches
    /// [`CallingUser`](crate::proxy::CallingUser) to proxied requests.
    pub fn wrap_router(mut self, hook: impl FnOnce(Router) -> Router + Send + 'static) -> Self {
        self.router_hook = Some(Box::new(hook));
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControlPlaneRuntimeConfig> {
        let core = self
            .core
            .ok_or_else(|| anyhow::anyhow!("core is required"))?;
        let cluster = self
            .cluster
            .ok_or_else(|| anyhow::anyhow!("cluster is required"))?;

        Ok(ControlPlaneRuntimeConfig {
            core,
            cluster,
            bind_addr: self.bind_addr,
            node_address: self.node_address,
            leader_tick: self.leader_tick,
            follower: self.follower,
            drain_timeout: self.drain_timeout,
            router_hook: self.router_hook,
        })
    }
}

/// Configuration for a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeConfig {
    core: Arc<Core>,
    cluster: Arc<dyn ClusterNode>,
    bind_addr: SocketAddr,
    node_address: String,
    leader_tick: Duration,
    follower: FollowerConfig,
    drain_timeout: Duration,
    router_hook: Option<RouterHook>,
}

impl ControlPlaneRuntimeConfig {
    /// Register the node, then spawn the routine and the HTTP server.
    pub async fn start(self) -> Result<ControlPlaneRuntime> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        self.cluster.register(&self.node_address).await?;

        let cancel = CancellationToken::new();
        let follower = FollowerLoop::new(self.core.clone(), self.follower, cancel.clone()).await?;
        let leader = LeaderLoop::new(self.core.clone());
        let routine = NodeRoutine::new(
            self.cluster.clone(),
            leader,
            follower,
            NodeRoutineConfig {
                tick: self.leader_tick,
            },
        );
        let follower_tasks = routine.follower_tasks();
        let routine_shutdown = routine.shutdown_handle();
        let routine_handle = tokio::spawn(async move {
            routine.run().await;
        });

        let connections = AgentConnections::new();
        let state = ApiState::new(self.core.clone(), connections.clone())?;
        let mut router = api::router(state);
        if let Some(hook) = self.router_hook {
            router = hook(router);
        }

        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        });

        info!(
            node_id = self.core.node_id,
            bind_addr = %local_addr,
            "ControlPlaneRuntime started"
        );

        Ok(ControlPlaneRuntime {
            core: self.core,
            cluster: self.cluster,
            connections,
            cancel,
            follower_tasks,
            routine_handle,
            routine_shutdown,
            server_handle,
            server_shutdown_tx,
            drain_timeout: self.drain_timeout,
            local_addr,
        })
    }
}

/// A running control plane node.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControlPlaneRuntime {
    core: Arc<Core>,
    cluster: Arc<dyn ClusterNode>,
    connections: AgentConnections,
    cancel: CancellationToken,
    follower_tasks: TaskTracker,
    routine_handle: JoinHandle<()>,
    routine_shutdown: Arc<Notify>,
    server_handle: JoinHandle<Result<()>>,
    server_shutdown_tx: watch::Sender<bool>,
    drain_timeout: Duration,
    local_addr: SocketAddr,
}

impl ControlPlaneRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControlPlaneRuntimeBuilder {
        ControlPlaneRuntimeBuilder::new()
    }

    /// Address the HTTP server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Live agent coordinator sockets.
    pub fn connections(&self) -> &AgentConnections {
        &self.connections
    }

    /// Gracefully shut down the node.
    ///
    /// Stops accepting requests and closes agent sockets, releases the
    /// cluster lease, drains in-flight handlers (cancelling them once
    /// the drain timeout expires), then closes the overlay.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControlPlaneRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.connections.close_all(self.drain_timeout).await;

        self.routine_shutdown.notify_one();
        if let Err(e) = self.routine_handle.await {
            error!("Node routine task panicked: {}", e);
        }

        if let Err(e) = self.cluster.stop().await {
            error!("Failed to leave cluster: {}", e);
        }

        if !follower::drain(&self.follower_tasks, self.drain_timeout).await {
            warn!("Cancelling in-flight handlers");
            self.cancel.cancel();
            if tokio::time::timeout(self.drain_timeout, self.follower_tasks.wait())
                .await
                .is_err()
            {
                warn!(
                    in_flight = self.follower_tasks.len(),
                    "Handlers still running after cancellation"
                );
            }
        }
        self.cancel.cancel();

        self.core.overlay.close().await;

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("ControlPlaneRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("HTTP server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("HTTP server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.routine_handle.is_finished()
    }
}
