// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-node routine driving the leader and follower loops.
//!
//! Every tick asks the cluster node for its role, runs the leader tick when
//! this node is the leader, then the follower tick. A node that loses its
//! lease stops producing leader work on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::cluster::{ClusterNode, Role};
use crate::follower::FollowerLoop;
use crate::leader::LeaderLoop;

/// Configuration for the node routine.
#[derive(Debug, Clone)]
pub struct NodeRoutineConfig {
    /// Time between ticks (default: 1s)
    pub tick: Duration,
}

impl Default for NodeRoutineConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
        }
    }
}

/// What one tick of the routine did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutineTick {
    pub role: Role,
    /// Follower handlers started
    pub dispatched: usize,
}

pub struct NodeRoutine {
    cluster: Arc<dyn ClusterNode>,
    leader: LeaderLoop,
    follower: FollowerLoop,
    config: NodeRoutineConfig,
    last_role: Option<Role>,
    shutdown: Arc<Notify>,
}

impl NodeRoutine {
    pub fn new(
        cluster: Arc<dyn ClusterNode>,
        leader: LeaderLoop,
        follower: FollowerLoop,
        config: NodeRoutineConfig,
    ) -> Self {
        Self {
            cluster,
            leader,
            follower,
            config,
            last_role: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Tracker of the follower's in-flight handlers.
    pub fn follower_tasks(&self) -> TaskTracker {
        self.follower.tasks()
    }

    pub async fn tick(&mut self) -> RoutineTick {
        let role = self.cluster.role();
        if self.last_role != Some(role) {
            info!(node_id = self.cluster.node_id(), role = ?role, "Node role changed");
            self.last_role = Some(role);
        }

        if role == Role::Leader {
            let report = self.leader.tick().await;
            if !report.stopping.is_empty() || !report.removing.is_empty() {
                debug!(
                    stopping = report.stopping.len(),
                    removing = report.removing.len(),
                    renewed = report.renewed,
                    "Leader tick published transitions"
                );
            }
        }

        let dispatched = self.follower.tick().await;
        RoutineTick { role, dispatched }
    }

    /// Tick until shutdown is signalled.
    pub async fn run(mut self) {
        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            "Node routine started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Node routine received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.tick) => {
                    self.tick().await;
                }
            }
        }

        info!("Node routine stopped");
    }
}
