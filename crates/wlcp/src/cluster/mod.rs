// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster membership and leader election.
//!
//! Every node registers itself under a TTL lease. At most one node holds the
//! cluster's leader key; [`ClusterNode::role`] reports whether this node is
//! that holder as last observed. When the coordinator is unreachable nodes
//! demote themselves, so no leader work runs until it returns.

mod redis_node;
mod standalone;

pub use redis_node::RedisClusterNode;
pub use standalone::StandaloneNode;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Role of a node as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// Change to a node-scoped key under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// Empty for `Deleted`.
    pub value: String,
    pub node_id: i64,
}

/// Cluster membership errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClusterError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("node {0} is not registered")]
    NotRegistered(i64),
    #[error("node {0} is already registered")]
    AlreadyRegistered(i64),
}

/// Settings shared by cluster node implementations.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster_name: String,
    /// Lease TTL; renewed every third of it.
    pub node_ttl: Duration,
    /// How often `watch` polls for changes.
    pub watch_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: "wlcp".to_string(),
            node_ttl: Duration::from_secs(10),
            watch_interval: Duration::from_secs(1),
        }
    }
}

/// Membership of one node in a cluster.
#[async_trait]
pub trait ClusterNode: Send + Sync {
    fn node_id(&self) -> i64;

    /// Take the node lease and start keeping it (and the leader election)
    /// alive in the background.
    async fn register(&self, address: &str) -> Result<(), ClusterError>;

    fn role(&self) -> Role;

    /// Changes to keys starting with `prefix` on any node of this cluster.
    /// Existing keys are reported as `Added` first.
    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, ClusterError>;

    /// Write a key scoped to this node's lease.
    async fn put(&self, key: &str, value: &str) -> Result<(), ClusterError>;

    /// `(node_id, value)` of `key` for every node of `cluster`.
    async fn get(&self, cluster: &str, key: &str) -> Result<Vec<(i64, String)>, ClusterError>;

    /// Stop renewing and release the lease and leadership.
    async fn stop(&self) -> Result<(), ClusterError>;
}
