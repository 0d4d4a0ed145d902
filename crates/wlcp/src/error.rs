// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for wlcp.

use thiserror::Error;

/// Control plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Cache tier operation failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Message bus operation failed.
    #[error("Bus error: {0}")]
    Bus(#[from] crate::bus::BusError),

    /// Provisioner call failed.
    #[error("Provisioner error: {0}")]
    Provisioner(#[from] crate::provisioner::ProvisionerError),

    /// Cluster membership operation failed.
    #[error("Cluster error: {0}")]
    Cluster(#[from] crate::cluster::ClusterError),

    /// Distributed lock operation failed.
    #[error("Lock error: {0}")]
    Lock(#[from] crate::lock::LockError),

    /// Workspace config was structurally invalid.
    #[error("Workspace config error: {0}")]
    WorkspaceConfig(#[from] crate::workspace_config::WorkspaceConfigError),

    /// Overlay operation failed.
    #[error("Overlay error: {0}")]
    Overlay(#[from] crate::overlay::OverlayError),

    /// Version control operation failed.
    #[error("VCS error: {0}")]
    Vcs(#[from] crate::vcs::VcsError),

    /// A platform hook failed.
    #[error("Hook error: {0}")]
    Hook(#[from] crate::hooks::HookError),

    /// Workspace was not found.
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(i64),

    /// Agent was not found.
    #[error("Agent not found: {0}")]
    AgentNotFound(i64),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error, typically from an external collaborator.
    #[error("{0}")]
    Other(String),
}

/// Result type using the control plane Error.
pub type Result<T> = std::result::Result<T, Error>;
