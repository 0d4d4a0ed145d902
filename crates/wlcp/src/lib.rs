// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WLCP - Workspace Lifecycle Control Plane
//!
//! Drives cloud development workspaces through their lifecycle by
//! coordinating a pool of provisioners, a PostgreSQL state store and a
//! message bus, across a cluster of identical nodes.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │  Agents / browsers (HTTP)    │
//!            └──────────────┬───────────────┘
//!                           │ agent API, coordinator, proxy
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                      wlcp node                           │
//! │  ┌──────────────┐  ┌───────────────┐  ┌───────────────┐  │
//! │  │ Leader loop  │  │ Follower loop │  │  HTTP (axum)  │  │
//! │  │ (elected)    │  │ worker pool   │  │               │  │
//! │  └──────┬───────┘  └──────┬────────┘  └───────┬───────┘  │
//! └─────────┼─────────────────┼───────────────────┼──────────┘
//!           │ publish         │ consume           │
//!           ▼                 ▼                   │
//!   ┌────────────────┐  ┌──────────────┐          │
//!   │  Message bus   │  │ Provisioners │◄─ QUIC ──┘
//!   └────────────────┘  └──────────────┘
//!           │
//!           ▼
//!   ┌────────────────────────────────────────────┐
//!   │ PostgreSQL (workspaces, agents, stats)      │
//!   └────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Starting | agent reports running | Active |
//! | Active | expired without traffic | Stopping |
//! | Stopping | provisioner stopped it | Suspended |
//! | Suspended | expired long enough | Removing |
//! | Removing | provisioner destroyed it | Deleted |
//!
//! Transitions are requested as jobs on the bus and executed by whichever
//! follower picks them up. Every state write is conditional on the state
//! the handler expected, so duplicate deliveries settle instead of racing.

/// Internal agent API and shared HTTP error type.
pub mod api;

/// Message bus abstraction with Redis streams and in-memory adapters.
pub mod bus;

/// Cluster membership and leader election.
pub mod cluster;

/// Node configuration loaded from YAML.
pub mod config;

/// Agent coordinator websocket.
pub mod coordinator;

/// PostgreSQL operations on workspaces, agents and stats.
pub mod db;

/// Error types.
pub mod error;

/// Consumer side: job handlers over the provisioner.
pub mod follower;

/// Holiday banner index.
pub mod holiday;

/// Hook points into the rest of the platform.
pub mod hooks;

/// Snowflake id generation.
pub mod ids;

/// Job payloads, subjects and stream catalogue.
pub mod jobs;

/// Producer side: expiry and destroy sweeps, periodic sentinels.
pub mod leader;

/// Redis-backed distributed lock.
pub mod lock;

/// Database migrations.
pub mod migrations;

/// Database records and lifecycle enums.
pub mod models;

/// Network overlay seam.
pub mod overlay;

/// Provisioner client and test double.
pub mod provisioner;

/// Reverse proxy into workspaces.
pub mod proxy;

/// Container registry cache rewriting.
pub mod registry_cache;

/// Per-node routine driving both loops.
pub mod routine;

/// Embeddable runtime.
pub mod runtime;

/// Shared node state.
pub mod state;

/// Workspace status pushes.
pub mod status;

/// Version control seam.
pub mod vcs;

/// Workspace config model.
pub mod workspace_config;

pub use error::{Error, Result};
