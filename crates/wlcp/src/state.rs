// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared control plane state.
//!
//! [`Core`] owns every handle the loops and HTTP surfaces use. It is built
//! once at startup and shared behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::bus::MessageBus;
use crate::config::{Config, ConfigError, RegistryCacheRule};
use crate::error::{Error, Result};
use crate::hooks::{LifecycleHooks, NoopHooks, PeriodicJobs};
use crate::ids::IdGenerator;
use crate::lock::DistributedLock;
use crate::overlay::{NoopCoordinator, Overlay, StaticOverlay, TailnetCoordinator};
use crate::provisioner::Provisioner;
use crate::status::StatusBroadcaster;
use crate::vcs::{StaticVcs, VcsProvider};

/// Values from [`Config`] the handlers read.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    /// Public URL, also handed to the provisioner on create
    pub access_url: String,
    /// Host suffix of port-proxy subdomains
    pub app_hostname: String,
    pub git_use_tls: bool,
    pub registry_caches: Vec<RegistryCacheRule>,
    /// How often a live agent connection is recorded (default: 3s)
    pub agent_connection_update_frequency: Duration,
    /// Stats report interval handed to agents (default: 5m)
    pub agent_stats_refresh_interval: Duration,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            access_url: "http://localhost:8080".to_string(),
            app_hostname: "localhost".to_string(),
            git_use_tls: false,
            registry_caches: Vec::new(),
            agent_connection_update_frequency: Duration::from_secs(3),
            agent_stats_refresh_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl CoreSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            access_url: config.access_url.clone(),
            app_hostname: config.app_hostname.clone(),
            git_use_tls: config.git_use_tls,
            registry_caches: config.registry_caches.clone(),
            agent_connection_update_frequency: config.agent_connection_update_frequency,
            agent_stats_refresh_interval: config.agent_stats_refresh_interval,
        }
    }

    /// Whether the public URL is served over TLS.
    pub fn tls(&self) -> bool {
        self.access_url.starts_with("https://")
    }
}

/// Handles shared by every component of a node.
pub struct Core {
    pub node_id: i64,
    pub pool: PgPool,
    pub bus: Arc<dyn MessageBus>,
    pub provisioner: Arc<dyn Provisioner>,
    pub ids: IdGenerator,
    pub overlay: Arc<dyn Overlay>,
    pub coordinator: Arc<dyn TailnetCoordinator>,
    pub vcs: Arc<dyn VcsProvider>,
    pub hooks: Arc<dyn LifecycleHooks>,
    pub periodic: Arc<dyn PeriodicJobs>,
    pub status: StatusBroadcaster,
    /// Cross-node lock; absent on standalone nodes
    pub lock: Option<DistributedLock>,
    pub settings: CoreSettings,
}

impl Core {
    pub fn builder() -> CoreBuilder {
        CoreBuilder::default()
    }
}

/// Builder for [`Core`].
///
/// `node_id`, `pool`, `bus` and `provisioner` are required; every external
/// collaborator defaults to its in-memory or no-op implementation.
#[derive(Default)]
pub struct CoreBuilder {
    node_id: Option<i64>,
    pool: Option<PgPool>,
    bus: Option<Arc<dyn MessageBus>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    overlay: Option<Arc<dyn Overlay>>,
    coordinator: Option<Arc<dyn TailnetCoordinator>>,
    vcs: Option<Arc<dyn VcsProvider>>,
    hooks: Option<Arc<dyn LifecycleHooks>>,
    periodic: Option<Arc<dyn PeriodicJobs>>,
    lock: Option<DistributedLock>,
    settings: CoreSettings,
}

impl CoreBuilder {
    pub fn node_id(mut self, node_id: i64) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn overlay(mut self, overlay: Arc<dyn Overlay>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn TailnetCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn vcs(mut self, vcs: Arc<dyn VcsProvider>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn periodic(mut self, periodic: Arc<dyn PeriodicJobs>) -> Self {
        self.periodic = Some(periodic);
        self
    }

    pub fn lock(mut self, lock: DistributedLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn settings(mut self, settings: CoreSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<Core> {
        let node_id = self.node_id.ok_or_else(|| missing("node_id"))?;
        let pool = self.pool.ok_or_else(|| missing("pool"))?;
        let bus = self.bus.ok_or_else(|| missing("bus"))?;
        let provisioner = self.provisioner.ok_or_else(|| missing("provisioner"))?;
        let ids = IdGenerator::new(node_id).map_err(|e| ConfigError::InvalidNodeId(e.0))?;

        let status = StatusBroadcaster::new(
            pool.clone(),
            bus.clone(),
            self.settings.app_hostname.clone(),
            self.settings.tls(),
        );

        Ok(Core {
            node_id,
            pool,
            bus,
            provisioner,
            ids,
            overlay: self.overlay.unwrap_or_else(|| Arc::new(StaticOverlay::new())),
            coordinator: self.coordinator.unwrap_or_else(|| Arc::new(NoopCoordinator)),
            vcs: self.vcs.unwrap_or_else(|| {
                Arc::new(StaticVcs::new(format!(
                    "{}/git",
                    self.settings.access_url.trim_end_matches('/')
                )))
            }),
            hooks: self.hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
            periodic: self.periodic.unwrap_or_else(|| Arc::new(NoopHooks)),
            status,
            lock: self.lock,
            settings: self.settings,
        })
    }
}

fn missing(field: &str) -> Error {
    Error::Other(format!("{} is required", field))
}
