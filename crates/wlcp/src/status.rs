// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace status deltas for downstream subscribers.
//!
//! Every status change is published on `workspace.status.<id>` as the
//! frontend-shaped view of the workspace row. Delivery is fire-and-forget:
//! [`StatusBroadcaster::notify`] hands each publish to its own task, which
//! reads the row when it runs, so the latest message always carries the
//! latest state.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::bus::MessageBus;
use crate::db;
use crate::error::{Error, Result};
use crate::jobs::status_subject;
use crate::models::{InitFailure, InitState, ProjectKind, WorkspaceRecord, WorkspaceState};

/// Port as shown to the user, with its public URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub name: String,
    pub port: u16,
    pub active: bool,
    pub url: String,
}

/// Frontend-shaped view of a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    pub id: String,
    pub code_source_id: String,
    pub code_source_type: ProjectKind,
    pub repo_id: String,
    pub commit: String,
    pub owner_id: String,
    pub state: WorkspaceState,
    pub state_string: String,
    pub init_state: InitState,
    pub init_state_string: String,
    pub init_failure: Option<InitFailure>,
    pub created_at: DateTime<Utc>,
    pub expiration: i64,
    pub last_state_update: DateTime<Utc>,
    pub ports: Vec<PortStatus>,
}

/// Message published on a status subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub workspace: WorkspaceStatus,
}

/// Publishes [`StatusUpdate`]s.
#[derive(Clone)]
pub struct StatusBroadcaster {
    pool: PgPool,
    bus: Arc<dyn MessageBus>,
    hostname: String,
    tls: bool,
}

impl StatusBroadcaster {
    pub fn new(pool: PgPool, bus: Arc<dyn MessageBus>, hostname: impl Into<String>, tls: bool) -> Self {
        Self {
            pool,
            bus,
            hostname: hostname.into(),
            tls,
        }
    }

    /// The delta for `ws`. An unfinished `init_state` is advanced by one to
    /// report the step in flight.
    pub fn delta(&self, ws: &WorkspaceRecord) -> StatusUpdate {
        let init_state = if ws.init_state == InitState::Completed {
            ws.init_state
        } else {
            ws.init_state.next()
        };
        let scheme = if self.tls { "https" } else { "http" };

        StatusUpdate {
            workspace: WorkspaceStatus {
                id: ws.id.to_string(),
                code_source_id: ws.code_source_id.to_string(),
                code_source_type: ws.code_source_type,
                repo_id: ws.repo_id.to_string(),
                commit: ws.commit_sha.clone(),
                owner_id: ws.owner_id.to_string(),
                state: ws.state,
                state_string: ws.state.as_str().to_string(),
                init_state,
                init_state_string: init_state.as_str().to_string(),
                init_failure: ws.init_failure.as_ref().map(|f| f.0.clone()),
                created_at: ws.created_at,
                expiration: ws.expiration.timestamp(),
                last_state_update: ws.last_state_update,
                ports: ws
                    .ports
                    .iter()
                    .map(|p| PortStatus {
                        name: p.name.clone(),
                        port: p.port,
                        active: p.active,
                        url: format!(
                            "{}://{}-{}-{}.{}",
                            scheme, ws.owner_id, ws.id, p.port, self.hostname
                        ),
                    })
                    .collect(),
            },
        }
    }

    /// Load workspace `id` and publish its delta.
    pub async fn push(&self, id: i64) -> Result<()> {
        let ws = db::get_workspace(&self.pool, id)
            .await?
            .ok_or(Error::WorkspaceNotFound(id))?;
        self.push_record(&ws).await
    }

    /// Publish the delta of an already loaded row.
    pub async fn push_record(&self, ws: &WorkspaceRecord) -> Result<()> {
        let payload = serde_json::to_vec(&self.delta(ws))?;
        self.bus
            .publish(&status_subject(ws.id), Bytes::from(payload))
            .await?;
        Ok(())
    }

    /// [`push`](Self::push) on a background task, logging failures.
    pub fn notify(&self, id: i64) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move {
            if let Err(e) = broadcaster.push(id).await {
                warn!(workspace_id = id, error = %e, "Failed to push workspace status");
            }
        })
    }
}
