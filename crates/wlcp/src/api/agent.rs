// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handlers of the internal agent API.

use std::collections::HashMap;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{ApiError, ApiState};
use crate::config::ConfigError;
use crate::db;
use crate::error::Error;
use crate::holiday::holiday_index;
use crate::models::{
    AgentState, AgentStats, AuthedAgent, InitState, ProjectKind, UserStatus, WorkspacePort,
    WorkspaceRecord, WorkspaceState,
};
use crate::state::Core;
use crate::workspace_config::WorkspaceConfig;

/// Everything an agent needs to bring its workspace up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub workspace_id: i64,
    pub workspace_id_string: String,
    pub repo: String,
    pub commit: String,
    pub git_token: String,
    pub git_email: String,
    pub git_name: String,
    /// Unix seconds
    pub expiration: i64,
    pub owner_id: i64,
    pub owner_id_string: String,
    pub workspace_settings: serde_json::Value,
    pub vscode_port_proxy_uri: String,
    pub workspace_config: WorkspaceConfig,
    pub last_init_state: InitState,
    pub workspace_state: WorkspaceState,
    pub user_status: UserStatus,
    pub holiday_season: u8,
    pub user_holiday_theme: bool,
    pub challenge_type: i32,
    pub overlay_id: String,
    pub overlay_token: String,
}

#[derive(Debug, Deserialize)]
pub struct StateReport {
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct VersionReport {
    pub version: String,
}

/// A port an agent saw listening.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListeningPort {
    #[serde(default)]
    pub process_name: String,
    pub port: u16,
    #[serde(default)]
    pub http: bool,
    #[serde(default)]
    pub ssl: bool,
}

#[derive(Debug, Deserialize)]
pub struct PortsReport {
    #[serde(default)]
    pub ports: Vec<ListeningPort>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Seconds until the next report
    pub report_interval: u64,
}

/// Port-proxy URL template the editor uses to forward ports.
pub fn port_proxy_uri(access_url: &Url, owner_id: i64, workspace_id: i64, app_hostname: &str) -> String {
    let port = access_url
        .port()
        .map(|p| format!(":{}", p))
        .unwrap_or_default();
    format!(
        "{}://{}-{}-{{{{port}}}}.{}{}",
        access_url.scheme(),
        owner_id,
        workspace_id,
        app_hostname,
        port
    )
}

/// Merge a reported port set into the stored one.
///
/// Reported ports become active entries. Configured ports keep their name
/// and flag when reported, and stay listed as inactive when not.
pub fn reconcile_ports(current: &[WorkspacePort], reported: &[ListeningPort]) -> Vec<WorkspacePort> {
    let configured: HashMap<u16, &WorkspacePort> = current
        .iter()
        .filter(|p| p.configured)
        .map(|p| (p.port, p))
        .collect();

    let mut ports: Vec<WorkspacePort> = reported
        .iter()
        .map(|p| {
            let mut port = WorkspacePort {
                name: p.process_name.clone(),
                port: p.port,
                active: true,
                http: p.http,
                ssl: p.ssl,
                configured: false,
            };
            if let Some(known) = configured.get(&p.port) {
                port.name = known.name.clone();
                port.configured = true;
            }
            port
        })
        .collect();

    for known in current.iter().filter(|p| p.configured) {
        if !reported.iter().any(|p| p.port == known.port) {
            ports.push(WorkspacePort {
                active: false,
                ..known.clone()
            });
        }
    }

    ports
}

/// The workspace config of `ws`, routed through the registry caches.
///
/// A pinned config revision wins; Bytes projects use the built-in config;
/// anything else reads the config from the repository at the commit.
pub(crate) async fn load_workspace_config(
    core: &Core,
    ws: &WorkspaceRecord,
) -> crate::error::Result<WorkspaceConfig> {
    let mut config = match (ws.workspace_config_id, ws.workspace_config_revision) {
        (Some(id), Some(revision)) => {
            let raw = db::get_workspace_config(&core.pool, id, revision)
                .await?
                .ok_or_else(|| {
                    Error::Other(format!("workspace config {} revision {} not found", id, revision))
                })?;
            WorkspaceConfig::parse(&raw)?
        }
        _ if ws.code_source_type == ProjectKind::Bytes => WorkspaceConfig::bytes_default(),
        _ => {
            let raw = core
                .vcs
                .workspace_config(ws.owner_id, ws.repo_id, &ws.commit_sha)
                .await?;
            WorkspaceConfig::parse(&raw)?
        }
    };
    config.apply_registry_caches(&core.settings.registry_caches);
    Ok(config)
}

/// `POST /initialize`
pub async fn initialize(
    State(state): State<ApiState>,
    agent: AuthedAgent,
) -> Result<Json<AgentMetadata>, ApiError> {
    let core = &state.core;

    let user = db::get_user_flags(&core.pool, agent.owner_id)
        .await?
        .ok_or(ApiError::NotFound("user not found"))?;

    let ws = db::get_workspace(&core.pool, agent.workspace_id)
        .await?
        .filter(|ws| ws.owner_id == agent.owner_id)
        .ok_or(ApiError::NotFound("workspace not found"))?;

    let mut record = db::get_agent(&core.pool, agent.agent_id)
        .await?
        .ok_or(ApiError::NotFound("agent not found"))?;
    if record.overlay_id.is_empty() {
        let identity = core.overlay.create_identity(agent.agent_id).await.map_err(Error::from)?;
        db::set_agent_overlay_identity(
            &core.pool,
            agent.agent_id,
            &identity.identity_id,
            &identity.enrollment_token,
        )
        .await?;
        record.overlay_id = identity.identity_id;
        record.overlay_token = identity.enrollment_token;
    }

    let workspace_config = load_workspace_config(core, &ws).await?;

    let mut repo = core.vcs.clone_url(ws.repo_id).await.map_err(Error::from)?;
    if core.settings.git_use_tls {
        repo = repo.replace("http://", "https://");
    }

    let git_token = if ws.code_source_type == ProjectKind::Bytes {
        String::new()
    } else {
        core.vcs
            .issue_workspace_token(ws.owner_id, ws.id)
            .await
            .map_err(Error::from)?
    };

    db::touch_last_state_update(&core.pool, ws.id).await?;

    let access_url = Url::parse(&core.settings.access_url)
        .map_err(|e| Error::Config(ConfigError::InvalidAccessUrl(e.to_string())))?;

    if ws.init_state != InitState::Completed {
        if !user.is_ephemeral {
            core.hooks
                .user_started_workspace(ws.owner_id)
                .await
                .map_err(Error::from)?;
        }
        if db::record_start_time(&core.pool, ws.id).await? {
            debug!(workspace_id = ws.id, "Recorded workspace start time");
        }
    }

    info!(
        agent_id = agent.agent_id,
        workspace_id = ws.id,
        init_state = %ws.init_state,
        "Agent initialized"
    );

    Ok(Json(AgentMetadata {
        workspace_id: ws.id,
        workspace_id_string: ws.id.to_string(),
        repo,
        commit: ws.commit_sha.clone(),
        git_token,
        git_email: format!("{}@git.{}", ws.owner_id, core.settings.app_hostname),
        git_name: ws.owner_id.to_string(),
        expiration: ws.expiration.timestamp(),
        owner_id: ws.owner_id,
        owner_id_string: ws.owner_id.to_string(),
        workspace_settings: ws.workspace_settings.clone(),
        vscode_port_proxy_uri: port_proxy_uri(
            &access_url,
            ws.owner_id,
            ws.id,
            &core.settings.app_hostname,
        ),
        workspace_config,
        last_init_state: ws.init_state,
        workspace_state: ws.state,
        user_status: user.user_status,
        holiday_season: holiday_index(Utc::now().date_naive()),
        user_holiday_theme: user.holiday_themes,
        challenge_type: ws.challenge_type,
        overlay_id: record.overlay_id,
        overlay_token: record.overlay_token,
    }))
}

/// `POST /state`
pub async fn post_state(
    State(state): State<ApiState>,
    agent: AuthedAgent,
    body: Result<Json<StateReport>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(report) = body?;
    let reported = match report.state.as_str() {
        "starting" => AgentState::Starting,
        "running" => AgentState::Running,
        _ => return Err(ApiError::BadRequest("invalid agent state".to_string())),
    };

    let core = &state.core;
    db::update_agent_state(&core.pool, agent.agent_id, reported).await?;
    debug!(agent_id = agent.agent_id, state = %reported, "Agent state reported");

    if reported == AgentState::Running
        && db::activate_workspace_if_starting(&core.pool, agent.workspace_id).await?
    {
        info!(workspace_id = agent.workspace_id, "Workspace active");
    }
    core.status.notify(agent.workspace_id);

    Ok(StatusCode::NO_CONTENT)
}

/// `POST /version`
pub async fn post_version(
    State(state): State<ApiState>,
    agent: AuthedAgent,
    body: Result<Json<VersionReport>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(report) = body?;
    if report.version.trim().is_empty() {
        return Err(ApiError::BadRequest("invalid version".to_string()));
    }

    db::update_agent_version(&state.core.pool, agent.agent_id, &report.version).await?;
    debug!(agent_id = agent.agent_id, version = %report.version, "Agent version reported");
    Ok(StatusCode::OK)
}

/// `POST /ports`
pub async fn post_ports(
    State(state): State<ApiState>,
    agent: AuthedAgent,
    body: Result<Json<PortsReport>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(report) = body?;
    let core = &state.core;

    let mut tx = core.pool.begin().await?;
    let ws = db::get_workspace(&mut *tx, agent.workspace_id)
        .await?
        .ok_or(ApiError::NotFound("workspace not found"))?;
    let ports = reconcile_ports(&ws.ports.0, &report.ports);
    db::update_workspace_ports(&mut *tx, ws.id, &ports).await?;
    tx.commit().await?;

    debug!(workspace_id = ws.id, ports = ports.len(), "Workspace ports reconciled");
    core.status.notify(ws.id);
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /stats`
pub async fn post_stats(
    State(state): State<ApiState>,
    agent: AuthedAgent,
    body: Result<Json<AgentStats>, JsonRejection>,
) -> Result<Json<StatsResponse>, ApiError> {
    let Json(stats) = body?;
    let core = &state.core;
    let response = StatsResponse {
        report_interval: core.settings.agent_stats_refresh_interval.as_secs(),
    };

    if stats.is_idle() {
        return Ok(Json(response));
    }

    if let Err(e) = db::insert_agent_stats(&core.pool, core.ids.generate(), &agent, &stats).await {
        warn!(agent_id = agent.agent_id, error = %e, "Failed to store agent stats");
        return Err(e.into());
    }
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(name: &str, port: u16, active: bool, configured: bool) -> WorkspacePort {
        WorkspacePort {
            name: name.to_string(),
            port,
            active,
            http: true,
            ssl: false,
            configured,
        }
    }

    fn listening(name: &str, port: u16) -> ListeningPort {
        ListeningPort {
            process_name: name.to_string(),
            port,
            http: true,
            ssl: false,
        }
    }

    #[test]
    fn test_port_proxy_uri() {
        let url = Url::parse("https://wlcp.dev").unwrap();
        assert_eq!(
            port_proxy_uri(&url, 7, 99, "apps.wlcp.dev"),
            "https://7-99-{{port}}.apps.wlcp.dev"
        );

        let url = Url::parse("http://localhost:8080").unwrap();
        assert_eq!(
            port_proxy_uri(&url, 7, 99, "localhost"),
            "http://7-99-{{port}}.localhost:8080"
        );
    }

    #[test]
    fn test_reconcile_keeps_configured_names() {
        let current = vec![stored("web", 8000, false, true), stored("node", 3000, true, false)];
        let ports = reconcile_ports(&current, &[listening("python3", 8000), listening("vite", 5173)]);

        assert_eq!(
            ports,
            vec![
                stored("web", 8000, true, true),
                stored("vite", 5173, true, false),
            ]
        );
    }

    #[test]
    fn test_reconcile_marks_missing_configured_inactive() {
        let current = vec![stored("web", 8000, true, true), stored("api", 9000, true, true)];
        let ports = reconcile_ports(&current, &[listening("python3", 9000)]);

        assert_eq!(
            ports,
            vec![stored("api", 9000, true, true), stored("web", 8000, false, true)]
        );
    }

    #[test]
    fn test_reconcile_empty_report() {
        let current = vec![stored("node", 3000, true, false)];
        assert!(reconcile_ports(&current, &[]).is_empty());
    }
}
