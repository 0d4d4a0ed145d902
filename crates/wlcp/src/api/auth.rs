// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent authentication for the internal API.
//!
//! An agent presents its token and workspace id, each as a header or a
//! same-named cookie. The pair resolves to the newest agent of the workspace
//! holding that token.

use axum::extract::FromRequestParts;
use axum::http::header::COOKIE;
use axum::http::request::Parts;
use tracing::debug;
use uuid::Uuid;

use crate::api::{ApiError, ApiState};
use crate::db;
use crate::models::AuthedAgent;

pub const AGENT_TOKEN_HEADER: &str = "Agent-Token";
pub const WORKSPACE_ID_HEADER: &str = "Workspace-Id";

/// Value of header `name`, falling back to the cookie of the same name.
pub(crate) fn header_or_cookie(parts: &Parts, name: &str) -> Option<String> {
    let header = parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(value) = header {
        return Some(value.to_string());
    }

    parts
        .headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

impl FromRequestParts<ApiState> for AuthedAgent {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self, Self::Rejection> {
        let token = header_or_cookie(parts, AGENT_TOKEN_HEADER)
            .ok_or(ApiError::Unauthorized("agent token required"))?;
        let workspace_id = header_or_cookie(parts, WORKSPACE_ID_HEADER)
            .ok_or(ApiError::Unauthorized("workspace id required"))?;

        let token =
            Uuid::parse_str(&token).map_err(|_| ApiError::Unauthorized("agent not found"))?;
        let workspace_id: i64 = workspace_id
            .parse()
            .map_err(|_| ApiError::Unauthorized("invalid workspace id"))?;

        let agent = db::find_agent_by_token(&state.core.pool, workspace_id, token)
            .await?
            .ok_or(ApiError::Unauthorized("agent not found"))?;

        debug!(
            agent_id = agent.agent_id,
            workspace_id = agent.workspace_id,
            owner_id = agent.owner_id,
            "Authenticated agent"
        );
        Ok(agent)
    }
}
