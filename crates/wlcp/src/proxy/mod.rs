// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reverse proxy into workspaces.
//!
//! | Surface | Match | Upstream port |
//! |---|---|---|
//! | editor | `/editor/{user}/{workspace}-{commit}/...` | 13337 |
//! | desktop | `/desktop/{user}/{workspace}-{commit}/...` | 13338 |
//! | agent | `/agent/{user}/{workspace}/ws` | [`AGENT_CONTROL_PORT`] |
//! | port | host `{user}-{workspace}-{port}.{app_hostname}` | `{port}` |
//!
//! The caller is identified upstream of this router, which attaches a
//! [`CallingUser`] extension. Only the workspace owner may pass.

mod forward;
mod icons;

use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::any;
use axum::Router;
use regex::Regex;
use tracing::debug;

use crate::api::agent::load_workspace_config;
use crate::api::{ApiError, ApiState};
use crate::config::ConfigError;
use crate::db;
use crate::error::Error;

pub use forward::{strip_cookie, websocket_request_head};
pub use icons::icon_for_path;

/// Port of the editor inside a workspace.
pub const EDITOR_PORT: u16 = 13337;
/// Port of the remote desktop inside a workspace.
pub const DESKTOP_PORT: u16 = 13338;
/// Port of the agent's control socket inside a workspace.
pub const AGENT_CONTROL_PORT: u16 = 13339;

/// Cookie carrying the platform session; never forwarded into workspaces.
pub const AUTH_COOKIE: &str = "gigoAuthToken";

const BLOCKED_PORTS: [u16; 8] = [22, 80, 443, 13337, 13338, 5355, 6060, 8080];

/// Authenticated caller, attached by the platform's authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallingUser(pub i64);

/// Ports that may never be reached through the port proxy.
pub fn is_blocked_port(port: u16) -> bool {
    port < 9 || BLOCKED_PORTS.contains(&port)
}

/// A proxied path split into its owner, workspace and upstream path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget<'a> {
    pub user: &'a str,
    pub workspace: &'a str,
    /// Remainder of the path, possibly empty
    pub internal_path: &'a str,
}

/// Compiled matchers for every proxy surface.
#[derive(Debug)]
pub struct ProxyRoutes {
    editor: Regex,
    desktop: Regex,
    agent: Regex,
    port_host: Regex,
}

fn compile(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|_| Error::Config(ConfigError::Invalid("proxy route pattern")))
}

fn split<'a>(regex: &Regex, path: &'a str) -> Option<ProxyTarget<'a>> {
    let captures = regex.captures(path)?;
    let matched = captures.get(0)?;
    Some(ProxyTarget {
        user: captures.get(1)?.as_str(),
        workspace: captures.get(2)?.as_str(),
        internal_path: &path[matched.end()..],
    })
}

impl ProxyRoutes {
    pub fn new(app_hostname: &str) -> Result<Self, Error> {
        Ok(Self {
            editor: compile(r"^/editor/([0-9]+)/([0-9]+)-[^/]{1,64}")?,
            desktop: compile(r"^/desktop/([0-9]+)/([0-9]+)-[^/]{1,64}")?,
            agent: compile(r"^/agent/([0-9]+)/([0-9]+)")?,
            port_host: compile(&format!(
                r"^([0-9]+)-([0-9]+)-([0-9]+)\.{}(:[0-9]+)?$",
                regex::escape(app_hostname)
            ))?,
        })
    }

    pub fn editor<'a>(&self, path: &'a str) -> Option<ProxyTarget<'a>> {
        split(&self.editor, path)
    }

    pub fn desktop<'a>(&self, path: &'a str) -> Option<ProxyTarget<'a>> {
        split(&self.desktop, path)
    }

    pub fn agent<'a>(&self, path: &'a str) -> Option<ProxyTarget<'a>> {
        split(&self.agent, path)
    }

    /// `(user, workspace, port)` of a port-proxy host, unparsed.
    pub fn port_host<'a>(&self, host: &'a str) -> Option<(&'a str, &'a str, &'a str)> {
        let captures = self.port_host.captures(host)?;
        Some((
            captures.get(1)?.as_str(),
            captures.get(2)?.as_str(),
            captures.get(3)?.as_str(),
        ))
    }
}

/// Proxy routes merged into the node router.
pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/editor/{*rest}", any(editor))
        .route("/desktop/{*rest}", any(desktop))
        .route("/agent/{*rest}", any(agent))
}

/// Check the caller against the path owner; returns `(owner_id, workspace_id)`.
fn authorize(req: &Request, user: &str, workspace: &str) -> Result<(i64, i64), ApiError> {
    let caller = req
        .extensions()
        .get::<CallingUser>()
        .copied()
        .ok_or(ApiError::Unauthorized("login required"))?;
    if caller.0.to_string() != user {
        return Err(ApiError::Forbidden);
    }
    let workspace_id = workspace
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid workspace id".to_string()))?;
    Ok((caller.0, workspace_id))
}

async fn running_agent(state: &ApiState, workspace_id: i64, owner_id: i64) -> Result<i64, ApiError> {
    db::find_running_agent(&state.core.pool, workspace_id, owner_id)
        .await?
        .ok_or(ApiError::NotFound("agent not found"))
}

fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path.to_string(),
    }
}

/// Query string with `folder` set to `working_dir`, or None when it already is.
pub fn folder_query(query: Option<&str>, working_dir: &str) -> Option<String> {
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .into_owned()
        .collect();
    if pairs.iter().any(|(k, v)| k == "folder" && v == working_dir) {
        return None;
    }

    let mut out = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs.iter().filter(|(k, _)| k != "folder") {
        out.append_pair(k, v);
    }
    out.append_pair("folder", working_dir);
    Some(out.finish())
}

/// `ANY /editor/{user}/{workspace}-{commit}/...`
pub async fn editor(State(state): State<ApiState>, req: Request) -> Result<Response, ApiError> {
    let path = req.uri().path().to_string();
    let target = state
        .proxy
        .editor(&path)
        .ok_or(ApiError::NotFound("not found"))?;
    let (owner_id, workspace_id) = authorize(&req, target.user, target.workspace)?;

    if target.internal_path.is_empty() {
        let location = with_query(&format!("{}/", path), req.uri().query());
        return Ok(Redirect::temporary(&location).into_response());
    }
    if let Some(response) = icons::icon_for_path(target.internal_path) {
        return Ok(response);
    }

    let agent_id = running_agent(&state, workspace_id, owner_id).await?;

    if target.internal_path == "/" {
        let ws = db::get_workspace(&state.core.pool, workspace_id)
            .await?
            .ok_or(ApiError::NotFound("workspace not found"))?;
        let config = load_workspace_config(&state.core, &ws).await?;
        if let Some(query) = folder_query(req.uri().query(), &config.working_directory) {
            debug!(workspace_id, "Redirecting editor to working directory");
            return Ok(Redirect::temporary(&format!("{}?{}", path, query)).into_response());
        }
    }

    let internal = target.internal_path.to_string();
    forward::forward(
        state.core.overlay.as_ref(),
        agent_id,
        EDITOR_PORT,
        false,
        &internal,
        req,
    )
    .await
}

/// `ANY /desktop/{user}/{workspace}-{commit}/...`
pub async fn desktop(State(state): State<ApiState>, req: Request) -> Result<Response, ApiError> {
    let path = req.uri().path().to_string();
    let target = state
        .proxy
        .desktop(&path)
        .ok_or(ApiError::NotFound("not found"))?;
    let (owner_id, workspace_id) = authorize(&req, target.user, target.workspace)?;

    if let Some(response) = icons::icon_for_path(target.internal_path) {
        return Ok(response);
    }

    let agent_id = running_agent(&state, workspace_id, owner_id).await?;
    let internal = target.internal_path.to_string();
    forward::forward(
        state.core.overlay.as_ref(),
        agent_id,
        DESKTOP_PORT,
        false,
        &internal,
        req,
    )
    .await
}

/// `ANY /agent/{user}/{workspace}/ws`
pub async fn agent(State(state): State<ApiState>, req: Request) -> Result<Response, ApiError> {
    let path = req.uri().path().to_string();
    let target = state
        .proxy
        .agent(&path)
        .ok_or(ApiError::NotFound("not found"))?;
    let (owner_id, workspace_id) = authorize(&req, target.user, target.workspace)?;

    if target.internal_path != "/ws" {
        let base = &path[..path.len() - target.internal_path.len()];
        let location = with_query(&format!("{}/ws", base), req.uri().query());
        return Ok(Redirect::temporary(&location).into_response());
    }

    let agent_id = running_agent(&state, workspace_id, owner_id).await?;
    forward::forward(
        state.core.overlay.as_ref(),
        agent_id,
        AGENT_CONTROL_PORT,
        false,
        "/ws",
        req,
    )
    .await
}

/// Fallback: forward `{user}-{workspace}-{port}.{app_hostname}` hosts.
pub async fn port_proxy(State(state): State<ApiState>, req: Request) -> Result<Response, ApiError> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .ok_or(ApiError::NotFound("not found"))?;
    let (user, workspace, port) = state
        .proxy
        .port_host(&host)
        .ok_or(ApiError::NotFound("not found"))?;
    let (owner_id, workspace_id) = authorize(&req, user, workspace)?;

    let port: u16 = port
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid port".to_string()))?;
    if is_blocked_port(port) {
        return Err(ApiError::BadRequest(format!(
            "The port {} is not allowed to be forwarded.",
            port
        )));
    }

    let ws = db::get_workspace(&state.core.pool, workspace_id)
        .await?
        .filter(|ws| ws.owner_id == owner_id)
        .ok_or(ApiError::NotFound("workspace not found"))?;
    let ssl = ws
        .ports
        .0
        .iter()
        .find(|p| p.port == port)
        .map(|p| p.ssl)
        .ok_or(ApiError::NotFound("port not found"))?;

    let agent_id = running_agent(&state, workspace_id, owner_id).await?;
    let internal = req.uri().path().to_string();
    forward::forward(
        state.core.overlay.as_ref(),
        agent_id,
        port,
        ssl,
        &internal,
        req,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes() -> ProxyRoutes {
        ProxyRoutes::new("apps.wlcp.dev").unwrap()
    }

    #[test]
    fn test_editor_path_split() {
        let routes = routes();
        let target = routes.editor("/editor/7/99-abc123/static/main.js").unwrap();
        assert_eq!(target.user, "7");
        assert_eq!(target.workspace, "99");
        assert_eq!(target.internal_path, "/static/main.js");

        let target = routes.editor("/editor/7/99-abc123").unwrap();
        assert_eq!(target.internal_path, "");

        assert!(routes.editor("/editor/x/99-abc").is_none());
        assert!(routes.editor("/desktop/7/99-abc").is_none());
    }

    #[test]
    fn test_agent_path_split() {
        let routes = routes();
        let target = routes.agent("/agent/7/99/ws").unwrap();
        assert_eq!((target.user, target.workspace, target.internal_path), ("7", "99", "/ws"));
        assert_eq!(routes.agent("/agent/7/99").unwrap().internal_path, "");
    }

    #[test]
    fn test_port_host() {
        let routes = routes();
        assert_eq!(routes.port_host("7-99-3000.apps.wlcp.dev"), Some(("7", "99", "3000")));
        assert_eq!(
            routes.port_host("7-99-3000.apps.wlcp.dev:8443"),
            Some(("7", "99", "3000"))
        );
        assert!(routes.port_host("7-99-3000.appsXwlcp.dev").is_none());
        assert!(routes.port_host("wlcp.dev").is_none());
    }

    #[test]
    fn test_blocked_ports() {
        for port in [0, 8, 22, 80, 443, 5355, 6060, 8080, 13337, 13338] {
            assert!(is_blocked_port(port), "{} should be blocked", port);
        }
        for port in [9, 3000, 5173, 8000, 13339] {
            assert!(!is_blocked_port(port), "{} should be allowed", port);
        }
    }

    #[test]
    fn test_folder_query() {
        let dir = "/home/gigo/codebase/";
        assert_eq!(
            folder_query(None, dir).as_deref(),
            Some("folder=%2Fhome%2Fgigo%2Fcodebase%2F")
        );
        assert_eq!(
            folder_query(Some("folder=%2Ftmp&tkn=1"), dir).as_deref(),
            Some("tkn=1&folder=%2Fhome%2Fgigo%2Fcodebase%2F")
        );
        assert!(folder_query(Some("folder=%2Fhome%2Fgigo%2Fcodebase%2F"), dir).is_none());
    }
}
