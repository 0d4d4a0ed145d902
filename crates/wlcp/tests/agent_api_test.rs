// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Internal agent API tests.
//!
//! Requests go through the full node router, authenticated the way an
//! in-workspace agent authenticates.

#[macro_use]
mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use common::{TestContext, WorkspaceFixture};
use wlcp::api::{self, ApiState};
use wlcp::config::RegistryCacheRule;
use wlcp::coordinator::AgentConnections;
use wlcp::hooks::HookEvent;
use wlcp::models::{AgentState, InitState, ProjectKind, UserStatus, WorkspaceState};
use wlcp::state::CoreSettings;

const WORKSPACE_CONFIG: &str = r#"
version: 0.1
base_container: gigodev/gimg:python
working_directory: /home/gigo/codebase
resources:
  cpu: 2
  mem: 4
  disk: 10
"#;

fn router(ctx: &TestContext) -> Router {
    let state = ApiState::new(ctx.core.clone(), AgentConnections::new())
        .expect("Failed to create API state");
    api::router(state)
}

fn agent_request(path: &str, workspace_id: i64, token: Uuid, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(Method::POST)
        .uri(format!("/internal/v1/ws{}", path))
        .header("Agent-Token", token.to_string())
        .header("Workspace-Id", workspace_id.to_string());
    match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.expect("Request failed");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("Body is not JSON")
    };
    (status, body)
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_missing_credentials_rejected() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/internal/v1/ws/state")
        .header("Content-Type", "application/json")
        .body(Body::from(r#"{"state":"running"}"#))
        .unwrap();
    let (status, body) = send(router(&ctx), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_wrong_token_rejected() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, false).await;
    let ws = ctx.insert_workspace(owner, WorkspaceFixture::default()).await;
    ctx.insert_agent(ws, owner, AgentState::Starting).await;

    let (status, body) = send(
        router(&ctx),
        agent_request("/state", ws, Uuid::new_v4(), Some(json!({"state": "running"}))),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "agent not found");
    assert_eq!(ctx.state_of(ws).await, WorkspaceState::Starting);

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_cookie_credentials_accepted() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, false).await;
    let ws = ctx.insert_workspace(owner, WorkspaceFixture::default()).await;
    let (_, token) = ctx.insert_agent(ws, owner, AgentState::Starting).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/internal/v1/ws/version")
        .header("Cookie", format!("Agent-Token={}; Workspace-Id={}", token, ws))
        .header("Content-Type", "application/json")
        .body(Body::from(r#"{"version":"0.9.1"}"#))
        .unwrap();
    let (status, _) = send(router(&ctx), request).await;
    assert_eq!(status, StatusCode::OK);

    ctx.cleanup().await;
}

// ============================================================================
// State, version, ports, stats
// ============================================================================

#[tokio::test]
async fn test_running_agent_activates_workspace() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, false).await;
    let ws = ctx.insert_workspace(owner, WorkspaceFixture::default()).await;
    let (agent_id, token) = ctx.insert_agent(ws, owner, AgentState::Starting).await;

    let (status, _) = send(
        router(&ctx),
        agent_request("/state", ws, token, Some(json!({"state": "starting"}))),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(ctx.state_of(ws).await, WorkspaceState::Starting);

    let (status, _) = send(
        router(&ctx),
        agent_request("/state", ws, token, Some(json!({"state": "running"}))),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(ctx.state_of(ws).await, WorkspaceState::Active);

    let agent = ctx.agent(agent_id).await.expect("Agent missing");
    assert_eq!(agent.state, AgentState::Running);

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_running_agent_does_not_revive_stopping_workspace() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, false).await;
    let ws = ctx
        .insert_workspace(owner, WorkspaceFixture::in_state(WorkspaceState::Stopping))
        .await;
    let (_, token) = ctx.insert_agent(ws, owner, AgentState::Starting).await;

    let (status, _) = send(
        router(&ctx),
        agent_request("/state", ws, token, Some(json!({"state": "running"}))),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(ctx.state_of(ws).await, WorkspaceState::Stopping);

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_invalid_state_rejected() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, false).await;
    let ws = ctx.insert_workspace(owner, WorkspaceFixture::default()).await;
    let (_, token) = ctx.insert_agent(ws, owner, AgentState::Starting).await;

    let (status, body) = send(
        router(&ctx),
        agent_request("/state", ws, token, Some(json!({"state": "exploded"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "invalid agent state");

    let (status, body) = send(router(&ctx), agent_request("/state", ws, token, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_version_report() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, false).await;
    let ws = ctx.insert_workspace(owner, WorkspaceFixture::default()).await;
    let (agent_id, token) = ctx.insert_agent(ws, owner, AgentState::Starting).await;

    let (status, body) = send(
        router(&ctx),
        agent_request("/version", ws, token, Some(json!({"version": ""}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "invalid version");

    let (status, _) = send(
        router(&ctx),
        agent_request("/version", ws, token, Some(json!({"version": "1.4.2"}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ctx.agent(agent_id).await.expect("Agent missing").version, "1.4.2");

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_ports_are_reconciled() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, false).await;
    let ws = ctx.insert_workspace(owner, WorkspaceFixture::default()).await;
    let (_, token) = ctx.insert_agent(ws, owner, AgentState::Running).await;
    ctx.set_ports(
        ws,
        json!([
            {"name": "web", "port": 3000, "active": false, "http": true, "ssl": false, "configured": true},
            {"name": "docs", "port": 4000, "active": true, "http": true, "ssl": false, "configured": true},
            {"name": "scratch", "port": 5000, "active": true, "http": false, "ssl": false, "configured": false}
        ]),
    )
    .await;

    let report = json!({
        "ports": [
            {"process_name": "node", "port": 3000, "http": true, "ssl": false},
            {"process_name": "python3", "port": 8081, "http": true, "ssl": true}
        ]
    });
    let (status, _) = send(router(&ctx), agent_request("/ports", ws, token, Some(report))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let ports = ctx.workspace(ws).await.ports.0;
    let by_port = |port: u16| ports.iter().find(|p| p.port == port).cloned();

    let web = by_port(3000).expect("configured port dropped");
    assert_eq!(web.name, "web");
    assert!(web.active && web.configured);

    let docs = by_port(4000).expect("configured port dropped");
    assert!(!docs.active);
    assert!(docs.configured);

    let discovered = by_port(8081).expect("reported port missing");
    assert_eq!(discovered.name, "python3");
    assert!(discovered.ssl && !discovered.configured);

    assert!(by_port(5000).is_none());

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_stats_are_stored_unless_idle() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, false).await;
    let ws = ctx.insert_workspace(owner, WorkspaceFixture::default()).await;
    let (_, token) = ctx.insert_agent(ws, owner, AgentState::Running).await;

    let (status, body) = send(
        router(&ctx),
        agent_request("/stats", ws, token, Some(json!({"num_conns": 2}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report_interval"], 300);
    assert_eq!(ctx.stats_count(ws).await, 0);

    let stats = json!({
        "conns_by_proto": {"tcp": 3},
        "num_conns": 3,
        "rx_packets": 10,
        "rx_bytes": 2048,
        "tx_packets": 8,
        "tx_bytes": 1024
    });
    let (status, body) = send(router(&ctx), agent_request("/stats", ws, token, Some(stats))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report_interval"], 300);
    assert_eq!(ctx.stats_count(ws).await, 1);

    ctx.cleanup().await;
}

// ============================================================================
// Initialize
// ============================================================================

#[tokio::test]
async fn test_initialize_bytes_workspace() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Premium, false).await;
    let ws = ctx
        .insert_workspace(owner, WorkspaceFixture::default().kind(ProjectKind::Bytes))
        .await;
    let (agent_id, token) = ctx.insert_agent(ws, owner, AgentState::Starting).await;

    let (status, body) = send(router(&ctx), agent_request("/initialize", ws, token, None)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    assert_eq!(body["workspace_id"], ws);
    assert_eq!(body["workspace_id_string"], ws.to_string());
    assert_eq!(body["owner_id_string"], owner.to_string());
    assert_eq!(body["git_token"], "");
    assert_eq!(body["commit"], "main");
    assert_eq!(body["user_status"], i32::from(UserStatus::Premium));
    assert_eq!(body["workspace_state"], i32::from(WorkspaceState::Starting));
    assert_eq!(body["last_init_state"], i32::from(InitState::Provisioning));
    assert_eq!(
        body["workspace_config"]["base_container"],
        "gigodev/gimg:bytes-base-ubuntu"
    );
    assert_eq!(
        body["vscode_port_proxy_uri"],
        format!("http://{}-{}-{{{{port}}}}.localhost:8080", owner, ws)
    );

    // the overlay identity is created on demand and persisted
    let identity = ctx.overlay.identity(agent_id).expect("No overlay identity");
    assert_eq!(body["overlay_id"], identity.identity_id);
    let agent = ctx.agent(agent_id).await.expect("Agent missing");
    assert_eq!(agent.overlay_token, identity.enrollment_token);

    assert!(ctx.hooks.events().contains(&HookEvent::Started(owner)));
    assert!(ctx.workspace(ws).await.start_time.is_some());

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_initialize_repository_workspace() {
    skip_if_no_db!();
    let ctx = TestContext::with_settings(CoreSettings {
        git_use_tls: true,
        registry_caches: vec![RegistryCacheRule {
            source: "docker.io".to_string(),
            cache: "mirror.wlcp.test".to_string(),
        }],
        ..CoreSettings::default()
    })
    .await
    .expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, true).await;
    let repo_id = ctx.next_id();
    ctx.vcs.set_config(repo_id, WORKSPACE_CONFIG);
    let ws = ctx
        .insert_workspace(owner, WorkspaceFixture::default().repo(repo_id))
        .await;
    let (_, token) = ctx.insert_agent(ws, owner, AgentState::Starting).await;

    let (status, body) = send(router(&ctx), agent_request("/initialize", ws, token, None)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    assert_eq!(body["repo"], format!("https://git.wlcp.test/repos/{}.git", repo_id));
    let git_token = ctx.vcs.token(ws).expect("No git token issued");
    assert_eq!(body["git_token"], git_token);
    assert_eq!(
        body["workspace_config"]["base_container"],
        "mirror.wlcp.test/gigodev/gimg:python"
    );
    assert_eq!(
        body["workspace_config"]["working_directory"],
        "/home/gigo/codebase"
    );

    // ephemeral owners are not reported to the platform
    assert!(ctx.hooks.events().is_empty());

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_initialize_without_workspace_config_fails() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, false).await;
    let ws = ctx
        .insert_workspace(owner, WorkspaceFixture::default().repo(ctx.next_id()))
        .await;
    let (_, token) = ctx.insert_agent(ws, owner, AgentState::Starting).await;

    let (status, body) = send(router(&ctx), agent_request("/initialize", ws, token, None)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["message"], "internal server error");

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_initialize_with_unknown_owner() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.next_id();
    let ws = ctx
        .insert_workspace(owner, WorkspaceFixture::default().kind(ProjectKind::Bytes))
        .await;
    let (_, token) = ctx.insert_agent(ws, owner, AgentState::Starting).await;

    let (status, body) = send(router(&ctx), agent_request("/initialize", ws, token, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "user not found");

    ctx.cleanup().await;
}
