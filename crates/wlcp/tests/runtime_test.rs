// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime lifecycle tests.
//!
//! A standalone node is started on loopback and driven over real sockets.

#[macro_use]
mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{TestContext, WorkspaceFixture};
use wlcp::cluster::StandaloneNode;
use wlcp::follower::FollowerConfig;
use wlcp::models::{AgentState, UserStatus, WorkspaceState};
use wlcp::proxy::CallingUser;
use wlcp::runtime::{ControlPlaneRuntime, ControlPlaneRuntimeBuilder};

const TEST_USER_HEADER: &str = "X-Test-User";

fn builder(ctx: &TestContext) -> ControlPlaneRuntimeBuilder {
    ControlPlaneRuntime::builder()
        .core(ctx.core.clone())
        .cluster(Arc::new(StandaloneNode::new(ctx.core.node_id, "wlcp-test")))
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .leader_tick(Duration::from_millis(100))
        .follower(FollowerConfig {
            pool_size: 2,
            fetch_timeout: Duration::from_millis(20),
        })
        .drain_timeout(Duration::from_secs(2))
}

/// Send a raw request and return everything up to the end of the head.
async fn raw_head(stream: &mut TcpStream, request: &str) -> String {
    stream
        .write_all(request.as_bytes())
        .await
        .expect("Failed to send request");

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.expect("Failed to read response");
        assert!(n > 0, "Connection closed mid-head");
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

async fn get(addr: SocketAddr, path: &str, extra_headers: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("Failed to connect");
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\n{}Connection: close\r\n\r\n",
        path, extra_headers
    );
    raw_head(&mut stream, &request).await
}

/// Attach the caller named by a test header.
async fn attach_test_user(mut req: Request, next: Next) -> Response {
    let user = req
        .headers()
        .get(TEST_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    if let Some(user) = user {
        req.extensions_mut().insert(CallingUser(user));
    }
    next.run(req).await
}

#[tokio::test]
async fn test_builder_requires_core_and_cluster() {
    let err = ControlPlaneRuntime::builder().build().err().expect("Build succeeded");
    assert!(err.to_string().contains("core is required"));
}

#[tokio::test]
async fn test_start_serve_and_shutdown() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let runtime = builder(&ctx)
        .build()
        .expect("Failed to build runtime")
        .start()
        .await
        .expect("Failed to start runtime");
    let addr = runtime.local_addr();
    assert!(runtime.is_running());

    let head = get(addr, "/internal/v1/ws/coordinate", "").await;
    assert!(head.starts_with("HTTP/1.1 401"), "{}", head);

    runtime.shutdown().await.expect("Shutdown failed");
    assert!(TcpStream::connect(addr).await.is_err());

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_wrapped_router_identifies_callers() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, false).await;
    let ws = ctx
        .insert_workspace(owner, WorkspaceFixture::in_state(WorkspaceState::Active))
        .await;

    let runtime = builder(&ctx)
        .wrap_router(|router| router.layer(middleware::from_fn(attach_test_user)))
        .build()
        .expect("Failed to build runtime")
        .start()
        .await
        .expect("Failed to start runtime");
    let addr = runtime.local_addr();
    let icon = format!("/editor/{}/{}-abc/favicon.ico", owner, ws);

    let head = get(addr, &icon, "").await;
    assert!(head.starts_with("HTTP/1.1 401"), "{}", head);

    let head = get(addr, &icon, &format!("{}: {}\r\n", TEST_USER_HEADER, owner)).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

    runtime.shutdown().await.expect("Shutdown failed");
    ctx.cleanup().await;
}

#[tokio::test]
async fn test_coordinator_socket_lifecycle() {
    skip_if_no_db!();
    let ctx = TestContext::new().await.expect("Failed to create test context");

    let owner = ctx.insert_user(UserStatus::Basic, false).await;
    let ws = ctx
        .insert_workspace(owner, WorkspaceFixture::in_state(WorkspaceState::Active))
        .await;
    let (agent_id, token) = ctx.insert_agent(ws, owner, AgentState::Running).await;

    let runtime = builder(&ctx)
        .build()
        .expect("Failed to build runtime")
        .start()
        .await
        .expect("Failed to start runtime");

    let mut socket = TcpStream::connect(runtime.local_addr())
        .await
        .expect("Failed to connect");
    let request = format!(
        "GET /internal/v1/ws/coordinate HTTP/1.1\r\n\
         Host: localhost\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Agent-Token: {}\r\n\
         Workspace-Id: {}\r\n\r\n",
        token, ws
    );
    let head = raw_head(&mut socket, &request).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{}", head);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !runtime.connections().is_connected(agent_id) {
        assert!(tokio::time::Instant::now() < deadline, "Agent never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let agent = ctx.agent(agent_id).await.expect("Agent missing");
    assert!(agent.first_connect.is_some());
    assert_eq!(agent.last_connected_node, Some(ctx.core.node_id));

    runtime.shutdown().await.expect("Shutdown failed");

    let agent = ctx.agent(agent_id).await.expect("Agent missing");
    assert!(agent.last_disconnect.is_some());

    drop(socket);
    ctx.cleanup().await;
}
