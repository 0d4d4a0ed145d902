// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client/server exchange over a real QUIC connection on localhost.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use wlcp_protocol::proto::{
    AgentResponse, CreateWorkspaceRequest, ErrorPayload, ResponseCode, RpcRequest, StatusResponse,
    WorkspaceRequest, error_payload, rpc_request, rpc_response,
};
use wlcp_protocol::{
    ClientError, ConnectionConfig, FrameError, ProvisionerConnection, ProvisionerServer,
    ProvisionerService, ServerError,
};

/// Provisioner that knows only workspace 1 and refuses 13 outright.
struct FakeProvisioner;

#[async_trait]
impl ProvisionerService for FakeProvisioner {
    async fn create_workspace(
        &self,
        request: CreateWorkspaceRequest,
    ) -> Result<AgentResponse, ServerError> {
        if request.workspace_id == 13 {
            return Err(ServerError::Handler("refused".to_string()));
        }
        Ok(AgentResponse::success(
            request.workspace_id * 100,
            "0b4b2f52-6bd4-4c47-8e3b-6f8d3c3fd2a1",
        ))
    }

    async fn start_workspace(
        &self,
        request: WorkspaceRequest,
    ) -> Result<AgentResponse, ServerError> {
        if request.workspace_id == 1 {
            Ok(AgentResponse::success(100, "0b4b2f52-6bd4-4c47-8e3b-6f8d3c3fd2a1"))
        } else {
            Ok(AgentResponse::failure(ResponseCode::NotFound, None))
        }
    }

    async fn stop_workspace(&self, _: WorkspaceRequest) -> Result<StatusResponse, ServerError> {
        Ok(StatusResponse::failure(
            ResponseCode::Failure,
            Some(ErrorPayload::command(1, "", "disk busy")),
        ))
    }

    async fn destroy_workspace(&self, _: WorkspaceRequest) -> Result<StatusResponse, ServerError> {
        Ok(StatusResponse::success())
    }
}

async fn start_server() -> (Arc<ProvisionerServer>, SocketAddr) {
    let server = Arc::new(ProvisionerServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap());
    let addr = server.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(Arc::new(FakeProvisioner)).await;
    });
    (server, addr)
}

fn client_for(addr: SocketAddr) -> ProvisionerConnection {
    let mut config = ConnectionConfig::new(addr, "localhost");
    config.dangerous_skip_cert_verification = true;
    ProvisionerConnection::new(config).unwrap()
}

fn request(request: rpc_request::Request) -> RpcRequest {
    RpcRequest {
        request: Some(request),
    }
}

#[tokio::test]
async fn test_echo_after_connect() {
    let (server, addr) = start_server().await;
    let client = client_for(addr);

    client.connect().await.unwrap();
    assert!(client.is_connected().await);
    client.echo(Duration::from_secs(1)).await.unwrap();

    client.close().await;
    assert!(!client.is_connected().await);
    server.close();
}

#[tokio::test]
async fn test_create_returns_agent() {
    let (server, addr) = start_server().await;
    let client = client_for(addr);
    client.connect().await.unwrap();

    let response = client
        .call(&request(rpc_request::Request::CreateWorkspace(
            CreateWorkspaceRequest {
                workspace_id: 7,
                owner_id: 42,
                cpu: 2,
                memory: 3,
                disk: 15,
                ..Default::default()
            },
        )))
        .await
        .unwrap();

    match response.response {
        Some(rpc_response::Response::CreateWorkspace(agent)) => {
            assert_eq!(agent.status(), ResponseCode::Success);
            assert_eq!(agent.agent_id, 700);
            assert!(!agent.agent_token.is_empty());
        }
        other => panic!("unexpected response: {:?}", other),
    }
    server.close();
}

#[tokio::test]
async fn test_status_codes_cross_the_wire() {
    let (server, addr) = start_server().await;
    let client = client_for(addr);
    client.connect().await.unwrap();

    let start = client
        .call(&request(rpc_request::Request::StartWorkspace(
            WorkspaceRequest { workspace_id: 5 },
        )))
        .await
        .unwrap();
    match start.response {
        Some(rpc_response::Response::StartWorkspace(agent)) => {
            assert_eq!(agent.status(), ResponseCode::NotFound)
        }
        other => panic!("unexpected response: {:?}", other),
    }

    let stop = client
        .call(&request(rpc_request::Request::StopWorkspace(
            WorkspaceRequest { workspace_id: 5 },
        )))
        .await
        .unwrap();
    match stop.response {
        Some(rpc_response::Response::StopWorkspace(status)) => {
            assert_eq!(status.status(), ResponseCode::Failure);
            match status.error.and_then(|e| e.kind) {
                Some(error_payload::Kind::CommandError(cmd)) => {
                    assert_eq!(cmd.exit_code, 1);
                    assert_eq!(cmd.stderr, "disk busy");
                }
                other => panic!("unexpected payload: {:?}", other),
            }
        }
        other => panic!("unexpected response: {:?}", other),
    }
    server.close();
}

#[tokio::test]
async fn test_handler_error_becomes_remote_error() {
    let (server, addr) = start_server().await;
    let client = client_for(addr);
    client.connect().await.unwrap();

    let result = client
        .call(&request(rpc_request::Request::CreateWorkspace(
            CreateWorkspaceRequest {
                workspace_id: 13,
                ..Default::default()
            },
        )))
        .await;

    match result {
        Err(ClientError::Frame(FrameError::Remote { code, message })) => {
            assert_eq!(code, "bad_request");
            assert_eq!(message, "refused");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    server.close();
}

#[tokio::test]
async fn test_connect_reuses_live_connection() {
    let (server, addr) = start_server().await;
    let client = client_for(addr);

    client.connect().await.unwrap();
    client.connect().await.unwrap();
    assert!(client.is_connected().await);
    server.close();
}

#[tokio::test]
async fn test_connect_to_nothing_times_out() {
    // Bind and drop a socket so the port is almost certainly unused.
    let addr = std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let mut config = ConnectionConfig::new(addr, "localhost");
    config.dangerous_skip_cert_verification = true;
    config.connect_timeout_ms = 200;
    let client = ProvisionerConnection::new(config).unwrap();

    let result = client.connect().await;
    assert!(result.is_err());
    assert!(!client.is_connected().await);
}
