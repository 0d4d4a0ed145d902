// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Round-robin provisioner client over a set of QUIC endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument, warn};
use wlcp_protocol::proto::{
    CreateWorkspaceRequest, ResponseCode, RpcRequest, RpcResponse, WorkspaceRequest,
    rpc_request, rpc_response,
};
use wlcp_protocol::{ClientError, ConnectionConfig, ProvisionerConnection};

use super::{CreateWorkspaceOptions, ECHO_TIMEOUT, NewAgent, Provisioner, ProvisionerError};
use crate::config::ProvisionerEndpoint;

/// Full passes over the endpoint list before giving up.
const MAX_ROTATIONS: usize = 3;
const ROTATION_BACKOFF: Duration = Duration::from_millis(500);

/// One provisioner endpoint as seen by [`ProvisionerClient`].
#[async_trait]
pub trait EndpointTransport: Send + Sync {
    /// Human readable address for logs.
    fn describe(&self) -> String;

    /// Whether a live connection is currently held.
    async fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), ClientError>;

    async fn echo(&self, timeout: Duration) -> Result<(), ClientError>;

    async fn call(&self, request: &RpcRequest) -> Result<RpcResponse, ClientError>;

    async fn close(&self);
}

/// QUIC endpoint resolved and bound on first use.
pub struct QuicEndpoint {
    host: String,
    port: u16,
    skip_verify: bool,
    connection: OnceCell<ProvisionerConnection>,
}

impl QuicEndpoint {
    pub fn new(endpoint: &ProvisionerEndpoint, skip_verify: bool) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            skip_verify,
            connection: OnceCell::new(),
        }
    }

    async fn connection(&self) -> Result<&ProvisionerConnection, ClientError> {
        self.connection
            .get_or_try_init(|| async {
                let mut config = ConnectionConfig::resolve(&self.host, self.port).await?;
                config.dangerous_skip_cert_verification = self.skip_verify;
                ProvisionerConnection::new(config)
            })
            .await
    }
}

#[async_trait]
impl EndpointTransport for QuicEndpoint {
    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn is_connected(&self) -> bool {
        match self.connection.get() {
            Some(conn) => conn.is_connected().await,
            None => false,
        }
    }

    async fn connect(&self) -> Result<(), ClientError> {
        self.connection().await?.connect().await
    }

    async fn echo(&self, timeout: Duration) -> Result<(), ClientError> {
        self.connection().await?.echo(timeout).await
    }

    async fn call(&self, request: &RpcRequest) -> Result<RpcResponse, ClientError> {
        self.connection().await?.call(request).await
    }

    async fn close(&self) {
        if let Some(conn) = self.connection.get() {
            conn.close().await;
        }
    }
}

/// [`Provisioner`] that spreads calls over several endpoints.
///
/// Each call picks the next endpoint in rotation, probing held connections
/// with an echo and redialing dead ones. After every full pass without a
/// healthy endpoint it backs off briefly; after three passes it gives up.
pub struct ProvisionerClient {
    endpoints: Vec<Arc<dyn EndpointTransport>>,
    next: Mutex<usize>,
}

impl ProvisionerClient {
    pub fn new(endpoints: Vec<Arc<dyn EndpointTransport>>) -> Result<Self, ProvisionerError> {
        if endpoints.is_empty() {
            return Err(ProvisionerError::NoEndpoints);
        }
        Ok(Self {
            endpoints,
            next: Mutex::new(0),
        })
    }

    /// Client over QUIC endpoints from configuration.
    pub fn from_config(
        endpoints: &[ProvisionerEndpoint],
        skip_verify: bool,
    ) -> Result<Self, ProvisionerError> {
        Self::new(
            endpoints
                .iter()
                .map(|e| Arc::new(QuicEndpoint::new(e, skip_verify)) as Arc<dyn EndpointTransport>)
                .collect(),
        )
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    async fn select(&self) -> Result<Arc<dyn EndpointTransport>, ProvisionerError> {
        let n = self.endpoints.len();
        let mut next = self.next.lock().await;
        if *next >= n {
            *next = 0;
        }

        let mut attempts = 0;
        loop {
            if attempts >= n * MAX_ROTATIONS {
                return Err(ProvisionerError::AllEndpointsUnreachable);
            }
            if attempts > 0 && attempts % n == 0 {
                tokio::time::sleep(ROTATION_BACKOFF).await;
            }

            let endpoint = self.endpoints[*next].clone();
            *next = (*next + 1) % n;
            attempts += 1;

            if endpoint.is_connected().await {
                match endpoint.echo(ECHO_TIMEOUT).await {
                    Ok(()) => return Ok(endpoint),
                    Err(e) => {
                        debug!(endpoint = %endpoint.describe(), error = %e, "Stale provisioner connection");
                        endpoint.close().await;
                    }
                }
            }

            if let Err(e) = endpoint.connect().await {
                warn!(endpoint = %endpoint.describe(), error = %e, "Failed to connect to provisioner");
                continue;
            }
            if let Err(e) = endpoint.echo(ECHO_TIMEOUT).await {
                warn!(endpoint = %endpoint.describe(), error = %e, "Provisioner failed echo after connect");
                endpoint.close().await;
                continue;
            }
            return Ok(endpoint);
        }
    }

    async fn call(
        &self,
        request: rpc_request::Request,
    ) -> Result<rpc_response::Response, ProvisionerError> {
        let endpoint = self.select().await?;
        let response = endpoint
            .call(&RpcRequest {
                request: Some(request),
            })
            .await?;
        response.response.ok_or_else(unexpected)
    }
}

fn unexpected() -> ProvisionerError {
    ProvisionerError::Transport(ClientError::UnexpectedResponse)
}

fn is_success(status: i32) -> bool {
    status == ResponseCode::Success as i32
}

#[async_trait]
impl Provisioner for ProvisionerClient {
    #[instrument(skip(self, opts), fields(workspace_id = opts.workspace_id))]
    async fn create_workspace(
        &self,
        opts: &CreateWorkspaceOptions,
    ) -> Result<NewAgent, ProvisionerError> {
        let request = rpc_request::Request::CreateWorkspace(CreateWorkspaceRequest {
            workspace_id: opts.workspace_id,
            owner_id: opts.owner_id,
            owner_email: opts.owner_email.clone(),
            owner_name: opts.owner_name.clone(),
            disk: opts.disk,
            cpu: opts.cpu,
            memory: opts.memory,
            container: opts.container.clone(),
            access_url: opts.access_url.clone(),
        });
        let rpc_response::Response::CreateWorkspace(res) = self.call(request).await? else {
            return Err(unexpected());
        };
        if !is_success(res.status) {
            return Err(ProvisionerError::from_status("create", res.status, res.error));
        }
        NewAgent::parse("create", res.agent_id, &res.agent_token)
    }

    #[instrument(skip(self))]
    async fn start_workspace(&self, workspace_id: i64) -> Result<NewAgent, ProvisionerError> {
        let request = rpc_request::Request::StartWorkspace(WorkspaceRequest { workspace_id });
        let rpc_response::Response::StartWorkspace(res) = self.call(request).await? else {
            return Err(unexpected());
        };
        if !is_success(res.status) {
            return Err(ProvisionerError::from_status("start", res.status, res.error));
        }
        NewAgent::parse("start", res.agent_id, &res.agent_token)
    }

    #[instrument(skip(self))]
    async fn stop_workspace(&self, workspace_id: i64) -> Result<(), ProvisionerError> {
        let request = rpc_request::Request::StopWorkspace(WorkspaceRequest { workspace_id });
        let rpc_response::Response::StopWorkspace(res) = self.call(request).await? else {
            return Err(unexpected());
        };
        if !is_success(res.status) {
            return Err(ProvisionerError::from_status("stop", res.status, res.error));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn destroy_workspace(&self, workspace_id: i64) -> Result<(), ProvisionerError> {
        let request = rpc_request::Request::DestroyWorkspace(WorkspaceRequest { workspace_id });
        let rpc_response::Response::DestroyWorkspace(res) = self.call(request).await? else {
            return Err(unexpected());
        };
        if !is_success(res.status) {
            return Err(ProvisionerError::from_status("destroy", res.status, res.error));
        }
        Ok(())
    }
}
