// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace provisioner abstraction.
//!
//! The [`Provisioner`] trait is what the follower handlers call. The
//! production implementation is [`ProvisionerClient`], which rotates over
//! several QUIC endpoints; [`MockProvisioner`] scripts outcomes for tests.

mod client;
mod mock;

pub use client::{EndpointTransport, ProvisionerClient, QuicEndpoint};
pub use mock::{MockFailure, MockProvisioner, ProvisionerCall, ProvisionerOp};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wlcp_protocol::ClientError;
use wlcp_protocol::proto::{ErrorPayload, ResponseCode, error_payload};

pub const CREATE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const START_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DESTROY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(1);

/// Failure details reported by the provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFailure {
    /// Provisioner-internal error message.
    Server(String),
    /// A command run by the provisioner exited unsuccessfully.
    Command {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// Non-success status without details.
    Unknown(i32),
}

impl RemoteFailure {
    fn from_response(status: i32, error: Option<ErrorPayload>) -> Self {
        match error.and_then(|e| e.kind) {
            Some(error_payload::Kind::ServerError(message)) if !message.is_empty() => {
                Self::Server(message)
            }
            Some(error_payload::Kind::CommandError(cmd)) => Self::Command {
                exit_code: cmd.exit_code,
                stdout: cmd.stdout,
                stderr: cmd.stderr,
            },
            _ => Self::Unknown(status),
        }
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server(message) => write!(f, "remote server error: {}", message),
            Self::Command {
                exit_code,
                stdout,
                stderr,
            } => write!(
                f,
                "remote command error\n    status: {}\n    out: {}\n    err: {}",
                exit_code, stdout, stderr
            ),
            Self::Unknown(status) => write!(f, "unknown failure status {}", status),
        }
    }
}

/// Provisioner call errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionerError {
    #[error("provisioner rejected a malformed request")]
    MalformedRequest,
    /// The workspace has no provisioner-side backing.
    #[error("workspace not found")]
    WorkspaceNotFound,
    /// Another request for the workspace is in flight elsewhere.
    #[error("alternative request active")]
    AlternativeRequestActive,
    #[error("failed to {op} workspace: {payload}")]
    Remote {
        op: &'static str,
        payload: RemoteFailure,
    },
    #[error("failed to connect to any remote provisioners after 3 attempts")]
    AllEndpointsUnreachable,
    #[error("no provisioner endpoints configured")]
    NoEndpoints,
    #[error("failed to {0} workspace: new agent data missing")]
    MissingAgentData(&'static str),
    #[error("invalid agent token: {0}")]
    InvalidAgentToken(#[from] uuid::Error),
    #[error("provisioner transport error: {0}")]
    Transport(#[from] ClientError),
    #[error("provisioner call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provisioner call cancelled")]
    Cancelled,
}

impl ProvisionerError {
    /// Map a non-success status to the error taxonomy.
    pub(crate) fn from_status(op: &'static str, status: i32, error: Option<ErrorPayload>) -> Self {
        match ResponseCode::try_from(status) {
            Ok(ResponseCode::MalformedRequest) => Self::MalformedRequest,
            Ok(ResponseCode::NotFound) => Self::WorkspaceNotFound,
            Ok(ResponseCode::AlternativeRequestActive) => Self::AlternativeRequestActive,
            _ => Self::Remote {
                op,
                payload: RemoteFailure::from_response(status, error),
            },
        }
    }
}

/// Credentials of the agent of a created or started workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewAgent {
    pub id: i64,
    pub token: Uuid,
}

impl NewAgent {
    /// Validate raw response fields: a non-zero id and a UUID token.
    pub(crate) fn parse(op: &'static str, id: i64, token: &str) -> Result<Self, ProvisionerError> {
        if id == 0 || token.is_empty() {
            return Err(ProvisionerError::MissingAgentData(op));
        }
        Ok(Self {
            id,
            token: Uuid::parse_str(token)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateWorkspaceOptions {
    pub workspace_id: i64,
    pub owner_id: i64,
    pub owner_email: String,
    pub owner_name: String,
    pub disk: i32,
    pub cpu: i32,
    pub memory: i32,
    pub container: String,
    pub access_url: String,
}

/// External workspace provisioner.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create_workspace(
        &self,
        opts: &CreateWorkspaceOptions,
    ) -> Result<NewAgent, ProvisionerError>;

    async fn start_workspace(&self, workspace_id: i64) -> Result<NewAgent, ProvisionerError>;

    async fn stop_workspace(&self, workspace_id: i64) -> Result<(), ProvisionerError>;

    async fn destroy_workspace(&self, workspace_id: i64) -> Result<(), ProvisionerError>;
}

/// Run a provisioner call bounded by `timeout` and `cancel`.
pub async fn bounded<T, F>(
    timeout: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, ProvisionerError>
where
    F: Future<Output = Result<T, ProvisionerError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProvisionerError::Cancelled),
        result = tokio::time::timeout(timeout, call) => {
            result.unwrap_or(Err(ProvisionerError::Timeout(timeout)))
        }
    }
}
