// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages exchanged with a workspace provisioner.
//!
//! Each QUIC bidirectional stream carries exactly one [`RpcRequest`] frame
//! followed by one [`RpcResponse`] frame.

/// Status of a provisioner call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResponseCode {
    /// The call succeeded.
    Success = 0,
    /// The request could not be understood by the provisioner.
    MalformedRequest = 1,
    /// The workspace has no provisioner-side backing.
    NotFound = 2,
    /// Another request for the same workspace is in flight.
    AlternativeRequestActive = 3,
    /// Any other failure; details are carried in [`ErrorPayload`].
    Failure = 4,
}

/// A failed command executed by the provisioner.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandError {
    #[prost(int32, tag = "1")]
    pub exit_code: i32,
    #[prost(string, tag = "2")]
    pub stdout: String,
    #[prost(string, tag = "3")]
    pub stderr: String,
}

/// Structured failure details attached to a non-success response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorPayload {
    #[prost(oneof = "error_payload::Kind", tags = "1, 2")]
    pub kind: Option<error_payload::Kind>,
}

/// Nested types for [`ErrorPayload`].
pub mod error_payload {
    /// Either a provisioner-internal error message or a failed command.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(string, tag = "1")]
        ServerError(String),
        #[prost(message, tag = "2")]
        CommandError(super::CommandError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

/// Provision a brand new workspace.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateWorkspaceRequest {
    #[prost(int64, tag = "1")]
    pub workspace_id: i64,
    #[prost(int64, tag = "2")]
    pub owner_id: i64,
    #[prost(string, tag = "3")]
    pub owner_email: String,
    #[prost(string, tag = "4")]
    pub owner_name: String,
    #[prost(int32, tag = "5")]
    pub disk: i32,
    #[prost(int32, tag = "6")]
    pub cpu: i32,
    #[prost(int32, tag = "7")]
    pub memory: i32,
    #[prost(string, tag = "8")]
    pub container: String,
    #[prost(string, tag = "9")]
    pub access_url: String,
}

/// Response to create and start calls.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentResponse {
    #[prost(enumeration = "ResponseCode", tag = "1")]
    pub status: i32,
    #[prost(int64, tag = "2")]
    pub agent_id: i64,
    #[prost(string, tag = "3")]
    pub agent_token: String,
    #[prost(message, optional, tag = "4")]
    pub error: Option<ErrorPayload>,
}

/// Request naming a single workspace (start, stop and destroy).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkspaceRequest {
    #[prost(int64, tag = "1")]
    pub workspace_id: i64,
}

/// Response to stop and destroy calls.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusResponse {
    #[prost(enumeration = "ResponseCode", tag = "1")]
    pub status: i32,
    #[prost(message, optional, tag = "2")]
    pub error: Option<ErrorPayload>,
}

/// Envelope for every provisioner call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(oneof = "rpc_request::Request", tags = "1, 2, 3, 4, 5")]
    pub request: Option<rpc_request::Request>,
}

/// Nested types for [`RpcRequest`].
pub mod rpc_request {
    /// The call being made.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Echo(super::EchoRequest),
        #[prost(message, tag = "2")]
        CreateWorkspace(super::CreateWorkspaceRequest),
        #[prost(message, tag = "3")]
        StartWorkspace(super::WorkspaceRequest),
        #[prost(message, tag = "4")]
        StopWorkspace(super::WorkspaceRequest),
        #[prost(message, tag = "5")]
        DestroyWorkspace(super::WorkspaceRequest),
    }
}

/// Envelope for every provisioner reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Response", tags = "1, 2, 3, 4, 5")]
    pub response: Option<rpc_response::Response>,
}

/// Nested types for [`RpcResponse`].
pub mod rpc_response {
    /// The reply matching the request variant.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        Echo(super::EchoResponse),
        #[prost(message, tag = "2")]
        CreateWorkspace(super::AgentResponse),
        #[prost(message, tag = "3")]
        StartWorkspace(super::AgentResponse),
        #[prost(message, tag = "4")]
        StopWorkspace(super::StatusResponse),
        #[prost(message, tag = "5")]
        DestroyWorkspace(super::StatusResponse),
    }
}

/// Error frame body written when a request cannot be served at all.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl AgentResponse {
    /// Successful response carrying new agent credentials.
    pub fn success(agent_id: i64, agent_token: impl Into<String>) -> Self {
        Self {
            status: ResponseCode::Success as i32,
            agent_id,
            agent_token: agent_token.into(),
            error: None,
        }
    }

    /// Failed response with the given code and optional details.
    pub fn failure(code: ResponseCode, error: Option<ErrorPayload>) -> Self {
        Self {
            status: code as i32,
            agent_id: 0,
            agent_token: String::new(),
            error,
        }
    }
}

impl StatusResponse {
    /// Successful response.
    pub fn success() -> Self {
        Self {
            status: ResponseCode::Success as i32,
            error: None,
        }
    }

    /// Failed response with the given code and optional details.
    pub fn failure(code: ResponseCode, error: Option<ErrorPayload>) -> Self {
        Self {
            status: code as i32,
            error,
        }
    }
}

impl ErrorPayload {
    /// Payload carrying a provisioner-internal error message.
    pub fn server(message: impl Into<String>) -> Self {
        Self {
            kind: Some(error_payload::Kind::ServerError(message.into())),
        }
    }

    /// Payload carrying a failed command.
    pub fn command(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            kind: Some(error_payload::Kind::CommandError(CommandError {
                exit_code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            })),
        }
    }
}
