// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! wlcp Protocol - QUIC + Protobuf communication with workspace provisioners
//!
//! The control plane drives workspaces through an out-of-process provisioner.
//! This crate carries that conversation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      wlcp-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: one request/response per bidirectional stream   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Calls
//!
//! | Call               | Request                  | Response          |
//! |--------------------|--------------------------|-------------------|
//! | `Echo`             | `EchoRequest`            | `EchoResponse`    |
//! | `CreateWorkspace`  | `CreateWorkspaceRequest` | `AgentResponse`   |
//! | `StartWorkspace`   | `WorkspaceRequest`       | `AgentResponse`   |
//! | `StopWorkspace`    | `WorkspaceRequest`       | `StatusResponse`  |
//! | `DestroyWorkspace` | `WorkspaceRequest`       | `StatusResponse`  |
//!
//! # Usage
//!
//! ```ignore
//! use wlcp_protocol::{ConnectionConfig, ProvisionerConnection, proto};
//!
//! let conn = ProvisionerConnection::new(ConnectionConfig::resolve("prov-0", 7443).await?)?;
//! conn.connect().await?;
//!
//! let request = proto::RpcRequest {
//!     request: Some(proto::rpc_request::Request::StopWorkspace(proto::WorkspaceRequest {
//!         workspace_id: 42,
//!     })),
//! };
//! let response = conn.call(&request).await?;
//! ```

pub mod client;
pub mod frame;
pub mod proto;
pub mod server;

pub use client::{ClientError, ConnectionConfig, ProvisionerConnection, SkipServerVerification};
pub use frame::{Frame, FrameError, FramedStream, MessageType};
pub use server::{ProvisionerServer, ProvisionerServerConfig, ProvisionerService, ServerError};
