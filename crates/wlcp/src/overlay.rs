// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network overlay between the control plane and workspace agents.
//!
//! The overlay is opaque here: it hands out per-agent identities and dials
//! `(agent_id, port)`. The mesh handshake on the agent's coordinator socket
//! belongs to a [`TailnetCoordinator`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

/// Duplex byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OverlayError {
    #[error("agent {agent_id} is unreachable on port {port}")]
    Unreachable { agent_id: i64, port: u16 },
    #[error("overlay I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("overlay error: {0}")]
    Other(String),
}

/// Enrollment material for a new agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayIdentity {
    pub identity_id: String,
    pub enrollment_token: String,
}

#[async_trait]
pub trait Overlay: Send + Sync {
    async fn create_identity(&self, agent_id: i64) -> Result<OverlayIdentity, OverlayError>;

    async fn delete_identity(&self, agent_id: i64) -> Result<(), OverlayError>;

    async fn dial(&self, agent_id: i64, port: u16) -> Result<BoxedStream, OverlayError>;

    async fn close(&self);
}

/// Mesh handshake for an agent's coordinator socket.
#[async_trait]
pub trait TailnetCoordinator: Send + Sync {
    /// Serve the agent until the stream closes.
    async fn serve_agent(&self, agent_id: i64, stream: BoxedStream) -> Result<(), OverlayError>;
}

/// Overlay with fixed routes from `(agent_id, port)` to TCP addresses.
///
/// Identities are random and only remembered in memory. Useful for local
/// runs where agents listen on reachable addresses, and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticOverlay {
    routes: Arc<Mutex<HashMap<(i64, u16), SocketAddr>>>,
    identities: Arc<Mutex<HashMap<i64, OverlayIdentity>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StaticOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, agent_id: i64, port: u16, addr: SocketAddr) {
        lock(&self.routes).insert((agent_id, port), addr);
    }

    pub fn identity(&self, agent_id: i64) -> Option<OverlayIdentity> {
        lock(&self.identities).get(&agent_id).cloned()
    }
}

#[async_trait]
impl Overlay for StaticOverlay {
    async fn create_identity(&self, agent_id: i64) -> Result<OverlayIdentity, OverlayError> {
        let identity = OverlayIdentity {
            identity_id: format!("agent-{}", agent_id),
            enrollment_token: Uuid::new_v4().to_string(),
        };
        lock(&self.identities).insert(agent_id, identity.clone());
        Ok(identity)
    }

    async fn delete_identity(&self, agent_id: i64) -> Result<(), OverlayError> {
        lock(&self.identities).remove(&agent_id);
        Ok(())
    }

    async fn dial(&self, agent_id: i64, port: u16) -> Result<BoxedStream, OverlayError> {
        let addr = lock(&self.routes)
            .get(&(agent_id, port))
            .copied()
            .ok_or(OverlayError::Unreachable { agent_id, port })?;
        debug!(agent_id, port, addr = %addr, "Dialing agent");
        Ok(Box::new(TcpStream::connect(addr).await?))
    }

    async fn close(&self) {
        lock(&self.routes).clear();
    }
}

/// Coordinator that only drains the agent's stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCoordinator;

#[async_trait]
impl TailnetCoordinator for NoopCoordinator {
    async fn serve_agent(&self, agent_id: i64, mut stream: BoxedStream) -> Result<(), OverlayError> {
        let drained = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await?;
        debug!(agent_id, bytes = drained, "Agent coordinator stream closed");
        Ok(())
    }
}
