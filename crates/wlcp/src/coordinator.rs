// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent coordinator sockets.
//!
//! An agent keeps one websocket open to a node. Binary frames carry the
//! mesh handshake and are bridged to the [`TailnetCoordinator`] as a byte
//! stream. While the socket lives the node pings it and records the
//! connection in `workspace_agent`.
//!
//! [`TailnetCoordinator`]: crate::overlay::TailnetCoordinator

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, ApiState};
use crate::db;
use crate::models::AuthedAgent;
use crate::state::Core;

/// Interval between websocket pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const BRIDGE_BUFFER: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live agent sockets of this node.
///
/// A second socket from the same agent replaces the first one.
#[derive(Clone, Default)]
pub struct AgentConnections {
    tasks: TaskTracker,
    cancel: CancellationToken,
    live: Arc<Mutex<HashMap<i64, (u64, CancellationToken)>>>,
    next: Arc<Mutex<u64>>,
}

impl AgentConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of agents currently connected.
    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }

    pub fn is_connected(&self, agent_id: i64) -> bool {
        lock(&self.live).contains_key(&agent_id)
    }

    fn register(&self, agent_id: i64) -> (u64, CancellationToken) {
        let generation = {
            let mut next = lock(&self.next);
            *next += 1;
            *next
        };
        let token = self.cancel.child_token();
        if let Some((_, previous)) = lock(&self.live).insert(agent_id, (generation, token.clone())) {
            debug!(agent_id, "Replacing existing agent connection");
            previous.cancel();
        }
        (generation, token)
    }

    fn release(&self, agent_id: i64, generation: u64) {
        let mut live = lock(&self.live);
        if live.get(&agent_id).is_some_and(|(g, _)| *g == generation) {
            live.remove(&agent_id);
        }
    }

    /// Close every socket and wait up to `timeout` for them to finish.
    ///
    /// Returns false when some connection outlived the timeout.
    pub async fn close_all(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        self.tasks.close();
        let count = self.live_count();
        if count > 0 {
            info!(connections = count, "Closing agent connections");
        }
        match tokio::time::timeout(timeout, self.tasks.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.live_count(),
                    "Agent connections did not close in time"
                );
                false
            }
        }
    }
}

/// `GET /coordinate`
pub async fn coordinate(
    State(state): State<ApiState>,
    agent: AuthedAgent,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    db::get_agent(&state.core.pool, agent.agent_id)
        .await?
        .ok_or(ApiError::NotFound("agent not found"))?;

    let connections = state.connections.clone();
    let core = state.core.clone();
    Ok(upgrade.on_upgrade(move |socket| {
        let tasks = connections.tasks.clone();
        tasks.track_future(serve(core, connections, agent, socket))
    }))
}

async fn record_connected(core: &Core, agent: &AuthedAgent) {
    if let Err(e) = db::mark_agent_connected(&core.pool, agent.agent_id, core.node_id, Utc::now()).await {
        warn!(agent_id = agent.agent_id, error = %e, "Failed to record agent connection");
    }
}

async fn serve(core: Arc<Core>, connections: AgentConnections, agent: AuthedAgent, socket: WebSocket) {
    let (generation, cancel) = connections.register(agent.agent_id);
    info!(agent_id = agent.agent_id, workspace_id = agent.workspace_id, "Agent connected");

    record_connected(&core, &agent).await;
    core.status.notify(agent.workspace_id);

    let (mut local, remote) = tokio::io::duplex(BRIDGE_BUFFER);
    let coordinator = core.coordinator.clone();
    let agent_id = agent.agent_id;
    let mesh = tokio::spawn(async move {
        if let Err(e) = coordinator.serve_agent(agent_id, Box::new(remote)).await {
            warn!(agent_id, error = %e, "Coordinator stream failed");
        }
    });

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.reset();
    let mut bookkeeping = interval(core.settings.agent_connection_update_frequency);
    bookkeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    bookkeeping.reset();
    let mut buf = vec![0u8; BRIDGE_BUFFER];

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(agent_id, "Closing agent connection");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = local.write_all(&data).await {
                        debug!(agent_id, error = %e, "Coordinator stream closed");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(agent_id, error = %e, "Agent socket error");
                    break;
                }
            },

            read = local.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = sink.send(Message::Binary(Bytes::copy_from_slice(&buf[..n]))).await {
                        debug!(agent_id, error = %e, "Failed to write to agent socket");
                        break;
                    }
                }
                Err(e) => {
                    debug!(agent_id, error = %e, "Coordinator stream failed");
                    break;
                }
            },

            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!(agent_id, "Agent missed heartbeat");
                    break;
                }
            }

            _ = bookkeeping.tick() => {
                record_connected(&core, &agent).await;
            }
        }
    }

    drop(local);
    if let Err(e) = mesh.await {
        error!(agent_id, "Coordinator task panicked: {}", e);
    }

    connections.release(agent_id, generation);
    if let Err(e) = db::mark_agent_disconnected(&core.pool, agent_id, Utc::now()).await {
        warn!(agent_id, error = %e, "Failed to record agent disconnect");
    }
    core.status.notify(agent.workspace_id);
    info!(agent_id, workspace_id = agent.workspace_id, "Agent disconnected");
}
