// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scriptable in-process provisioner for tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::{CreateWorkspaceOptions, NewAgent, Provisioner, ProvisionerError, RemoteFailure};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionerOp {
    Create,
    Start,
    Stop,
    Destroy,
}

impl ProvisionerOp {
    fn verb(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Destroy => "destroy",
        }
    }
}

/// A call observed by [`MockProvisioner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionerCall {
    pub op: ProvisionerOp,
    pub workspace_id: i64,
}

/// Scripted failure for the next matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    NotFound,
    AlternativeRequestActive,
    MalformedRequest,
    Remote(String),
    Unreachable,
    /// Never returns; exercises caller timeouts.
    Hang,
}

impl MockFailure {
    fn into_error(self, op: ProvisionerOp) -> ProvisionerError {
        match self {
            Self::NotFound => ProvisionerError::WorkspaceNotFound,
            Self::AlternativeRequestActive => ProvisionerError::AlternativeRequestActive,
            Self::MalformedRequest => ProvisionerError::MalformedRequest,
            Self::Remote(message) => ProvisionerError::Remote {
                op: op.verb(),
                payload: RemoteFailure::Server(message),
            },
            Self::Unreachable | Self::Hang => ProvisionerError::AllEndpointsUnreachable,
        }
    }
}

/// In-memory [`Provisioner`]. Succeeds unless a failure was scripted for
/// the operation and workspace; each scripted failure is used once.
///
/// Create hands out a new agent; start rotates the token of the agent the
/// workspace already has.
#[derive(Clone)]
pub struct MockProvisioner {
    calls: Arc<Mutex<Vec<ProvisionerCall>>>,
    scripted: Arc<Mutex<HashMap<(ProvisionerOp, i64), VecDeque<MockFailure>>>>,
    issued: Arc<Mutex<HashMap<i64, NewAgent>>>,
    next_agent_id: Arc<AtomicI64>,
}

impl Default for MockProvisioner {
    fn default() -> Self {
        // random base so mocks sharing a database do not collide
        let base = (Uuid::new_v4().as_u64_pair().0 >> 24) as i64;
        Self {
            calls: Arc::default(),
            scripted: Arc::default(),
            issued: Arc::default(),
            next_agent_id: Arc::new(AtomicI64::new(base)),
        }
    }
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `op` call for `workspace_id` with `failure`.
    pub fn script(&self, op: ProvisionerOp, workspace_id: i64, failure: MockFailure) {
        lock(&self.scripted)
            .entry((op, workspace_id))
            .or_default()
            .push_back(failure);
    }

    pub fn calls(&self) -> Vec<ProvisionerCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, workspace_id: i64) -> Vec<ProvisionerOp> {
        self.calls()
            .into_iter()
            .filter(|c| c.workspace_id == workspace_id)
            .map(|c| c.op)
            .collect()
    }

    /// Last agent handed out for a workspace by create or start.
    pub fn issued_agent(&self, workspace_id: i64) -> Option<NewAgent> {
        lock(&self.issued).get(&workspace_id).copied()
    }

    /// Treat `agent_id` as the agent of `workspace_id`, e.g. for rows
    /// inserted without a create call.
    pub fn adopt(&self, workspace_id: i64, agent_id: i64) {
        lock(&self.issued).insert(
            workspace_id,
            NewAgent {
                id: agent_id,
                token: Uuid::new_v4(),
            },
        );
    }

    async fn record(&self, op: ProvisionerOp, workspace_id: i64) -> Result<(), ProvisionerError> {
        lock(&self.calls).push(ProvisionerCall { op, workspace_id });
        let failure = lock(&self.scripted)
            .get_mut(&(op, workspace_id))
            .and_then(|queue| queue.pop_front());
        match failure {
            None => Ok(()),
            Some(MockFailure::Hang) => std::future::pending().await,
            Some(failure) => Err(failure.into_error(op)),
        }
    }

    fn issue(&self, workspace_id: i64) -> NewAgent {
        let agent = NewAgent {
            id: self.next_agent_id.fetch_add(1, Ordering::SeqCst),
            token: Uuid::new_v4(),
        };
        lock(&self.issued).insert(workspace_id, agent);
        agent
    }

    fn rotate(&self, workspace_id: i64) -> NewAgent {
        if let Some(agent) = lock(&self.issued).get_mut(&workspace_id) {
            agent.token = Uuid::new_v4();
            return *agent;
        }
        self.issue(workspace_id)
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn create_workspace(
        &self,
        opts: &CreateWorkspaceOptions,
    ) -> Result<NewAgent, ProvisionerError> {
        self.record(ProvisionerOp::Create, opts.workspace_id).await?;
        Ok(self.issue(opts.workspace_id))
    }

    async fn start_workspace(&self, workspace_id: i64) -> Result<NewAgent, ProvisionerError> {
        self.record(ProvisionerOp::Start, workspace_id).await?;
        Ok(self.rotate(workspace_id))
    }

    async fn stop_workspace(&self, workspace_id: i64) -> Result<(), ProvisionerError> {
        self.record(ProvisionerOp::Stop, workspace_id).await
    }

    async fn destroy_workspace(&self, workspace_id: i64) -> Result<(), ProvisionerError> {
        self.record(ProvisionerOp::Destroy, workspace_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failure_used_once() {
        let mock = MockProvisioner::new();
        mock.script(ProvisionerOp::Start, 5, MockFailure::NotFound);

        assert!(matches!(
            mock.start_workspace(5).await,
            Err(ProvisionerError::WorkspaceNotFound)
        ));
        let agent = mock.start_workspace(5).await.unwrap();
        assert_eq!(mock.issued_agent(5), Some(agent));
        assert_eq!(
            mock.calls_for(5),
            vec![ProvisionerOp::Start, ProvisionerOp::Start]
        );
    }

    #[tokio::test]
    async fn test_start_rotates_token_of_created_agent() {
        let mock = MockProvisioner::new();
        let opts = CreateWorkspaceOptions {
            workspace_id: 9,
            owner_id: 1,
            owner_email: String::new(),
            owner_name: String::new(),
            disk: 10,
            cpu: 1,
            memory: 1,
            container: String::new(),
            access_url: String::new(),
        };
        let created = mock.create_workspace(&opts).await.unwrap();
        let started = mock.start_workspace(9).await.unwrap();
        assert_eq!(created.id, started.id);
        assert_ne!(created.token, started.token);

        mock.adopt(10, 77);
        assert_eq!(mock.start_workspace(10).await.unwrap().id, 77);
    }

    #[tokio::test]
    async fn test_failures_are_scoped_to_workspace() {
        let mock = MockProvisioner::new();
        mock.script(ProvisionerOp::Stop, 1, MockFailure::Remote("disk busy".to_string()));

        mock.stop_workspace(2).await.unwrap();
        let err = mock.stop_workspace(1).await.unwrap_err();
        assert_eq!(err.to_string(), "failed to stop workspace: remote server error: disk busy");
    }
}
