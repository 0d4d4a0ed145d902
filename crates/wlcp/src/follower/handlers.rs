// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transition handlers.
//!
//! Every handler is a [`Transition`]: a provisioner call followed by either
//! a commit of its result or a compensating move back towards a safe state.
//! [`drive`] classifies the outcome; the caller acks the job whatever it is.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{self, legal_predecessors};
use crate::error::{Error, Result};
use crate::jobs::{
    CreateWorkspaceJob, DestroyWorkspaceJob, StartWorkspaceJob, StopWorkspaceJob, TransitionJob,
};
use crate::lock::{DEFAULT_LOCK_TTL, LockError};
use crate::models::{InitFailure, InitState, NewAgentRecord, ProjectKind, UserStatus, WorkspaceState};
use crate::provisioner::{
    self, CREATE_TIMEOUT, CreateWorkspaceOptions, DESTROY_TIMEOUT, NewAgent, ProvisionerError,
    START_TIMEOUT, STOP_TIMEOUT,
};
use crate::state::Core;

/// Budget of a compensating action. Independent of the job's cancellation.
pub const COMPENSATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const PURGE_LOCK_KEY: &str = "workspace-purge";

/// How a transition job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The transition completed and its result was recorded.
    Committed,
    /// Another process is handling or already handled the transition.
    Skipped,
    /// The provisioner has no backing for the workspace.
    NotFound,
    /// The transition failed and was compensated.
    Compensated,
    /// The transition failed and so did its compensation.
    CompensationFailed,
    /// The workspace could not be read before acting. Nothing was changed;
    /// the leader re-publishes the job.
    Deferred,
}

/// Resource allowance of an account tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu: i32,
    /// GB
    pub memory: i32,
    /// GB
    pub disk: i32,
}

impl ResourceLimits {
    pub fn for_status(status: UserStatus) -> Self {
        match status {
            UserStatus::Basic => Self {
                cpu: 2,
                memory: 3,
                disk: 15,
            },
            UserStatus::Premium => Self {
                cpu: 6,
                memory: 8,
                disk: 50,
            },
        }
    }

    /// `(cpu, memory, disk)` capped to this allowance.
    pub fn bound(&self, cpu: i32, memory: i32, disk: i32) -> (i32, i32, i32) {
        (cpu.min(self.cpu), memory.min(self.memory), disk.min(self.disk))
    }
}

/// One edge of the workspace state machine.
#[async_trait]
pub(crate) trait Transition: Send {
    type Output: Send;

    const KIND: &'static str;
    /// Bound of the provisioner call.
    const TIMEOUT: Duration;

    fn workspace_id(&self) -> i64;

    /// Whether the transition already happened, e.g. a replayed job.
    async fn already_settled(&mut self, _core: &Core) -> Result<bool> {
        Ok(false)
    }

    async fn call(&mut self, core: &Core) -> std::result::Result<Self::Output, ProvisionerError>;

    async fn commit(&mut self, core: &Core, output: Self::Output) -> Result<()>;

    async fn on_not_found(&mut self, core: &Core) -> Result<()> {
        let id = self.workspace_id();
        if db::record_failure(&core.pool, id, &InitFailure::workspace_not_found()).await? {
            core.status.notify(id);
        } else {
            debug!(workspace_id = id, "Workspace already settled, not marking failed");
        }
        Ok(())
    }

    async fn compensate(&mut self, core: &Core, reason: &str) -> Result<()>;
}

enum Attempt {
    Committed,
    AlreadySettled,
    Precondition(Error),
    Call(ProvisionerError),
    Failed(Error),
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `transition` to completion and classify the outcome.
pub(crate) async fn drive<T: Transition>(
    core: &Core,
    mut transition: T,
    cancel: &CancellationToken,
) -> Settlement {
    let id = transition.workspace_id();

    let attempt = AssertUnwindSafe(async {
        match transition.already_settled(core).await {
            Ok(true) => return Attempt::AlreadySettled,
            Ok(false) => {}
            Err(e) => return Attempt::Precondition(e),
        }
        let output = match provisioner::bounded(T::TIMEOUT, cancel, transition.call(core)).await {
            Ok(output) => output,
            Err(e) => return Attempt::Call(e),
        };
        match transition.commit(core, output).await {
            Ok(()) => Attempt::Committed,
            Err(e) => Attempt::Failed(e),
        }
    })
    .catch_unwind()
    .await;

    let reason = match attempt {
        Ok(Attempt::Committed) => {
            info!(workspace_id = id, kind = T::KIND, "Workspace transition committed");
            return Settlement::Committed;
        }
        Ok(Attempt::AlreadySettled) => {
            debug!(workspace_id = id, kind = T::KIND, "Workspace transition already settled");
            return Settlement::Skipped;
        }
        Ok(Attempt::Precondition(e)) => {
            warn!(workspace_id = id, kind = T::KIND, error = %e, "Failed to check workspace before transition");
            return Settlement::Deferred;
        }
        Ok(Attempt::Call(ProvisionerError::AlternativeRequestActive)) => {
            debug!(workspace_id = id, kind = T::KIND, "Another request for the workspace is active");
            return Settlement::Skipped;
        }
        Ok(Attempt::Call(ProvisionerError::WorkspaceNotFound)) => {
            warn!(workspace_id = id, kind = T::KIND, "Workspace not found by the provisioner");
            if let Err(e) = transition.on_not_found(core).await {
                error!(workspace_id = id, error = %e, "Failed to record missing workspace");
            }
            return Settlement::NotFound;
        }
        Ok(Attempt::Call(e)) => {
            error!(workspace_id = id, kind = T::KIND, error = %e, "Provisioner call failed");
            e.to_string()
        }
        Ok(Attempt::Failed(e)) => {
            error!(workspace_id = id, kind = T::KIND, error = %e, "Workspace transition failed");
            e.to_string()
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(workspace_id = id, kind = T::KIND, panic = %message, "Workspace transition panicked");
            format!("panic: {}", message)
        }
    };

    let compensation = tokio::time::timeout(
        COMPENSATION_TIMEOUT,
        AssertUnwindSafe(transition.compensate(core, &reason)).catch_unwind(),
    )
    .await;
    match compensation {
        Ok(Ok(Ok(()))) => Settlement::Compensated,
        Ok(Ok(Err(e))) => {
            error!(workspace_id = id, kind = T::KIND, error = %e, "Compensation failed");
            Settlement::CompensationFailed
        }
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            error!(workspace_id = id, kind = T::KIND, panic = %message, "Compensation panicked");
            Settlement::CompensationFailed
        }
        Err(_) => {
            error!(workspace_id = id, kind = T::KIND, "Compensation timed out");
            Settlement::CompensationFailed
        }
    }
}

/// Handle one transition job.
pub async fn handle_job(core: &Core, job: TransitionJob, cancel: &CancellationToken) -> Settlement {
    match job {
        TransitionJob::Create(job) => {
            info!(workspace_id = job.workspace_id, "Creating workspace");
            drive(core, CreateTransition::new(job), cancel).await
        }
        TransitionJob::Start(job) => {
            info!(workspace_id = job.workspace_id, "Starting workspace");
            drive(core, StartTransition::new(job), cancel).await
        }
        TransitionJob::Stop(job) => {
            info!(workspace_id = job.workspace_id, "Stopping workspace");
            drive(core, StopTransition { job }, cancel).await
        }
        TransitionJob::Destroy(job) => {
            info!(workspace_id = job.workspace_id, "Destroying workspace");
            drive(core, DestroyTransition { job }, cancel).await
        }
    }
}

// ============================================================================
// Create
// ============================================================================

pub(crate) struct CreateTransition {
    job: CreateWorkspaceJob,
    agent: Option<NewAgent>,
    inserted: bool,
}

impl CreateTransition {
    pub(crate) fn new(job: CreateWorkspaceJob) -> Self {
        Self {
            job,
            agent: None,
            inserted: false,
        }
    }

    fn provisioning_failure() -> InitFailure {
        InitFailure {
            command: "provision".to_string(),
            status: -1,
            stdout: String::new(),
            stderr: "provisioning failed".to_string(),
        }
    }
}

#[async_trait]
impl Transition for CreateTransition {
    type Output = NewAgent;

    const KIND: &'static str = "create";
    const TIMEOUT: Duration = CREATE_TIMEOUT;

    fn workspace_id(&self) -> i64 {
        self.job.workspace_id
    }

    async fn already_settled(&mut self, core: &Core) -> Result<bool> {
        let agents = db::list_agent_ids(&core.pool, self.job.workspace_id).await?;
        Ok(!agents.is_empty())
    }

    async fn call(&mut self, core: &Core) -> std::result::Result<NewAgent, ProvisionerError> {
        // a missing user is bounded like a basic account
        let status = match db::get_user_flags(&core.pool, self.job.owner_id).await {
            Ok(flags) => flags.map_or(UserStatus::Basic, |f| f.user_status),
            Err(e) => {
                warn!(owner_id = self.job.owner_id, error = %e, "Failed to load user status");
                UserStatus::Basic
            }
        };
        let (cpu, memory, disk) =
            ResourceLimits::for_status(status).bound(self.job.cpu, self.job.memory, self.job.disk);

        let access_url = if self.job.access_url.is_empty() {
            core.settings.access_url.clone()
        } else {
            self.job.access_url.clone()
        };
        let opts = CreateWorkspaceOptions {
            workspace_id: self.job.workspace_id,
            owner_id: self.job.owner_id,
            owner_email: self.job.owner_email.clone(),
            owner_name: self.job.owner_name.clone(),
            disk,
            cpu,
            memory,
            container: self.job.container.clone(),
            access_url,
        };
        core.provisioner.create_workspace(&opts).await
    }

    async fn commit(&mut self, core: &Core, agent: NewAgent) -> Result<()> {
        self.agent = Some(agent);
        let identity = core.overlay.create_identity(agent.id).await?;

        let mut tx = core.pool.begin().await?;
        db::insert_agent(
            &mut tx,
            &NewAgentRecord {
                id: agent.id,
                workspace_id: self.job.workspace_id,
                owner_id: self.job.owner_id,
                secret: agent.token,
                overlay_id: identity.identity_id,
                overlay_token: identity.enrollment_token,
            },
        )
        .await?;
        tx.commit().await?;
        self.inserted = true;

        core.status.notify(self.job.workspace_id);
        Ok(())
    }

    async fn compensate(&mut self, core: &Core, reason: &str) -> Result<()> {
        let id = self.job.workspace_id;
        warn!(workspace_id = id, reason = %reason, "Rolling back workspace creation");

        let failed = db::set_init_failure(
            &core.pool,
            id,
            InitState::Provisioning,
            &Self::provisioning_failure(),
            WorkspaceState::Failed,
        )
        .await?;
        if failed {
            core.status.notify(id);
        }

        if let Some(agent) = self.agent {
            if self.inserted
                && let Err(e) = db::delete_agent(&core.pool, agent.id).await
            {
                warn!(workspace_id = id, agent_id = agent.id, error = %e, "Failed to delete agent");
            }
            if let Err(e) = core.overlay.delete_identity(agent.id).await {
                warn!(workspace_id = id, agent_id = agent.id, error = %e, "Failed to delete overlay identity");
            }
        }

        if let Err(e) = core.provisioner.destroy_workspace(id).await {
            warn!(workspace_id = id, error = %e, "Failed to destroy workspace after failed create");
        }
        Ok(())
    }
}

// ============================================================================
// Start
// ============================================================================

pub(crate) struct StartTransition {
    job: StartWorkspaceJob,
    agent: Option<NewAgent>,
}

impl StartTransition {
    pub(crate) fn new(job: StartWorkspaceJob) -> Self {
        Self { job, agent: None }
    }
}

#[async_trait]
impl Transition for StartTransition {
    type Output = NewAgent;

    const KIND: &'static str = "start";
    const TIMEOUT: Duration = START_TIMEOUT;

    fn workspace_id(&self) -> i64 {
        self.job.workspace_id
    }

    async fn call(&mut self, core: &Core) -> std::result::Result<NewAgent, ProvisionerError> {
        core.provisioner.start_workspace(self.job.workspace_id).await
    }

    async fn commit(&mut self, core: &Core, agent: NewAgent) -> Result<()> {
        self.agent = Some(agent);
        let updated =
            db::update_agent_secret(&core.pool, self.job.workspace_id, agent.id, agent.token)
                .await?;
        if !updated {
            return Err(Error::AgentNotFound(agent.id));
        }
        Ok(())
    }

    async fn compensate(&mut self, core: &Core, reason: &str) -> Result<()> {
        let id = self.job.workspace_id;
        warn!(workspace_id = id, reason = %reason, "Stopping workspace after failed start");

        db::set_state_if(
            &core.pool,
            id,
            legal_predecessors(WorkspaceState::Stopping),
            WorkspaceState::Stopping,
        )
        .await?;

        if let Some(agent) = self.agent
            && let Err(e) = db::delete_agent(&core.pool, agent.id).await
        {
            warn!(workspace_id = id, agent_id = agent.id, error = %e, "Failed to delete agent");
        }

        let fallback = match core.provisioner.stop_workspace(id).await {
            Ok(()) => WorkspaceState::Suspended,
            Err(ProvisionerError::WorkspaceNotFound) => WorkspaceState::Failed,
            Err(e) => {
                warn!(workspace_id = id, error = %e, "Failed to stop workspace after failed start");
                WorkspaceState::Suspended
            }
        };

        db::set_state_if(&core.pool, id, legal_predecessors(fallback), fallback).await?;
        core.status.notify(id);
        Ok(())
    }
}

// ============================================================================
// Stop
// ============================================================================

pub(crate) struct StopTransition {
    job: StopWorkspaceJob,
}

#[async_trait]
impl Transition for StopTransition {
    type Output = ();

    const KIND: &'static str = "stop";
    const TIMEOUT: Duration = STOP_TIMEOUT;

    fn workspace_id(&self) -> i64 {
        self.job.workspace_id
    }

    async fn call(&mut self, core: &Core) -> std::result::Result<(), ProvisionerError> {
        core.provisioner.stop_workspace(self.job.workspace_id).await
    }

    async fn commit(&mut self, core: &Core, _output: ()) -> Result<()> {
        let id = self.job.workspace_id;
        let target = if self.job.workspace_failed {
            WorkspaceState::Failed
        } else {
            WorkspaceState::Suspended
        };

        if !db::set_state_if(&core.pool, id, &[WorkspaceState::Stopping], target).await? {
            debug!(workspace_id = id, "Workspace no longer stopping, leaving state as is");
            return Ok(());
        }
        core.status.notify(id);

        let ephemeral = match db::get_user_flags(&core.pool, self.job.owner_id).await? {
            Some(flags) => flags.is_ephemeral,
            None => {
                warn!(workspace_id = id, owner_id = self.job.owner_id, "Workspace owner not found");
                return Ok(());
            }
        };
        if !ephemeral
            && let Err(e) = core.hooks.user_stopped_workspace(self.job.owner_id).await
        {
            error!(workspace_id = id, owner_id = self.job.owner_id, error = %e, "Stopped workspace hook failed");
        }
        Ok(())
    }

    async fn compensate(&mut self, _core: &Core, reason: &str) -> Result<()> {
        // the leader re-publishes once the stopping window elapses
        warn!(workspace_id = self.job.workspace_id, reason = %reason, "Workspace stop left for retry");
        Ok(())
    }
}

// ============================================================================
// Destroy
// ============================================================================

pub(crate) struct DestroyTransition {
    job: DestroyWorkspaceJob,
}

#[async_trait]
impl Transition for DestroyTransition {
    type Output = ();

    const KIND: &'static str = "destroy";
    const TIMEOUT: Duration = DESTROY_TIMEOUT;

    fn workspace_id(&self) -> i64 {
        self.job.workspace_id
    }

    /// A purged or Deleted workspace has nothing left to destroy.
    async fn already_settled(&mut self, core: &Core) -> Result<bool> {
        let ws = db::get_workspace(&core.pool, self.job.workspace_id).await?;
        Ok(ws.is_none_or(|ws| ws.state == WorkspaceState::Deleted))
    }

    async fn call(&mut self, core: &Core) -> std::result::Result<(), ProvisionerError> {
        core.provisioner.destroy_workspace(self.job.workspace_id).await
    }

    async fn commit(&mut self, core: &Core, _output: ()) -> Result<()> {
        let id = self.job.workspace_id;

        let deleted = db::set_state_if(
            &core.pool,
            id,
            legal_predecessors(WorkspaceState::Deleted),
            WorkspaceState::Deleted,
        )
        .await?;
        if !deleted {
            warn!(workspace_id = id, "Workspace left removing before destroy settled");
            return Ok(());
        }
        core.status.notify(id);

        for agent_id in db::list_agent_ids(&core.pool, id).await? {
            if let Err(e) = core.overlay.delete_identity(agent_id).await {
                warn!(workspace_id = id, agent_id, error = %e, "Failed to delete overlay identity");
            }
        }
        db::delete_agents_for_workspace(&core.pool, id).await?;

        if self.job.project_kind != ProjectKind::Bytes
            && let Err(e) = core.vcs.revoke_workspace_token(self.job.owner_id, id).await
        {
            warn!(workspace_id = id, error = %e, "Failed to revoke workspace git token");
        }

        if let Err(e) = core.hooks.cleanup_ephemeral(&[id]).await {
            error!(workspace_id = id, error = %e, "Ephemeral cleanup failed");
        }
        Ok(())
    }

    /// Nothing left to destroy.
    async fn on_not_found(&mut self, core: &Core) -> Result<()> {
        self.commit(core, ()).await
    }

    async fn compensate(&mut self, _core: &Core, reason: &str) -> Result<()> {
        warn!(workspace_id = self.job.workspace_id, reason = %reason, "Workspace destroy left for retry");
        Ok(())
    }
}

// ============================================================================
// Deleted-workspace sweep
// ============================================================================

/// Remove every workspace Deleted for more than a day, with its agents and
/// stats. Serialized across nodes when a distributed lock is configured.
/// Returns the number of workspaces removed.
pub async fn purge_deleted(core: &Core) -> Result<usize> {
    let mut guard = match &core.lock {
        Some(lock) => match lock.acquire(PURGE_LOCK_KEY, DEFAULT_LOCK_TTL).await {
            Ok(guard) => Some(guard),
            Err(LockError::Contended(_)) => {
                debug!("Deleted workspace sweep running on another node");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        },
        None => None,
    };

    let ids = db::select_deleted_for_purge(&core.pool).await?;
    let mut purged = 0;
    for id in ids {
        match db::delete_workspace_cascade(&core.pool, id).await {
            Ok(()) => purged += 1,
            Err(e) => error!(workspace_id = id, error = %e, "Failed to purge deleted workspace"),
        }
    }

    if let Some(guard) = guard.as_mut()
        && let Err(e) = guard.release().await
    {
        warn!(key = guard.key(), error = %e, "Failed to release sweep lock");
    }
    if purged > 0 {
        info!(count = purged, "Purged deleted workspaces");
    }
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_limits() {
        let limits = ResourceLimits::for_status(UserStatus::Basic);
        assert_eq!(limits.bound(16, 32, 500), (2, 3, 15));
        assert_eq!(limits.bound(1, 2, 10), (1, 2, 10));
    }

    #[test]
    fn test_premium_limits() {
        let limits = ResourceLimits::for_status(UserStatus::Premium);
        assert_eq!(limits.bound(16, 32, 500), (6, 8, 50));
        assert_eq!(limits.bound(4, 8, 20), (4, 8, 20));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(format!("code {}", 3));
        assert_eq!(panic_message(payload.as_ref()), "code 3");
        let payload: Box<dyn std::any::Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_provisioning_failure_record() {
        let failure = CreateTransition::provisioning_failure();
        assert_eq!(failure.command, "provision");
        assert_eq!(failure.status, -1);
        assert_eq!(failure.stderr, "provisioning failed");
    }
}
