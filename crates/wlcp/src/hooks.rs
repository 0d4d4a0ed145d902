// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hook points into the rest of the platform.
//!
//! Streak bookkeeping, ephemeral-account cleanup and the periodic platform
//! jobs live outside the control plane. The control plane only calls these
//! traits at the moments it owns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

/// Failure reported by a hook implementation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

/// Lifecycle notifications.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// A non-ephemeral owner's workspace finished its first init.
    async fn user_started_workspace(&self, owner_id: i64) -> Result<(), HookError>;

    /// A non-ephemeral owner's workspace was stopped.
    async fn user_stopped_workspace(&self, owner_id: i64) -> Result<(), HookError>;

    /// Workspaces were destroyed; remove ephemeral accounts that owned them.
    async fn cleanup_ephemeral(&self, workspace_ids: &[i64]) -> Result<(), HookError>;
}

/// Work triggered by periodic sentinel messages.
#[async_trait]
pub trait PeriodicJobs: Send + Sync {
    async fn run(&self, subject: &str, payload: &[u8]) -> Result<(), HookError>;
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {
    async fn user_started_workspace(&self, owner_id: i64) -> Result<(), HookError> {
        debug!(owner_id, "Workspace started hook");
        Ok(())
    }

    async fn user_stopped_workspace(&self, owner_id: i64) -> Result<(), HookError> {
        debug!(owner_id, "Workspace stopped hook");
        Ok(())
    }

    async fn cleanup_ephemeral(&self, workspace_ids: &[i64]) -> Result<(), HookError> {
        debug!(count = workspace_ids.len(), "Ephemeral cleanup hook");
        Ok(())
    }
}

#[async_trait]
impl PeriodicJobs for NoopHooks {
    async fn run(&self, subject: &str, _payload: &[u8]) -> Result<(), HookError> {
        debug!(subject = %subject, "Periodic job");
        Ok(())
    }
}

/// What a [`RecordingHooks`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    Started(i64),
    Stopped(i64),
    CleanupEphemeral(Vec<i64>),
    Periodic { subject: String, payload: String },
}

/// Hooks that remember every call, in order.
#[derive(Debug, Clone, Default)]
pub struct RecordingHooks {
    events: Arc<Mutex<Vec<HookEvent>>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, Vec<HookEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.log().clone()
    }

    /// Subjects of the periodic jobs run so far.
    pub fn periodic_subjects(&self) -> Vec<String> {
        self.log()
            .iter()
            .filter_map(|e| match e {
                HookEvent::Periodic { subject, .. } => Some(subject.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl LifecycleHooks for RecordingHooks {
    async fn user_started_workspace(&self, owner_id: i64) -> Result<(), HookError> {
        self.log().push(HookEvent::Started(owner_id));
        Ok(())
    }

    async fn user_stopped_workspace(&self, owner_id: i64) -> Result<(), HookError> {
        self.log().push(HookEvent::Stopped(owner_id));
        Ok(())
    }

    async fn cleanup_ephemeral(&self, workspace_ids: &[i64]) -> Result<(), HookError> {
        self.log()
            .push(HookEvent::CleanupEphemeral(workspace_ids.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl PeriodicJobs for RecordingHooks {
    async fn run(&self, subject: &str, payload: &[u8]) -> Result<(), HookError> {
        self.log().push(HookEvent::Periodic {
            subject: subject.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        });
        Ok(())
    }
}
