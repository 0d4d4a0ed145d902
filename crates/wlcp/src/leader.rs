// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leader loop: scans the system of record and publishes transition jobs.
//!
//! Each tick runs three phases in order:
//!
//! 1. **Stop expired**: renew workspaces that still see traffic, then
//!    publish a Stop job for every expired Starting/Active workspace (and
//!    every Stopping one stuck for 15 minutes) and mark the batch Stopping.
//! 2. **Destroy suspended**: publish a Destroy job for every workspace
//!    expired for a day and mark the batch Removing.
//! 3. **Periodic sentinels**: publish the trigger messages of the periodic
//!    platform jobs that are due.
//!
//! Only ids whose publish succeeded are marked. A row that was marked but
//! never published is picked up again once the 15 minute window elapses.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, error, warn};

use crate::db;
use crate::error::Result;
use crate::jobs::{
    self, DestroyWorkspaceJob, StopWorkspaceJob, TransitionJob, SUBJECT_MISC_SESSION_CLEAN_KEYS,
    SUBJECT_MISC_SITEMAP_GENERATE, SUBJECT_MISC_USER_FREE_PREMIUM, SUBJECT_STREAK_DAY_ROLLOVER,
    SUBJECT_STREAK_PREMIUM_FREEZE, SUBJECT_WORKSPACE_DELETE,
};
use crate::models::{WorkspaceRecord, WorkspaceState};
use crate::state::Core;

/// Ticks between session-key GC triggers.
const SESSION_CLEAN_EVERY: u64 = 3;
/// Ticks between Deleted-workspace sweeps.
const DELETE_SWEEP_EVERY: u64 = 60;
/// Wall-clock triggers fire during the first seconds of their minute.
const TRIGGER_WINDOW_SECS: u32 = 10;

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Workspaces whose expiration was extended for recent traffic
    pub renewed: u64,
    /// Workspaces a Stop job was published for
    pub stopping: Vec<i64>,
    /// Workspaces a Destroy job was published for
    pub removing: Vec<i64>,
    /// Sentinel subjects published
    pub sentinels: Vec<&'static str>,
}

/// Decides which periodic sentinels are due on a tick.
///
/// Counter-based triggers use the number of ticks run so far; wall-clock
/// triggers fire at most once per minute.
#[derive(Debug, Default, Clone)]
pub struct SentinelSchedule {
    exec_count: u64,
    last_half_hour: Option<i64>,
    last_midnight: Option<i64>,
}

impl SentinelSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks completed.
    pub fn exec_count(&self) -> u64 {
        self.exec_count
    }

    /// Subjects due at `now`. Advances the tick counter.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<&'static str> {
        let mut due = Vec::new();
        let minute_key = now.timestamp().div_euclid(60);
        let in_window = now.second() < TRIGGER_WINDOW_SECS;

        if self.exec_count % SESSION_CLEAN_EVERY == 0 {
            due.push(SUBJECT_MISC_SESSION_CLEAN_KEYS);
        }

        due.push(SUBJECT_STREAK_DAY_ROLLOVER);

        if self.exec_count % DELETE_SWEEP_EVERY == 0 {
            due.push(SUBJECT_WORKSPACE_DELETE);
        }

        if now.minute() % 30 == 0 && in_window && self.last_half_hour != Some(minute_key) {
            self.last_half_hour = Some(minute_key);
            due.push(SUBJECT_STREAK_PREMIUM_FREEZE);
            due.push(SUBJECT_MISC_USER_FREE_PREMIUM);
        }

        if now.hour() == 0 && now.minute() == 0 && in_window && self.last_midnight != Some(minute_key)
        {
            self.last_midnight = Some(minute_key);
            due.push(SUBJECT_MISC_SITEMAP_GENERATE);
        }

        self.exec_count += 1;
        due
    }
}

/// Leader side of a node. Only the elected node runs [`LeaderLoop::tick`].
pub struct LeaderLoop {
    core: Arc<Core>,
    schedule: SentinelSchedule,
}

impl LeaderLoop {
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            schedule: SentinelSchedule::new(),
        }
    }

    /// Run every phase once. A failing phase is logged and does not stop
    /// the phases after it.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        match self.stop_expired().await {
            Ok((renewed, ids)) => {
                report.renewed = renewed;
                report.stopping = ids;
            }
            Err(e) => error!(error = %e, "Failed to stop expired workspaces"),
        }

        match self.destroy_suspended().await {
            Ok(ids) => report.removing = ids,
            Err(e) => error!(error = %e, "Failed to destroy suspended workspaces"),
        }

        report.sentinels = self.publish_sentinels(Utc::now()).await;
        report
    }

    async fn stop_expired(&self) -> Result<(u64, Vec<i64>)> {
        let mut tx = self.core.pool.begin().await?;

        let renewed = db::renew_workspaces_with_traffic(&mut *tx).await?;
        if renewed > 0 {
            debug!(count = renewed, "Renewed expiration of workspaces with traffic");
        }

        let candidates = db::select_stop_candidates(&mut *tx).await?;
        let mut published = Vec::with_capacity(candidates.len());
        for ws in candidates {
            let job = TransitionJob::Stop(StopWorkspaceJob {
                workspace_id: ws.id,
                owner_id: ws.owner_id,
                workspace_failed: false,
            });
            if self.announce(ws, WorkspaceState::Stopping, &job).await {
                published.push(job.workspace_id());
            }
        }

        let marked = db::mark_transitioning(&mut *tx, &published, WorkspaceState::Stopping).await?;
        tx.commit().await?;

        if !published.is_empty() {
            debug!(published = published.len(), marked, "Published stop jobs");
        }
        Ok((renewed, published))
    }

    async fn destroy_suspended(&self) -> Result<Vec<i64>> {
        let mut tx = self.core.pool.begin().await?;

        let candidates = db::select_destroy_candidates(&mut *tx).await?;
        let mut published = Vec::with_capacity(candidates.len());
        for ws in candidates {
            let job = TransitionJob::Destroy(DestroyWorkspaceJob {
                workspace_id: ws.id,
                owner_id: ws.owner_id,
                project_kind: ws.code_source_type,
            });
            if self.announce(ws, WorkspaceState::Removing, &job).await {
                published.push(job.workspace_id());
            }
        }

        let marked = db::mark_transitioning(&mut *tx, &published, WorkspaceState::Removing).await?;
        tx.commit().await?;

        if !published.is_empty() {
            debug!(published = published.len(), marked, "Published destroy jobs");
        }
        Ok(published)
    }

    /// Push the upcoming state of `ws` and publish `job`. Returns whether
    /// the job was published.
    async fn announce(
        &self,
        mut ws: WorkspaceRecord,
        upcoming: WorkspaceState,
        job: &TransitionJob,
    ) -> bool {
        ws.state = upcoming;
        if let Err(e) = self.core.status.push_record(&ws).await {
            warn!(workspace_id = ws.id, error = %e, "Failed to push workspace status");
        }

        match self.publish(job).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    workspace_id = ws.id,
                    subject = job.subject(),
                    error = %e,
                    "Failed to publish transition job"
                );
                false
            }
        }
    }

    async fn publish(&self, job: &TransitionJob) -> Result<()> {
        let payload = job.encode()?;
        self.core
            .bus
            .publish(job.subject(), Bytes::from(payload))
            .await?;
        Ok(())
    }

    async fn publish_sentinels(&mut self, now: DateTime<Utc>) -> Vec<&'static str> {
        let payload = Bytes::from(jobs::sentinel_payload(self.core.node_id, now.timestamp()));
        let mut published = Vec::new();
        for subject in self.schedule.due(now) {
            match self.core.bus.publish(subject, payload.clone()).await {
                Ok(()) => published.push(subject),
                Err(e) => error!(subject = subject, error = %e, "Failed to publish periodic trigger"),
            }
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_counter_triggers() {
        let mut schedule = SentinelSchedule::new();
        let now = at(10, 7, 30);

        let first = schedule.due(now);
        assert_eq!(
            first,
            vec![
                SUBJECT_MISC_SESSION_CLEAN_KEYS,
                SUBJECT_STREAK_DAY_ROLLOVER,
                SUBJECT_WORKSPACE_DELETE,
            ]
        );
        assert_eq!(schedule.due(now), vec![SUBJECT_STREAK_DAY_ROLLOVER]);
        assert_eq!(schedule.due(now), vec![SUBJECT_STREAK_DAY_ROLLOVER]);
        assert_eq!(
            schedule.due(now),
            vec![SUBJECT_MISC_SESSION_CLEAN_KEYS, SUBJECT_STREAK_DAY_ROLLOVER]
        );
        assert_eq!(schedule.exec_count(), 4);
    }

    #[test]
    fn test_delete_sweep_every_sixty_ticks() {
        let mut schedule = SentinelSchedule::new();
        let now = at(10, 7, 30);
        let sweeps = (0..121)
            .filter(|_| schedule.due(now).contains(&SUBJECT_WORKSPACE_DELETE))
            .count();
        assert_eq!(sweeps, 3);
    }

    #[test]
    fn test_half_hour_triggers_once_per_minute() {
        let mut schedule = SentinelSchedule::new();

        let first = schedule.due(at(10, 30, 1));
        assert!(first.contains(&SUBJECT_STREAK_PREMIUM_FREEZE));
        assert!(first.contains(&SUBJECT_MISC_USER_FREE_PREMIUM));

        let second = schedule.due(at(10, 30, 2));
        assert!(!second.contains(&SUBJECT_STREAK_PREMIUM_FREEZE));

        let outside_window = schedule.due(at(11, 0, 15));
        assert!(!outside_window.contains(&SUBJECT_STREAK_PREMIUM_FREEZE));

        let next_slot = schedule.due(at(11, 0, 3));
        assert!(next_slot.contains(&SUBJECT_STREAK_PREMIUM_FREEZE));
        assert!(!next_slot.contains(&SUBJECT_MISC_SITEMAP_GENERATE));
    }

    #[test]
    fn test_sitemap_at_midnight() {
        let mut schedule = SentinelSchedule::new();

        let midnight = schedule.due(at(0, 0, 4));
        assert!(midnight.contains(&SUBJECT_MISC_SITEMAP_GENERATE));
        assert!(midnight.contains(&SUBJECT_STREAK_PREMIUM_FREEZE));

        assert!(!schedule.due(at(0, 0, 5)).contains(&SUBJECT_MISC_SITEMAP_GENERATE));
        assert!(!schedule.due(at(0, 1, 0)).contains(&SUBJECT_MISC_SITEMAP_GENERATE));
    }
}
