// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transition job payloads and the stream catalogue.
//!
//! Jobs travel as JSON. Each job kind has its own subject and durable
//! consumer; periodic work is triggered by sentinel messages whose payload
//! is only used for debugging the pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::ProjectKind;

/// Subject of status deltas for one workspace.
pub fn status_subject(workspace_id: i64) -> String {
    format!("{}.{}", STATUS_SUBJECT_PREFIX, workspace_id)
}

pub const STATUS_SUBJECT_PREFIX: &str = "workspace.status";

pub const SUBJECT_WORKSPACE_CREATE: &str = "workspace.create";
pub const SUBJECT_WORKSPACE_START: &str = "workspace.start";
pub const SUBJECT_WORKSPACE_STOP: &str = "workspace.stop";
pub const SUBJECT_WORKSPACE_DESTROY: &str = "workspace.destroy";
pub const SUBJECT_WORKSPACE_DELETE: &str = "workspace.delete";

pub const SUBJECT_MISC_SESSION_CLEAN_KEYS: &str = "misc.session-clean-keys";
pub const SUBJECT_MISC_SITEMAP_GENERATE: &str = "misc.sitemap-generate";
pub const SUBJECT_MISC_USER_FREE_PREMIUM: &str = "misc.user-free-premium";

pub const SUBJECT_STREAK_DAY_ROLLOVER: &str = "streak.day-rollover";
pub const SUBJECT_STREAK_PREMIUM_FREEZE: &str = "streak.premium-freeze";
pub const SUBJECT_STREAK_ADD_XP: &str = "streak.add-xp";
pub const SUBJECT_STREAK_EXPIRATION: &str = "streak.expiration";

/// A durable stream and the subjects it captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: &'static str,
    /// Subject patterns; a trailing `.>` matches any suffix.
    pub subjects: &'static [&'static str],
    pub ack_wait: Duration,
    /// Approximate per-subject cap; `None` keeps everything until acked.
    pub max_len: Option<usize>,
}

impl StreamSpec {
    /// Whether `subject` belongs to this stream.
    pub fn captures(&self, subject: &str) -> bool {
        self.subjects.iter().any(|pattern| match pattern.strip_suffix(".>") {
            Some(prefix) => subject
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.len() > 1 && rest.starts_with('.')),
            None => *pattern == subject,
        })
    }
}

pub const STREAM_WORKSPACE: StreamSpec = StreamSpec {
    name: "workspace",
    subjects: &[
        SUBJECT_WORKSPACE_CREATE,
        SUBJECT_WORKSPACE_START,
        SUBJECT_WORKSPACE_STOP,
        SUBJECT_WORKSPACE_DESTROY,
        SUBJECT_WORKSPACE_DELETE,
    ],
    ack_wait: Duration::from_secs(10 * 60),
    max_len: None,
};

pub const STREAM_MISC: StreamSpec = StreamSpec {
    name: "misc",
    subjects: &[
        SUBJECT_MISC_SESSION_CLEAN_KEYS,
        SUBJECT_MISC_SITEMAP_GENERATE,
        SUBJECT_MISC_USER_FREE_PREMIUM,
    ],
    ack_wait: Duration::from_secs(30),
    max_len: None,
};

pub const STREAM_STREAK: StreamSpec = StreamSpec {
    name: "streak",
    subjects: &[
        SUBJECT_STREAK_DAY_ROLLOVER,
        SUBJECT_STREAK_PREMIUM_FREEZE,
        SUBJECT_STREAK_ADD_XP,
        SUBJECT_STREAK_EXPIRATION,
    ],
    ack_wait: Duration::from_secs(30),
    max_len: None,
};

pub const STREAM_STATUS: StreamSpec = StreamSpec {
    name: "status",
    subjects: &["workspace.status.>"],
    ack_wait: Duration::from_secs(30),
    max_len: Some(256),
};

/// Every stream the control plane uses.
pub const STREAMS: [StreamSpec; 4] = [STREAM_WORKSPACE, STREAM_MISC, STREAM_STREAK, STREAM_STATUS];

pub const CONSUMER_WORKSPACE_CREATE: &str = "wlcp-follower-ws-create";
pub const CONSUMER_WORKSPACE_START: &str = "wlcp-follower-ws-start";
pub const CONSUMER_WORKSPACE_STOP: &str = "wlcp-follower-ws-stop";
pub const CONSUMER_WORKSPACE_DESTROY: &str = "wlcp-follower-ws-destroy";
pub const CONSUMER_WORKSPACE_DELETE: &str = "wlcp-follower-ws-delete";

/// Durable consumer name for a periodic subject, e.g.
/// `misc.sitemap-generate` → `wlcp-follower-misc-sitemap-generate`.
pub fn periodic_consumer_name(subject: &str) -> String {
    format!("wlcp-follower-{}", subject.replace('.', "-"))
}

/// Periodic subjects served by the follower through [`crate::hooks::PeriodicJobs`].
pub const PERIODIC_SUBJECTS: [&str; 7] = [
    SUBJECT_MISC_SESSION_CLEAN_KEYS,
    SUBJECT_MISC_SITEMAP_GENERATE,
    SUBJECT_MISC_USER_FREE_PREMIUM,
    SUBJECT_STREAK_DAY_ROLLOVER,
    SUBJECT_STREAK_PREMIUM_FREEZE,
    SUBJECT_STREAK_ADD_XP,
    SUBJECT_STREAK_EXPIRATION,
];

/// Payload of a periodic trigger: `"{node_id}-{unix_seconds}"`.
pub fn sentinel_payload(node_id: i64, unix_seconds: i64) -> Vec<u8> {
    format!("{}-{}", node_id, unix_seconds).into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWorkspaceJob {
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartWorkspaceJob {
    pub workspace_id: i64,
    pub owner_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopWorkspaceJob {
    pub workspace_id: i64,
    pub owner_id: i64,
    /// Settle on Failed instead of Suspended.
    #[serde(default)]
    pub workspace_failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyWorkspaceJob {
    pub workspace_id: i64,
    pub owner_id: i64,
    pub project_kind: ProjectKind,
}

/// One workspace transition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionJob {
    Create(CreateWorkspaceJob),
    Start(StartWorkspaceJob),
    Stop(StopWorkspaceJob),
    Destroy(DestroyWorkspaceJob),
}

impl TransitionJob {
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Create(_) => SUBJECT_WORKSPACE_CREATE,
            Self::Start(_) => SUBJECT_WORKSPACE_START,
            Self::Stop(_) => SUBJECT_WORKSPACE_STOP,
            Self::Destroy(_) => SUBJECT_WORKSPACE_DESTROY,
        }
    }

    pub fn workspace_id(&self) -> i64 {
        match self {
            Self::Create(job) => job.workspace_id,
            Self::Start(job) => job.workspace_id,
            Self::Stop(job) => job.workspace_id,
            Self::Destroy(job) => job.workspace_id,
        }
    }

    /// Encoded message body.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Create(job) => serde_json::to_vec(job),
            Self::Start(job) => serde_json::to_vec(job),
            Self::Stop(job) => serde_json::to_vec(job),
            Self::Destroy(job) => serde_json::to_vec(job),
        }
    }

    /// Decode a message body received on `subject`.
    pub fn decode(subject: &str, payload: &[u8]) -> Result<Self, JobDecodeError> {
        let job = match subject {
            SUBJECT_WORKSPACE_CREATE => Self::Create(serde_json::from_slice(payload)?),
            SUBJECT_WORKSPACE_START => Self::Start(serde_json::from_slice(payload)?),
            SUBJECT_WORKSPACE_STOP => Self::Stop(serde_json::from_slice(payload)?),
            SUBJECT_WORKSPACE_DESTROY => Self::Destroy(serde_json::from_slice(payload)?),
            other => return Err(JobDecodeError::UnknownSubject(other.to_string())),
        };
        Ok(job)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobDecodeError {
    #[error("no transition job is published on {0}")]
    UnknownSubject(String),
    #[error("malformed job payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_captures() {
        assert!(STREAM_WORKSPACE.captures(SUBJECT_WORKSPACE_STOP));
        assert!(!STREAM_WORKSPACE.captures(SUBJECT_MISC_SITEMAP_GENERATE));
        assert!(STREAM_STATUS.captures("workspace.status.42"));
        assert!(!STREAM_STATUS.captures("workspace.status"));
        assert!(!STREAM_STATUS.captures("workspace.statusx.42"));
    }

    #[test]
    fn test_every_subject_has_one_stream() {
        let subjects = STREAM_WORKSPACE
            .subjects
            .iter()
            .chain(PERIODIC_SUBJECTS.iter());
        for subject in subjects {
            let owners = STREAMS.iter().filter(|s| s.captures(subject)).count();
            assert_eq!(owners, 1, "{}", subject);
        }
    }

    #[test]
    fn test_ack_waits() {
        assert_eq!(STREAM_WORKSPACE.ack_wait, Duration::from_secs(600));
        assert_eq!(STREAM_MISC.ack_wait, Duration::from_secs(30));
        assert_eq!(STREAM_STREAK.ack_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_decode_by_subject() {
        let job = TransitionJob::Stop(StopWorkspaceJob {
            workspace_id: 2,
            owner_id: 42,
            workspace_failed: false,
        });
        let payload = job.encode().unwrap();
        let decoded = TransitionJob::decode(job.subject(), &payload).unwrap();
        assert_eq!(decoded, job);

        assert!(matches!(
            TransitionJob::decode(SUBJECT_WORKSPACE_CREATE, &payload),
            Err(JobDecodeError::Malformed(_))
        ));
        assert!(matches!(
            TransitionJob::decode("workspace.resize", &payload),
            Err(JobDecodeError::UnknownSubject(_))
        ));
    }

    #[test]
    fn test_stop_job_failed_flag_defaults_off() {
        let job: StopWorkspaceJob =
            serde_json::from_str(r#"{"workspace_id":1,"owner_id":2}"#).unwrap();
        assert!(!job.workspace_failed);
    }

    #[test]
    fn test_names() {
        assert_eq!(status_subject(7), "workspace.status.7");
        assert_eq!(
            periodic_consumer_name(SUBJECT_MISC_SITEMAP_GENERATE),
            "wlcp-follower-misc-sitemap-generate"
        );
        assert_eq!(sentinel_payload(3, 1700000000), b"3-1700000000".to_vec());
    }
}
