// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row types and enums of the system of record.
//!
//! Enums are stored as `INTEGER` columns; [`TryFrom<i32>`] rejects unknown
//! discriminants so a corrupted row fails loudly instead of being coerced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

/// A stored integer did not map to any variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} discriminant {value}")]
pub struct UnknownDiscriminant {
    pub kind: &'static str,
    pub value: i32,
}

macro_rules! int_enum {
    ($name:ident, $kind:literal { $($variant:ident = $value:literal => $label:literal),+ $(,)? }) => {
        impl $name {
            /// Lower-case label used in logs and status payloads.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl TryFrom<i32> for $name {
            type Error = UnknownDiscriminant;

            fn try_from(value: i32) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    _ => Err(UnknownDiscriminant { kind: $kind, value }),
                }
            }
        }

        impl From<$name> for i32 {
            fn from(value: $name) -> i32 {
                value as i32
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Lifecycle state of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum WorkspaceState {
    Starting = 0,
    Active = 1,
    Stopping = 2,
    Suspended = 3,
    Removing = 4,
    Failed = 5,
    Deleted = 6,
}

int_enum!(WorkspaceState, "workspace state" {
    Starting = 0 => "starting",
    Active = 1 => "active",
    Stopping = 2 => "stopping",
    Suspended = 3 => "suspended",
    Removing = 4 => "removing",
    Failed = 5 => "failed",
    Deleted = 6 => "deleted",
});

/// Bring-up step of a workspace. Ordered; advances until `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum InitState {
    Provisioning = 0,
    Initializing = 1,
    Updating = 2,
    ReadWorkspaceConfig = 3,
    WriteWorkspaceConfig = 4,
    WriteGitConfig = 5,
    CloneRepo = 6,
    InstallVSCode = 7,
    InstallExtensions = 8,
    ComposeServices = 9,
    LaunchVSCode = 10,
    Completed = 11,
}

int_enum!(InitState, "init state" {
    Provisioning = 0 => "provisioning",
    Initializing = 1 => "initializing",
    Updating = 2 => "updating",
    ReadWorkspaceConfig = 3 => "read_workspace_config",
    WriteWorkspaceConfig = 4 => "write_workspace_config",
    WriteGitConfig = 5 => "write_git_config",
    CloneRepo = 6 => "clone_repo",
    InstallVSCode = 7 => "install_vscode",
    InstallExtensions = 8 => "install_extensions",
    ComposeServices = 9 => "compose_services",
    LaunchVSCode = 10 => "launch_vscode",
    Completed = 11 => "completed",
});

impl InitState {
    /// The step after this one; `Completed` is terminal.
    pub fn next(self) -> Self {
        Self::try_from(self as i32 + 1).unwrap_or(Self::Completed)
    }
}

/// What kind of project a workspace was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum ProjectKind {
    ChallengePost = 0,
    AttemptPost = 1,
    Bytes = 2,
}

int_enum!(ProjectKind, "project kind" {
    ChallengePost = 0 => "challenge_post",
    AttemptPost = 1 => "attempt_post",
    Bytes = 2 => "bytes",
});

/// Liveness reported by an in-workspace agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum AgentState {
    Starting = 0,
    Running = 1,
    Invalid = 2,
}

int_enum!(AgentState, "agent state" {
    Starting = 0 => "starting",
    Running = 1 => "running",
    Invalid = 2 => "invalid",
});

/// Account tier of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum UserStatus {
    Basic = 0,
    Premium = 1,
}

int_enum!(UserStatus, "user status" {
    Basic = 0 => "basic",
    Premium = 1 => "premium",
});

/// Record of the step at which a workspace failed to come up.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InitFailure {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl InitFailure {
    /// Failure recorded when the provisioner has no backing for the workspace.
    pub fn workspace_not_found() -> Self {
        Self {
            stderr: "workspace not found".to_string(),
            ..Default::default()
        }
    }
}

/// A port exposed by a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspacePort {
    pub name: String,
    pub port: u16,
    pub active: bool,
    pub http: bool,
    pub ssl: bool,
    #[serde(default)]
    pub configured: bool,
}

/// A row of `workspaces`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkspaceRecord {
    pub id: i64,
    pub code_source_id: i64,
    #[sqlx(try_from = "i32")]
    pub code_source_type: ProjectKind,
    pub challenge_type: i32,
    pub repo_id: i64,
    pub commit_sha: String,
    pub owner_id: i64,
    pub container: String,
    pub cpu: i32,
    pub memory: i32,
    pub disk: i32,
    #[sqlx(try_from = "i32")]
    pub state: WorkspaceState,
    #[sqlx(try_from = "i32")]
    pub init_state: InitState,
    pub init_failure: Option<Json<InitFailure>>,
    pub created_at: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    pub last_state_update: DateTime<Utc>,
    pub start_time: Option<i64>,
    pub workspace_settings: serde_json::Value,
    pub ports: Json<Vec<WorkspacePort>>,
    pub workspace_config_id: Option<i64>,
    pub workspace_config_revision: Option<i32>,
}

/// A row of `workspace_agent`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentRecord {
    pub id: i64,
    pub workspace_id: i64,
    pub owner_id: i64,
    pub version: String,
    #[sqlx(try_from = "i32")]
    pub state: AgentState,
    pub secret: Uuid,
    pub overlay_id: String,
    pub overlay_token: String,
    pub created_at: DateTime<Utc>,
    pub first_connect: Option<DateTime<Utc>>,
    pub last_connect: Option<DateTime<Utc>>,
    pub last_disconnect: Option<DateTime<Utc>>,
    pub last_connected_node: Option<i64>,
}

/// Values for a new `workspace_agent` row.
#[derive(Debug, Clone)]
pub struct NewAgentRecord {
    pub id: i64,
    pub workspace_id: i64,
    pub owner_id: i64,
    pub secret: Uuid,
    pub overlay_id: String,
    pub overlay_token: String,
}

/// The user flags the control plane reads.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserFlags {
    pub user_name: String,
    pub email: String,
    #[sqlx(try_from = "i32")]
    pub user_status: UserStatus,
    pub holiday_themes: bool,
    pub is_ephemeral: bool,
}

/// Network counters reported by an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    #[serde(default)]
    pub conns_by_proto: std::collections::BTreeMap<String, i64>,
    #[serde(default)]
    pub num_conns: i64,
    #[serde(default)]
    pub rx_packets: i64,
    #[serde(default)]
    pub rx_bytes: i64,
    #[serde(default)]
    pub tx_packets: i64,
    #[serde(default)]
    pub tx_bytes: i64,
}

impl AgentStats {
    /// No traffic in either direction.
    pub fn is_idle(&self) -> bool {
        self.rx_packets == 0 && self.rx_bytes == 0 && self.tx_packets == 0 && self.tx_bytes == 0
    }
}

/// An agent authenticated on the internal API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthedAgent {
    pub agent_id: i64,
    pub workspace_id: i64,
    pub owner_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_state_values() {
        assert_eq!(WorkspaceState::Starting as i32, 0);
        assert_eq!(WorkspaceState::Active as i32, 1);
        assert_eq!(WorkspaceState::Stopping as i32, 2);
        assert_eq!(WorkspaceState::Suspended as i32, 3);
        assert_eq!(WorkspaceState::Removing as i32, 4);
        assert_eq!(WorkspaceState::Failed as i32, 5);
        assert_eq!(WorkspaceState::Deleted as i32, 6);
    }

    #[test]
    fn test_unknown_discriminant() {
        let err = WorkspaceState::try_from(9).unwrap_err();
        assert_eq!(err.value, 9);
        assert_eq!(err.to_string(), "unknown workspace state discriminant 9");
    }

    #[test]
    fn test_init_state_advances_and_saturates() {
        assert_eq!(InitState::Provisioning.next(), InitState::Initializing);
        assert_eq!(InitState::LaunchVSCode.next(), InitState::Completed);
        assert_eq!(InitState::Completed.next(), InitState::Completed);
        assert!(InitState::Provisioning < InitState::Completed);
    }

    #[test]
    fn test_agent_state_json_labels() {
        let state: AgentState = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(state, AgentState::Running);
        assert!(serde_json::from_str::<AgentState>("\"sleeping\"").is_err());
    }

    #[test]
    fn test_workspace_state_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&WorkspaceState::Suspended).unwrap(), "3");
    }

    #[test]
    fn test_idle_stats() {
        let mut stats = AgentStats {
            num_conns: 4,
            ..Default::default()
        };
        assert!(stats.is_idle());
        stats.tx_bytes = 1;
        assert!(!stats.is_idle());
    }
}
