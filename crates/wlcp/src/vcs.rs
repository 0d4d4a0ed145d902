// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Version control seam: clone URLs, per-workspace tokens and the workspace
//! config stored in a repository.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum VcsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("vcs error: {0}")]
    Other(String),
}

#[async_trait]
pub trait VcsProvider: Send + Sync {
    async fn clone_url(&self, repo_id: i64) -> Result<String, VcsError>;

    /// Raw workspace config YAML at `commit`.
    async fn workspace_config(
        &self,
        owner_id: i64,
        repo_id: i64,
        commit: &str,
    ) -> Result<String, VcsError>;

    /// Token the agent uses for git operations inside the workspace.
    async fn issue_workspace_token(&self, owner_id: i64, workspace_id: i64)
    -> Result<String, VcsError>;

    async fn revoke_workspace_token(&self, owner_id: i64, workspace_id: i64)
    -> Result<(), VcsError>;
}

/// In-memory provider: configs are registered per repository, tokens are
/// random and tracked so revocation can be observed.
#[derive(Debug, Clone)]
pub struct StaticVcs {
    base_url: String,
    configs: Arc<Mutex<HashMap<i64, String>>>,
    tokens: Arc<Mutex<HashMap<i64, String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StaticVcs {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            configs: Arc::default(),
            tokens: Arc::default(),
        }
    }

    pub fn set_config(&self, repo_id: i64, yaml: impl Into<String>) {
        lock(&self.configs).insert(repo_id, yaml.into());
    }

    /// Live token of a workspace, if any.
    pub fn token(&self, workspace_id: i64) -> Option<String> {
        lock(&self.tokens).get(&workspace_id).cloned()
    }
}

#[async_trait]
impl VcsProvider for StaticVcs {
    async fn clone_url(&self, repo_id: i64) -> Result<String, VcsError> {
        Ok(format!("{}/repos/{}.git", self.base_url, repo_id))
    }

    async fn workspace_config(
        &self,
        _owner_id: i64,
        repo_id: i64,
        commit: &str,
    ) -> Result<String, VcsError> {
        lock(&self.configs)
            .get(&repo_id)
            .cloned()
            .ok_or_else(|| VcsError::NotFound(format!("workspace config of repo {} at {}", repo_id, commit)))
    }

    async fn issue_workspace_token(
        &self,
        _owner_id: i64,
        workspace_id: i64,
    ) -> Result<String, VcsError> {
        let token = Uuid::new_v4().simple().to_string();
        lock(&self.tokens).insert(workspace_id, token.clone());
        Ok(token)
    }

    async fn revoke_workspace_token(
        &self,
        _owner_id: i64,
        workspace_id: i64,
    ) -> Result<(), VcsError> {
        lock(&self.tokens).remove(&workspace_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_vcs() {
        let vcs = StaticVcs::new("https://git.wlcp.dev/");
        assert_eq!(
            vcs.clone_url(12).await.unwrap(),
            "https://git.wlcp.dev/repos/12.git"
        );
        assert!(matches!(
            vcs.workspace_config(1, 12, "abc").await,
            Err(VcsError::NotFound(_))
        ));
        vcs.set_config(12, "version: 0.1");
        assert_eq!(vcs.workspace_config(1, 12, "abc").await.unwrap(), "version: 0.1");

        let token = vcs.issue_workspace_token(1, 99).await.unwrap();
        assert_eq!(vcs.token(99), Some(token));
        vcs.revoke_workspace_token(1, 99).await.unwrap();
        assert!(vcs.token(99).is_none());
    }
}
