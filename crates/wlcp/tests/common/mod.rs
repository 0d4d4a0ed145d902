// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for wlcp integration tests.
//!
//! Provides a TestContext wired to a real PostgreSQL database and in-memory
//! doubles for every other collaborator, plus raw-SQL fixtures.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use wlcp::bus::{InMemoryBus, MessageBus};
use wlcp::db;
use wlcp::hooks::RecordingHooks;
use wlcp::jobs::STREAMS;
use wlcp::models::{AgentRecord, AgentState, ProjectKind, UserStatus, WorkspaceRecord, WorkspaceState};
use wlcp::overlay::StaticOverlay;
use wlcp::provisioner::MockProvisioner;
use wlcp::state::{Core, CoreSettings};
use wlcp::vcs::StaticVcs;

/// Skip test if database URL is not set
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_WLCP_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_WLCP_DATABASE_URL not set");
            return;
        }
    };
}

/// A workspace row to insert.
#[derive(Debug, Clone)]
pub struct WorkspaceFixture {
    pub state: WorkspaceState,
    pub kind: ProjectKind,
    /// Relative to now; negative means already expired
    pub expires_in: Duration,
    /// How long ago the state last changed
    pub last_update_ago: Duration,
    pub repo_id: i64,
}

impl Default for WorkspaceFixture {
    fn default() -> Self {
        Self {
            state: WorkspaceState::Starting,
            kind: ProjectKind::ChallengePost,
            expires_in: Duration::minutes(30),
            last_update_ago: Duration::zero(),
            repo_id: 0,
        }
    }
}

impl WorkspaceFixture {
    pub fn in_state(state: WorkspaceState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn expired(mut self, ago: Duration) -> Self {
        self.expires_in = -ago;
        self
    }

    pub fn stale(mut self, ago: Duration) -> Self {
        self.last_update_ago = ago;
        self
    }

    pub fn kind(mut self, kind: ProjectKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn repo(mut self, repo_id: i64) -> Self {
        self.repo_id = repo_id;
        self
    }
}

/// Test context: database plus in-memory collaborators.
pub struct TestContext {
    pub pool: PgPool,
    pub bus: Arc<InMemoryBus>,
    pub provisioner: Arc<MockProvisioner>,
    pub overlay: Arc<StaticOverlay>,
    pub hooks: Arc<RecordingHooks>,
    pub vcs: Arc<StaticVcs>,
    pub core: Arc<Core>,
    users: Mutex<Vec<i64>>,
    workspaces: Mutex<Vec<i64>>,
}

impl TestContext {
    /// Create a new test context.
    pub async fn new() -> Result<Self, String> {
        Self::with_settings(CoreSettings::default()).await
    }

    pub async fn with_settings(settings: CoreSettings) -> Result<Self, String> {
        let database_url = std::env::var("TEST_WLCP_DATABASE_URL")
            .map_err(|_| "TEST_WLCP_DATABASE_URL not set")?;

        let pool = PgPool::connect(&database_url)
            .await
            .map_err(|e| format!("Failed to connect to database: {}", e))?;

        wlcp::migrations::run(&pool)
            .await
            .map_err(|e| format!("Failed to run migrations: {}", e))?;

        let bus = Arc::new(InMemoryBus::new());
        for stream in STREAMS.iter() {
            bus.ensure_stream(stream)
                .await
                .map_err(|e| format!("Failed to create stream: {}", e))?;
        }

        let provisioner = Arc::new(MockProvisioner::new());
        let overlay = Arc::new(StaticOverlay::new());
        let hooks = Arc::new(RecordingHooks::new());
        let vcs = Arc::new(StaticVcs::new("http://git.wlcp.test"));

        // random node so concurrently running tests draw disjoint ids
        let node_id = (Uuid::new_v4().as_u128() % 1024) as i64;
        let core = Core::builder()
            .node_id(node_id)
            .pool(pool.clone())
            .bus(bus.clone())
            .provisioner(provisioner.clone())
            .overlay(overlay.clone())
            .vcs(vcs.clone())
            .hooks(hooks.clone())
            .periodic(hooks.clone())
            .settings(settings)
            .build()
            .map_err(|e| format!("Failed to build core: {}", e))?;

        Ok(Self {
            pool,
            bus,
            provisioner,
            overlay,
            hooks,
            vcs,
            core: Arc::new(core),
            users: Mutex::new(Vec::new()),
            workspaces: Mutex::new(Vec::new()),
        })
    }

    pub fn next_id(&self) -> i64 {
        self.core.ids.generate()
    }

    pub async fn insert_user(&self, status: UserStatus, ephemeral: bool) -> i64 {
        let id = self.next_id();
        sqlx::query(
            "INSERT INTO users (id, user_name, email, user_status, is_ephemeral) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(format!("user{}", id))
        .bind(format!("user{}@wlcp.test", id))
        .bind(i32::from(status))
        .bind(ephemeral)
        .execute(&self.pool)
        .await
        .expect("Failed to insert user");
        self.users.lock().unwrap().push(id);
        id
    }

    pub async fn insert_workspace(&self, owner_id: i64, fixture: WorkspaceFixture) -> i64 {
        let id = self.next_id();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO workspaces
                (id, code_source_id, code_source_type, repo_id, commit_sha, owner_id, state,
                 created_at, expiration, last_state_update)
            VALUES ($1, $2, $3, $4, 'main', $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(id + 1)
        .bind(i32::from(fixture.kind))
        .bind(fixture.repo_id)
        .bind(owner_id)
        .bind(i32::from(fixture.state))
        .bind(now - fixture.last_update_ago - Duration::minutes(1))
        .bind(now + fixture.expires_in)
        .bind(now - fixture.last_update_ago)
        .execute(&self.pool)
        .await
        .expect("Failed to insert workspace");
        self.workspaces.lock().unwrap().push(id);
        id
    }

    /// Insert an agent and register it with the mock provisioner.
    pub async fn insert_agent(&self, workspace_id: i64, owner_id: i64, state: AgentState) -> (i64, Uuid) {
        let id = self.next_id();
        let secret = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO workspace_agent (id, workspace_id, owner_id, state, secret)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(workspace_id)
        .bind(owner_id)
        .bind(i32::from(state))
        .bind(secret)
        .execute(&self.pool)
        .await
        .expect("Failed to insert agent");
        self.provisioner.adopt(workspace_id, id);
        (id, secret)
    }

    /// Record traffic for a workspace `ago` in the past.
    pub async fn insert_traffic(&self, workspace_id: i64, agent_id: i64, bytes: i64, ago: Duration) {
        sqlx::query(
            r#"
            INSERT INTO workspace_agent_stats (id, agent_id, workspace_id, reported_at, rx_bytes, tx_bytes)
            VALUES ($1, $2, $3, $4, $5, 0)
            "#,
        )
        .bind(self.next_id())
        .bind(agent_id)
        .bind(workspace_id)
        .bind(Utc::now() - ago)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .expect("Failed to insert agent stats");
    }

    pub async fn set_ports(&self, workspace_id: i64, ports: serde_json::Value) {
        sqlx::query("UPDATE workspaces SET ports = $2 WHERE id = $1")
            .bind(workspace_id)
            .bind(ports)
            .execute(&self.pool)
            .await
            .expect("Failed to set ports");
    }

    pub async fn workspace(&self, id: i64) -> WorkspaceRecord {
        db::get_workspace(&self.pool, id)
            .await
            .expect("Failed to load workspace")
            .expect("Workspace missing")
    }

    pub async fn state_of(&self, id: i64) -> WorkspaceState {
        self.workspace(id).await.state
    }

    pub async fn agent(&self, id: i64) -> Option<AgentRecord> {
        db::get_agent(&self.pool, id).await.expect("Failed to load agent")
    }

    pub async fn agent_ids(&self, workspace_id: i64) -> Vec<i64> {
        db::list_agent_ids(&self.pool, workspace_id)
            .await
            .expect("Failed to list agents")
    }

    pub async fn stats_count(&self, workspace_id: i64) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM workspace_agent_stats WHERE workspace_id = $1")
            .bind(workspace_id)
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count stats")
    }

    /// A core sharing this context's doubles whose database pool is
    /// already closed, so every query fails.
    pub async fn core_with_closed_pool(&self) -> Core {
        let database_url =
            std::env::var("TEST_WLCP_DATABASE_URL").expect("TEST_WLCP_DATABASE_URL not set");
        let pool = PgPool::connect(&database_url)
            .await
            .expect("Failed to connect to database");
        pool.close().await;

        Core::builder()
            .node_id(self.core.node_id)
            .pool(pool)
            .bus(self.bus.clone())
            .provisioner(self.provisioner.clone())
            .overlay(self.overlay.clone())
            .vcs(self.vcs.clone())
            .hooks(self.hooks.clone())
            .periodic(self.hooks.clone())
            .build()
            .expect("Failed to build core")
    }

    /// Delete every row this context created.
    pub async fn cleanup(&self) {
        let workspaces = self.workspaces.lock().unwrap().clone();
        let users = self.users.lock().unwrap().clone();

        let _ = sqlx::query("DELETE FROM workspace_agent_stats WHERE workspace_id = ANY($1)")
            .bind(&workspaces[..])
            .execute(&self.pool)
            .await;
        let _ = sqlx::query("DELETE FROM workspace_agent WHERE workspace_id = ANY($1)")
            .bind(&workspaces[..])
            .execute(&self.pool)
            .await;
        let _ = sqlx::query("DELETE FROM workspaces WHERE id = ANY($1)")
            .bind(&workspaces[..])
            .execute(&self.pool)
            .await;
        let _ = sqlx::query("DELETE FROM users WHERE id = ANY($1)")
            .bind(&users[..])
            .execute(&self.pool)
            .await;
    }
}
