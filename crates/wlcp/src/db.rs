// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database operations for wlcp.
//!
//! Every lifecycle predicate uses the database's `now()`. State writes that
//! race with other nodes are conditional on the current state and report
//! whether a row was touched; zero rows means another process already acted.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{
    AgentRecord, AgentState, AgentStats, AuthedAgent, InitFailure, InitState, NewAgentRecord,
    UserFlags, WorkspacePort, WorkspaceRecord, WorkspaceState,
};

const WORKSPACE_COLUMNS: &str = r#"
    id, code_source_id, code_source_type, challenge_type, repo_id, commit_sha, owner_id,
    container, cpu, memory, disk, state, init_state, init_failure, created_at, expiration,
    last_state_update, start_time, workspace_settings, ports, workspace_config_id,
    workspace_config_revision
"#;

const AGENT_COLUMNS: &str = r#"
    id, workspace_id, owner_id, version, state, secret, overlay_id, overlay_token, created_at,
    first_connect, last_connect, last_disconnect, last_connected_node
"#;

/// States a workspace may be in when moved to `target`.
///
/// Moving to a state the workspace is already in is legal so a re-published
/// job refreshes `last_state_update`. `Deleted` is a sink: nothing leaves it
/// and it is never re-entered, so its purge clock is never reset.
pub fn legal_predecessors(target: WorkspaceState) -> &'static [WorkspaceState] {
    use WorkspaceState::*;
    match target {
        Starting => &[Suspended, Starting],
        Active => &[Starting, Active],
        Stopping => &[Starting, Active, Stopping],
        Suspended => &[Stopping, Suspended],
        Removing => &[Stopping, Suspended, Failed, Removing],
        Failed => &[Starting, Active, Stopping, Suspended, Removing, Failed],
        Deleted => &[Removing],
    }
}

fn state_ids(states: &[WorkspaceState]) -> Vec<i32> {
    states.iter().map(|s| i32::from(*s)).collect()
}

// ============================================================================
// Workspaces
// ============================================================================

/// Get a workspace by id.
pub async fn get_workspace<'e, E>(executor: E, id: i64) -> Result<Option<WorkspaceRecord>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let query = format!("SELECT {} FROM workspaces WHERE id = $1", WORKSPACE_COLUMNS);
    sqlx::query_as::<_, WorkspaceRecord>(&query)
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// Extend expired Active workspaces whose agents moved at least 1 KiB in
/// the last 10 minutes by another 10 minutes.
pub async fn renew_workspaces_with_traffic<'e, E>(executor: E) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE workspaces
        SET expiration = NOW() + INTERVAL '10 minutes'
        WHERE expiration < NOW()
          AND state = $1
          AND id IN (
              SELECT workspace_id
              FROM workspace_agent_stats
              WHERE reported_at >= NOW() - INTERVAL '10 minutes'
              GROUP BY workspace_id
              HAVING SUM(rx_bytes + tx_bytes) >= 1024
          )
        "#,
    )
    .bind(i32::from(WorkspaceState::Active))
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Expired workspaces that should be stopped.
///
/// Starting and Active workspaces qualify as soon as they expire; Stopping
/// ones qualify again after 15 minutes without progress.
pub async fn select_stop_candidates<'e, E>(executor: E) -> Result<Vec<WorkspaceRecord>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let query = format!(
        r#"
        SELECT {}
        FROM workspaces
        WHERE expiration < NOW()
          AND (
              state IN ($1, $2)
              OR (state = $3 AND last_state_update < NOW() - INTERVAL '15 minutes')
          )
        ORDER BY id
        "#,
        WORKSPACE_COLUMNS
    );
    sqlx::query_as::<_, WorkspaceRecord>(&query)
        .bind(i32::from(WorkspaceState::Starting))
        .bind(i32::from(WorkspaceState::Active))
        .bind(i32::from(WorkspaceState::Stopping))
        .fetch_all(executor)
        .await
}

/// Workspaces expired for more than 24 hours that should be destroyed.
pub async fn select_destroy_candidates<'e, E>(
    executor: E,
) -> Result<Vec<WorkspaceRecord>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let query = format!(
        r#"
        SELECT {}
        FROM workspaces
        WHERE expiration < NOW() - INTERVAL '24 hours'
          AND (
              state IN ($1, $2, $3)
              OR (state = $4 AND last_state_update < NOW() - INTERVAL '15 minutes')
          )
        ORDER BY id
        "#,
        WORKSPACE_COLUMNS
    );
    sqlx::query_as::<_, WorkspaceRecord>(&query)
        .bind(i32::from(WorkspaceState::Stopping))
        .bind(i32::from(WorkspaceState::Suspended))
        .bind(i32::from(WorkspaceState::Failed))
        .bind(i32::from(WorkspaceState::Removing))
        .fetch_all(executor)
        .await
}

/// Move a batch of workspaces to `new_state` in one statement.
///
/// Only rows currently in a legal predecessor of `new_state` are updated.
pub async fn mark_transitioning<'e, E>(
    executor: E,
    ids: &[i64],
    new_state: WorkspaceState,
) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    if ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        r#"
        UPDATE workspaces
        SET state = $1, last_state_update = NOW()
        WHERE id = ANY($2) AND state = ANY($3)
        "#,
    )
    .bind(i32::from(new_state))
    .bind(ids)
    .bind(state_ids(legal_predecessors(new_state)))
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Record a bring-up failure and move the workspace to `state` if that is a
/// legal move. Returns false when the workspace has moved on.
pub async fn set_init_failure<'e, E>(
    executor: E,
    id: i64,
    step: InitState,
    failure: &InitFailure,
    state: WorkspaceState,
) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE workspaces
        SET init_state = $2, init_failure = $3, state = $4, last_state_update = NOW()
        WHERE id = $1 AND state = ANY($5)
        "#,
    )
    .bind(id)
    .bind(i32::from(step))
    .bind(Json(failure))
    .bind(i32::from(state))
    .bind(state_ids(legal_predecessors(state)))
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Move a workspace to Failed with `failure`, keeping its `init_state`.
/// Returns false when the workspace is in a state Failed cannot follow.
pub async fn record_failure<'e, E>(
    executor: E,
    id: i64,
    failure: &InitFailure,
) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE workspaces
        SET state = $2, init_failure = $3, last_state_update = NOW()
        WHERE id = $1 AND state = ANY($4)
        "#,
    )
    .bind(id)
    .bind(i32::from(WorkspaceState::Failed))
    .bind(Json(failure))
    .bind(state_ids(legal_predecessors(WorkspaceState::Failed)))
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Move a workspace to `new_state` if it is currently in one of `expected`.
pub async fn set_state_if<'e, E>(
    executor: E,
    id: i64,
    expected: &[WorkspaceState],
    new_state: WorkspaceState,
) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE workspaces
        SET state = $2, last_state_update = NOW()
        WHERE id = $1 AND state = ANY($3)
        "#,
    )
    .bind(id)
    .bind(i32::from(new_state))
    .bind(state_ids(expected))
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Move a Starting workspace to Active.
pub async fn activate_workspace_if_starting<'e, E>(executor: E, id: i64) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    set_state_if(
        executor,
        id,
        &[WorkspaceState::Starting],
        WorkspaceState::Active,
    )
    .await
}

/// Refresh `last_state_update`.
pub async fn touch_last_state_update<'e, E>(executor: E, id: i64) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query("UPDATE workspaces SET last_state_update = NOW() WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Record the milliseconds from creation to the first agent init. Only the
/// first call has an effect.
pub async fn record_start_time<'e, E>(executor: E, id: i64) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE workspaces
        SET start_time = (EXTRACT(EPOCH FROM (NOW() - created_at)) * 1000)::BIGINT
        WHERE id = $1 AND start_time IS NULL
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Replace the exposed-port set.
pub async fn update_workspace_ports<'e, E>(
    executor: E,
    id: i64,
    ports: &[WorkspacePort],
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query("UPDATE workspaces SET ports = $2 WHERE id = $1")
        .bind(id)
        .bind(Json(ports))
        .execute(executor)
        .await?;
    Ok(())
}

/// Ids of Deleted workspaces last touched more than 24 hours ago.
pub async fn select_deleted_for_purge<'e, E>(executor: E) -> Result<Vec<i64>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_scalar(
        r#"
        SELECT id FROM workspaces
        WHERE state = $1 AND last_state_update < NOW() - INTERVAL '24 hours'
        ORDER BY id
        "#,
    )
    .bind(i32::from(WorkspaceState::Deleted))
    .fetch_all(executor)
    .await
}

/// Delete a workspace with its agents and agent stats in one transaction.
pub async fn delete_workspace_cascade(pool: &PgPool, id: i64) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM workspace_agent_stats WHERE workspace_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM workspace_agent WHERE workspace_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM workspaces WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await
}

/// Referenced workspace config content.
pub async fn get_workspace_config<'e, E>(
    executor: E,
    id: i64,
    revision: i32,
) -> Result<Option<String>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_scalar("SELECT content FROM workspace_configs WHERE id = $1 AND revision = $2")
        .bind(id)
        .bind(revision)
        .fetch_optional(executor)
        .await
}

// ============================================================================
// Users
// ============================================================================

/// Flags of a user.
pub async fn get_user_flags<'e, E>(executor: E, user_id: i64) -> Result<Option<UserFlags>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, UserFlags>(
        r#"
        SELECT user_name, email, user_status, holiday_themes, is_ephemeral
        FROM users
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await
}

// ============================================================================
// Agents
// ============================================================================

/// Insert a new agent in state Starting.
pub async fn insert_agent(
    tx: &mut Transaction<'_, Postgres>,
    agent: &NewAgentRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO workspace_agent
            (id, workspace_id, owner_id, version, state, secret, overlay_id, overlay_token, created_at)
        VALUES ($1, $2, $3, '', $4, $5, $6, $7, NOW())
        "#,
    )
    .bind(agent.id)
    .bind(agent.workspace_id)
    .bind(agent.owner_id)
    .bind(i32::from(AgentState::Starting))
    .bind(agent.secret)
    .bind(&agent.overlay_id)
    .bind(&agent.overlay_token)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Rotate the secret of an agent of `workspace_id`.
pub async fn update_agent_secret<'e, E>(
    executor: E,
    workspace_id: i64,
    agent_id: i64,
    secret: Uuid,
) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result =
        sqlx::query("UPDATE workspace_agent SET secret = $3 WHERE id = $2 AND workspace_id = $1")
            .bind(workspace_id)
            .bind(agent_id)
            .bind(secret)
            .execute(executor)
            .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete one agent.
pub async fn delete_agent<'e, E>(executor: E, agent_id: i64) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM workspace_agent WHERE id = $1")
        .bind(agent_id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete every agent of a workspace.
pub async fn delete_agents_for_workspace<'e, E>(
    executor: E,
    workspace_id: i64,
) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM workspace_agent WHERE workspace_id = $1")
        .bind(workspace_id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Ids of every agent of a workspace, oldest first.
pub async fn list_agent_ids<'e, E>(executor: E, workspace_id: i64) -> Result<Vec<i64>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_scalar("SELECT id FROM workspace_agent WHERE workspace_id = $1 ORDER BY created_at, id")
        .bind(workspace_id)
        .fetch_all(executor)
        .await
}

/// Get an agent by id.
pub async fn get_agent<'e, E>(executor: E, agent_id: i64) -> Result<Option<AgentRecord>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let query = format!("SELECT {} FROM workspace_agent WHERE id = $1", AGENT_COLUMNS);
    sqlx::query_as::<_, AgentRecord>(&query)
        .bind(agent_id)
        .fetch_optional(executor)
        .await
}

/// Newest agent of `workspace_id` holding `secret`.
pub async fn find_agent_by_token<'e, E>(
    executor: E,
    workspace_id: i64,
    secret: Uuid,
) -> Result<Option<AuthedAgent>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let row: Option<(i64, i64, i64)> = sqlx::query_as(
        r#"
        SELECT a.id, w.id, w.owner_id
        FROM workspace_agent a
        JOIN workspaces w ON w.id = a.workspace_id
        WHERE a.workspace_id = $1 AND a.secret = $2
        ORDER BY a.created_at DESC, a.id DESC
        LIMIT 1
        "#,
    )
    .bind(workspace_id)
    .bind(secret)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|(agent_id, workspace_id, owner_id)| AuthedAgent {
        agent_id,
        workspace_id,
        owner_id,
    }))
}

/// Newest Running agent of an Active workspace owned by `owner_id`.
pub async fn find_running_agent<'e, E>(
    executor: E,
    workspace_id: i64,
    owner_id: i64,
) -> Result<Option<i64>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_scalar(
        r#"
        SELECT a.id
        FROM workspace_agent a
        JOIN workspaces w ON w.id = a.workspace_id
        WHERE w.id = $1 AND w.owner_id = $2 AND w.state = $3 AND a.state = $4
        ORDER BY a.created_at DESC, a.id DESC
        LIMIT 1
        "#,
    )
    .bind(workspace_id)
    .bind(owner_id)
    .bind(i32::from(WorkspaceState::Active))
    .bind(i32::from(AgentState::Running))
    .fetch_optional(executor)
    .await
}

/// Store the overlay enrollment material of an agent.
pub async fn set_agent_overlay_identity<'e, E>(
    executor: E,
    agent_id: i64,
    overlay_id: &str,
    overlay_token: &str,
) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result =
        sqlx::query("UPDATE workspace_agent SET overlay_id = $2, overlay_token = $3 WHERE id = $1")
            .bind(agent_id)
            .bind(overlay_id)
            .bind(overlay_token)
            .execute(executor)
            .await?;

    Ok(result.rows_affected() > 0)
}

/// Record the liveness state reported by an agent.
pub async fn update_agent_state<'e, E>(
    executor: E,
    agent_id: i64,
    state: AgentState,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query("UPDATE workspace_agent SET state = $2 WHERE id = $1")
        .bind(agent_id)
        .bind(i32::from(state))
        .execute(executor)
        .await?;
    Ok(())
}

/// Record the version reported by an agent.
pub async fn update_agent_version<'e, E>(
    executor: E,
    agent_id: i64,
    version: &str,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query("UPDATE workspace_agent SET version = $2 WHERE id = $1")
        .bind(agent_id)
        .bind(version)
        .execute(executor)
        .await?;
    Ok(())
}

/// Connection bookkeeping: `first_connect` is set once, `last_connect` and
/// `last_connected_node` on every call.
pub async fn mark_agent_connected<'e, E>(
    executor: E,
    agent_id: i64,
    node_id: i64,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        UPDATE workspace_agent
        SET first_connect = COALESCE(first_connect, $2),
            last_connect = $2,
            last_connected_node = $3
        WHERE id = $1
        "#,
    )
    .bind(agent_id)
    .bind(at)
    .bind(node_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Record the end of an agent connection.
pub async fn mark_agent_disconnected<'e, E>(
    executor: E,
    agent_id: i64,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query("UPDATE workspace_agent SET last_disconnect = $2 WHERE id = $1")
        .bind(agent_id)
        .bind(at)
        .execute(executor)
        .await?;
    Ok(())
}

/// Store one stats report.
pub async fn insert_agent_stats<'e, E>(
    executor: E,
    id: i64,
    agent: &AuthedAgent,
    stats: &AgentStats,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO workspace_agent_stats
            (id, agent_id, workspace_id, reported_at, conns_by_proto, num_conns,
             rx_packets, rx_bytes, tx_packets, tx_bytes)
        VALUES ($1, $2, $3, NOW(), $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(id)
    .bind(agent.agent_id)
    .bind(agent.workspace_id)
    .bind(Json(&stats.conns_by_proto))
    .bind(stats.num_conns)
    .bind(stats.rx_packets)
    .bind(stats.rx_bytes)
    .bind(stats.tx_packets)
    .bind(stats.tx_bytes)
    .execute(executor)
    .await?;
    Ok(())
}
