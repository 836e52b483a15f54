//! Database query functions for the `agents` table.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Agent, AgentStatus};

/// Parameters for registering an agent pod.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub hostname: String,
    pub pod_ip: String,
    pub pod_port: i32,
    pub config_name: String,
    pub metadata: serde_json::Value,
}

/// Register an agent pod, idempotently on its address.
///
/// A pod that re-registers the same `(hostname, pod_ip, pod_port)` tuple
/// reuses the existing row: status resets to `booting`, the job link is
/// cleared, and `registered_at` refreshes.
pub async fn upsert_agent(pool: &PgPool, new: &NewAgent) -> StoreResult<Agent> {
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (hostname, pod_ip, pod_port, config_name, metadata) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (hostname, pod_ip, pod_port) DO UPDATE \
         SET config_name = EXCLUDED.config_name, \
             metadata = EXCLUDED.metadata, \
             status = 'booting', \
             current_job_id = NULL, \
             registered_at = NOW(), \
             last_heartbeat = NOW() \
         RETURNING *",
    )
    .bind(&new.hostname)
    .bind(&new.pod_ip)
    .bind(new.pod_port)
    .bind(&new.config_name)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await?;
    Ok(agent)
}

/// Fetch a single agent by ID.
pub async fn get_agent(pool: &PgPool, id: Uuid) -> StoreResult<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(agent)
}

/// List agents, optionally filtered by status and config name.
pub async fn list_agents(
    pool: &PgPool,
    status: Option<AgentStatus>,
    config_name: Option<&str>,
) -> StoreResult<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR config_name = $2) \
         ORDER BY registered_at ASC",
    )
    .bind(status)
    .bind(config_name)
    .fetch_all(pool)
    .await?;
    Ok(agents)
}

/// Advance an agent's heartbeat to the server clock.
///
/// `GREATEST` keeps the timestamp monotonic when two heartbeats race.
/// Offline agents are excluded so a stale pod is forced to re-register;
/// zero rows means absent or offline.
pub async fn touch_heartbeat(pool: &PgPool, id: Uuid) -> StoreResult<u64> {
    let rows = sqlx::query(
        "UPDATE agents \
         SET last_heartbeat = GREATEST(last_heartbeat, NOW()) \
         WHERE id = $1 AND status != 'offline'",
    )
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Atomically transition an agent between statuses. Returns rows affected;
/// zero means the optimistic lock failed or the agent is absent.
pub async fn transition_agent_status(
    pool: &PgPool,
    id: Uuid,
    from: AgentStatus,
    to: AgentStatus,
) -> StoreResult<u64> {
    let rows = sqlx::query("UPDATE agents SET status = $1 WHERE id = $2 AND status = $3")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows)
}

/// Transition `ready -> working` and link the job, in one statement.
/// Rejects (zero rows) when the agent is not `ready` or already holds a job.
pub async fn set_working(pool: &PgPool, id: Uuid, job_id: Uuid) -> StoreResult<u64> {
    let rows = sqlx::query(
        "UPDATE agents SET status = 'working', current_job_id = $2 \
         WHERE id = $1 AND status = 'ready' AND current_job_id IS NULL",
    )
    .bind(id)
    .bind(job_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Transition `working -> completed|failed` and clear the job link.
pub async fn set_finished(pool: &PgPool, id: Uuid, outcome: AgentStatus) -> StoreResult<u64> {
    let rows = sqlx::query(
        "UPDATE agents SET status = $2, current_job_id = NULL \
         WHERE id = $1 AND status = 'working'",
    )
    .bind(id)
    .bind(outcome)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Mark an agent `failed` after its start command could not be delivered,
/// recording the reason in its metadata and clearing the job link.
pub async fn mark_start_failed(pool: &PgPool, id: Uuid) -> StoreResult<u64> {
    let rows = sqlx::query(
        "UPDATE agents \
         SET status = 'failed', \
             current_job_id = NULL, \
             metadata = metadata || '{\"last_error\": \"start_command_failed\"}'::jsonb \
         WHERE id = $1 AND status = 'working'",
    )
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Mark every agent whose heartbeat is older than the liveness threshold
/// as `offline`, returning the expired rows (with their old job links, so
/// the detector can orphan the affected jobs). Booting pods are exempt
/// (no heartbeat loop yet), and `completed` has no edge to `offline`.
pub async fn expire_agents(pool: &PgPool, liveness_secs: f64) -> StoreResult<Vec<Agent>> {
    // The CTE captures the pre-update job link; RETURNING alone would only
    // see the cleared value. SKIP LOCKED keeps concurrent detector passes
    // (and the dispatcher) from stacking up on the same rows.
    let agents = sqlx::query_as::<_, Agent>(
        "WITH expired AS ( \
             SELECT id, current_job_id FROM agents \
             WHERE status IN ('ready', 'working', 'failed') \
               AND last_heartbeat < NOW() - make_interval(secs => $1) \
             FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE agents \
         SET status = 'offline', current_job_id = NULL \
         FROM expired \
         WHERE agents.id = expired.id \
         RETURNING agents.id, agents.hostname, agents.pod_ip, agents.pod_port, \
                   agents.config_name, agents.status, expired.current_job_id, \
                   agents.metadata, agents.registered_at, agents.last_heartbeat",
    )
    .bind(liveness_secs)
    .fetch_all(pool)
    .await?;
    Ok(agents)
}

/// Hard-delete an agent. Only permitted from a settled status; a live job
/// referencing the agent blocks deletion via its foreign key.
pub async fn delete_agent(pool: &PgPool, id: Uuid) -> StoreResult<u64> {
    let rows = sqlx::query(
        "DELETE FROM agents \
         WHERE id = $1 AND status IN ('offline', 'failed', 'completed')",
    )
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}
