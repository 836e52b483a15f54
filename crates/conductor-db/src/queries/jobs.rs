//! Database query functions for the `jobs` table.
//!
//! Status transitions use optimistic locking: every UPDATE includes the
//! expected current status in its WHERE clause and reports rows affected.
//! Zero rows means the caller lost the race (or the job is gone); the
//! state machine in `conductor-core` disambiguates.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Job, JobStatus, RoleStatus};
use crate::queries::audit;

/// Parameters for inserting a new job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub description: String,
    pub upload_id: Option<Uuid>,
    pub context: Option<String>,
    pub instructions: Option<String>,
    pub config_name: String,
}

/// Insert a new job in `created` status. Returns the inserted row with
/// server-generated defaults, and records the creation in the audit log.
pub async fn insert_job(pool: &PgPool, new: &NewJob) -> StoreResult<Job> {
    let mut tx = pool.begin().await?;

    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (description, upload_id, context, instructions, config_name) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(&new.description)
    .bind(new.upload_id)
    .bind(&new.context)
    .bind(&new.instructions)
    .bind(&new.config_name)
    .fetch_one(&mut *tx)
    .await?;

    audit::append_entry(
        &mut *tx,
        job.id,
        "user",
        "job_created",
        serde_json::json!({ "config_name": job.config_name }),
    )
    .await?;

    tx.commit().await?;
    Ok(job)
}

/// Fetch a single job by ID.
pub async fn get_job(pool: &PgPool, id: Uuid) -> StoreResult<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(job)
}

/// List jobs, newest first, optionally filtered by status.
pub async fn list_jobs(
    pool: &PgPool,
    status: Option<JobStatus>,
    limit: i64,
) -> StoreResult<Vec<Job>> {
    let jobs = match status {
        Some(status) => {
            sqlx::query_as::<_, Job>(
                "SELECT * FROM jobs WHERE status = $1 \
                 ORDER BY created_at DESC LIMIT $2",
            )
            .bind(status)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC LIMIT $1")
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(jobs)
}

/// Atomically transition a job between statuses.
///
/// When `to` is terminal the row also gets `completed_at = NOW()` and its
/// agent assignment (and orphan stamp) cleared, which keeps the invariants
/// between status, `assigned_agent_id`, and `completed_at` intact inside a
/// single statement. Returns the number of rows affected.
pub async fn transition_job_status(
    pool: &PgPool,
    job_id: Uuid,
    from: JobStatus,
    to: JobStatus,
    actor: &str,
) -> StoreResult<u64> {
    let terminal = to.is_terminal();
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        "UPDATE jobs \
         SET status = $1, \
             completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END, \
             assigned_agent_id = CASE WHEN $4 THEN NULL ELSE assigned_agent_id END, \
             orphaned_at = CASE WHEN $4 THEN NULL ELSE orphaned_at END \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(job_id)
    .bind(from)
    .bind(terminal)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if rows > 0 {
        audit::append_entry(
            &mut *tx,
            job_id,
            actor,
            "status_changed",
            serde_json::json!({ "from": from, "to": to }),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(rows)
}

/// Store a freeze checkpoint payload and move `processing -> pending_review`.
/// The agent assignment is kept; the agent waits for the review verdict.
pub async fn freeze_job(
    pool: &PgPool,
    job_id: Uuid,
    frozen: &serde_json::Value,
) -> StoreResult<u64> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        "UPDATE jobs SET status = 'pending_review', frozen_job_data = $2 \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(job_id)
    .bind(frozen)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if rows > 0 {
        audit::append_entry(&mut *tx, job_id, "agent", "job_frozen", frozen.clone()).await?;
    }

    tx.commit().await?;
    Ok(rows)
}

/// Record a successful finish reported by the assigned agent:
/// `processing -> completed`, usage counters folded in, assignment cleared.
pub async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    total_tokens: i64,
    request_count: i32,
) -> StoreResult<u64> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        "UPDATE jobs \
         SET status = 'completed', \
             creator_status = 'completed', \
             validator_status = 'completed', \
             total_tokens = total_tokens + $2, \
             request_count = request_count + $3, \
             assigned_agent_id = NULL, \
             orphaned_at = NULL, \
             completed_at = NOW() \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(job_id)
    .bind(total_tokens)
    .bind(request_count)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if rows > 0 {
        audit::append_entry(
            &mut *tx,
            job_id,
            "agent",
            "job_completed",
            serde_json::json!({ "total_tokens": total_tokens }),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(rows)
}

/// Record a failure: `processing -> failed` with diagnostics.
pub async fn fail_job(
    pool: &PgPool,
    job_id: Uuid,
    error_message: &str,
    error_details: Option<&serde_json::Value>,
) -> StoreResult<u64> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        "UPDATE jobs \
         SET status = 'failed', \
             error_message = $2, \
             error_details = COALESCE($3, error_details), \
             assigned_agent_id = NULL, \
             orphaned_at = NULL, \
             completed_at = NOW() \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(job_id)
    .bind(error_message)
    .bind(error_details.cloned())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if rows > 0 {
        audit::append_entry(
            &mut *tx,
            job_id,
            "agent",
            "job_failed",
            serde_json::json!({ "error_message": error_message }),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(rows)
}

/// Detach a `processing` job from an agent that stopped heartbeating:
/// back to `created` with an orphan stamp, so the dispatcher may re-place
/// it while the recovery grace window runs.
pub async fn orphan_job(pool: &PgPool, job_id: Uuid, agent_id: Uuid) -> StoreResult<u64> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        "UPDATE jobs \
         SET status = 'created', assigned_agent_id = NULL, orphaned_at = NOW() \
         WHERE id = $1 AND status = 'processing' AND assigned_agent_id = $2",
    )
    .bind(job_id)
    .bind(agent_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if rows > 0 {
        audit::append_entry(
            &mut *tx,
            job_id,
            "detector",
            "job_orphaned",
            serde_json::json!({ "agent_id": agent_id }),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(rows)
}

/// Detach a job from its agent and return it to `created` so the
/// dispatcher can re-place it. Used when the assigned agent cannot take a
/// resume command. `from` must be `processing` or `pending_review`.
pub async fn detach_job(pool: &PgPool, job_id: Uuid, from: JobStatus) -> StoreResult<u64> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        "UPDATE jobs \
         SET status = 'created', assigned_agent_id = NULL, orphaned_at = NULL \
         WHERE id = $1 AND status = $2",
    )
    .bind(job_id)
    .bind(from)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if rows > 0 {
        audit::append_entry(
            &mut *tx,
            job_id,
            "orchestrator",
            "job_detached",
            serde_json::json!({ "from": from }),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(rows)
}

/// Roll back a dispatch whose start command never got through: the job
/// returns to `created` and its attempt counter advances. Returns the
/// updated row so the caller can decide whether to give up on the job.
pub async fn release_failed_dispatch(
    pool: &PgPool,
    job_id: Uuid,
    agent_id: Uuid,
) -> StoreResult<Option<Job>> {
    let mut tx = pool.begin().await?;

    let job = sqlx::query_as::<_, Job>(
        "UPDATE jobs \
         SET status = 'created', \
             assigned_agent_id = NULL, \
             dispatch_attempts = dispatch_attempts + 1, \
             error_details = COALESCE(error_details, '{}'::jsonb) \
                 || jsonb_build_object('dispatch_attempts', dispatch_attempts + 1) \
         WHERE id = $1 AND status = 'processing' AND assigned_agent_id = $2 \
         RETURNING *",
    )
    .bind(job_id)
    .bind(agent_id)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(ref job) = job {
        audit::append_entry(
            &mut *tx,
            job.id,
            "dispatcher",
            "dispatch_rolled_back",
            serde_json::json!({ "agent_id": agent_id, "attempt": job.dispatch_attempts }),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(job)
}

/// Give up on a job that cannot be placed: `created -> failed` with the
/// given reason under `error_details.reason`.
pub async fn fail_unplaceable_job(pool: &PgPool, job_id: Uuid, reason: &str) -> StoreResult<u64> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        "UPDATE jobs \
         SET status = 'failed', \
             error_message = $2, \
             error_details = COALESCE(error_details, '{}'::jsonb) \
                 || jsonb_build_object('reason', $2::text), \
             orphaned_at = NULL, \
             completed_at = NOW() \
         WHERE id = $1 AND status = 'created'",
    )
    .bind(job_id)
    .bind(reason)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if rows > 0 {
        audit::append_entry(
            &mut *tx,
            job_id,
            "dispatcher",
            "job_failed",
            serde_json::json!({ "reason": reason }),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(rows)
}

/// Fail every orphaned job whose recovery grace window has elapsed without
/// a re-dispatch. Returns the failed rows. Idempotent: a job is matched at
/// most once because the first pass moves it to a terminal state.
pub async fn fail_grace_expired_jobs(pool: &PgPool, grace_secs: f64) -> StoreResult<Vec<Job>> {
    let mut tx = pool.begin().await?;

    let jobs = sqlx::query_as::<_, Job>(
        "UPDATE jobs \
         SET status = 'failed', \
             error_message = 'assigned agent went offline', \
             error_details = COALESCE(error_details, '{}'::jsonb) \
                 || jsonb_build_object('reason', 'agent_offline'), \
             orphaned_at = NULL, \
             completed_at = NOW() \
         WHERE status = 'created' \
           AND orphaned_at IS NOT NULL \
           AND orphaned_at < NOW() - make_interval(secs => $1) \
         RETURNING *",
    )
    .bind(grace_secs)
    .fetch_all(&mut *tx)
    .await?;

    for job in &jobs {
        audit::append_entry(
            &mut *tx,
            job.id,
            "detector",
            "job_failed",
            serde_json::json!({ "reason": "agent_offline" }),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(jobs)
}

/// Fail every `processing` job whose `updated_at` has not advanced within
/// the escalation threshold. Returns the failed rows.
pub async fn fail_stalled_jobs(pool: &PgPool, stall_secs: f64) -> StoreResult<Vec<Job>> {
    let mut tx = pool.begin().await?;

    let jobs = sqlx::query_as::<_, Job>(
        "UPDATE jobs \
         SET status = 'failed', \
             error_message = 'no observable progress', \
             error_details = COALESCE(error_details, '{}'::jsonb) \
                 || jsonb_build_object('reason', 'no_progress'), \
             assigned_agent_id = NULL, \
             orphaned_at = NULL, \
             completed_at = NOW() \
         WHERE status = 'processing' \
           AND updated_at < NOW() - make_interval(secs => $1) \
         RETURNING *",
    )
    .bind(stall_secs)
    .fetch_all(&mut *tx)
    .await?;

    for job in &jobs {
        audit::append_entry(
            &mut *tx,
            job.id,
            "detector",
            "job_failed",
            serde_json::json!({ "reason": "no_progress" }),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(jobs)
}

/// Jobs whose observable progress has stalled past the progress threshold.
/// Covers both unplaced (`created`) and executing (`processing`) jobs;
/// neither is failed by this query.
pub async fn stuck_job_report(pool: &PgPool, progress_secs: f64) -> StoreResult<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs \
         WHERE status IN ('created', 'processing') \
           AND updated_at < NOW() - make_interval(secs => $1) \
         ORDER BY updated_at ASC",
    )
    .bind(progress_secs)
    .fetch_all(pool)
    .await?;
    Ok(jobs)
}

/// Update the informational per-role statuses reported by the agent.
pub async fn update_role_statuses(
    pool: &PgPool,
    job_id: Uuid,
    creator: Option<RoleStatus>,
    validator: Option<RoleStatus>,
) -> StoreResult<u64> {
    let rows = sqlx::query(
        "UPDATE jobs \
         SET creator_status = COALESCE($2, creator_status), \
             validator_status = COALESCE($3, validator_status) \
         WHERE id = $1 AND status NOT IN ('completed', 'cancelled')",
    )
    .bind(job_id)
    .bind(creator)
    .bind(validator)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Fold token/request usage deltas into a running job's counters. Also
/// advances `updated_at` (via trigger), which is what the stuck-work
/// detector observes as progress. The assigned agent keeps working while
/// a job sits in review, so both states accept usage.
pub async fn record_job_usage(
    pool: &PgPool,
    job_id: Uuid,
    tokens: i64,
    requests: i32,
) -> StoreResult<u64> {
    let rows = sqlx::query(
        "UPDATE jobs \
         SET total_tokens = total_tokens + $2, request_count = request_count + $3 \
         WHERE id = $1 AND status IN ('processing', 'pending_review')",
    )
    .bind(job_id)
    .bind(tokens)
    .bind(requests)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Delete a job. Only permitted from a terminal state; owned rows
/// (requirements, sources, citations, audit entries) cascade.
/// Returns the number of rows deleted (0 when the job is absent or live).
pub async fn delete_job(pool: &PgPool, job_id: Uuid) -> StoreResult<u64> {
    let rows = sqlx::query(
        "DELETE FROM jobs \
         WHERE id = $1 AND status IN ('completed', 'failed', 'cancelled')",
    )
    .bind(job_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}
