//! The dispatch claim: the single transaction that matches `created` jobs
//! to compatible `ready` agents.
//!
//! Both sides are selected with `FOR UPDATE SKIP LOCKED`, so two claim
//! passes running concurrently (two scheduler ticks, or two orchestrator
//! replicas) partition the candidate set instead of double-assigning.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Agent, Job};
use crate::queries::audit;

/// A job/agent pair matched by one claim pass, as committed.
#[derive(Debug, Clone)]
pub struct DispatchPair {
    pub job: Job,
    pub agent: Agent,
}

/// Match up to `batch_size` `created` jobs against `ready` agents with the
/// same `config_name`, oldest job first, freshest agent heartbeat first.
///
/// For every match, atomically within one transaction:
/// job `created -> processing` with `assigned_agent_id` set (orphan stamp
/// cleared), agent `ready -> working` with `current_job_id` set. Jobs with
/// no compatible agent are left untouched for the next pass.
pub async fn claim_created_jobs(pool: &PgPool, batch_size: i64) -> StoreResult<Vec<DispatchPair>> {
    let mut tx = pool.begin().await?;

    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs \
         WHERE status = 'created' \
         ORDER BY created_at ASC, id ASC \
         LIMIT $1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(batch_size)
    .fetch_all(&mut *tx)
    .await?;

    let mut pairs = Vec::new();
    for job in jobs {
        let agent = sqlx::query_as::<_, Agent>(
            "SELECT * FROM agents \
             WHERE status = 'ready' \
               AND config_name = $1 \
               AND current_job_id IS NULL \
             ORDER BY last_heartbeat DESC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(&job.config_name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(agent) = agent else {
            // No compatible agent this pass; the job stays `created`.
            continue;
        };

        // The row lock guarantees the status still matches, but the guard
        // stays in the statement so a claim can never touch a job that was
        // somehow re-entered after leaving `created`.
        let claimed_job = sqlx::query_as::<_, Job>(
            "UPDATE jobs \
             SET status = 'processing', assigned_agent_id = $2, orphaned_at = NULL \
             WHERE id = $1 AND status = 'created' \
             RETURNING *",
        )
        .bind(job.id)
        .bind(agent.id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(claimed_job) = claimed_job else {
            continue;
        };

        let claimed_agent = sqlx::query_as::<_, Agent>(
            "UPDATE agents \
             SET status = 'working', current_job_id = $2 \
             WHERE id = $1 AND status = 'ready' AND current_job_id IS NULL \
             RETURNING *",
        )
        .bind(agent.id)
        .bind(claimed_job.id)
        .fetch_one(&mut *tx)
        .await?;

        audit::append_entry(
            &mut *tx,
            claimed_job.id,
            "dispatcher",
            "job_dispatched",
            serde_json::json!({ "agent_id": claimed_agent.id }),
        )
        .await?;

        pairs.push(DispatchPair {
            job: claimed_job,
            agent: claimed_agent,
        });
    }

    tx.commit().await?;
    Ok(pairs)
}
