//! Aggregation queries backing the `/statistics/*` endpoints and the
//! hourly daily-rollup task.
//!
//! These are pure display reads: no row locks, rebuilt per request.

use sqlx::PgPool;

use crate::error::StoreResult;
use crate::models::DailyStatistics;

/// Job counts by status, plus run-length and usage aggregates.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobStatistics {
    pub created: i64,
    pub processing: i64,
    pub pending_review: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
    /// Mean seconds from creation to completion, completed jobs only.
    pub avg_completion_secs: Option<f64>,
    pub total_tokens: i64,
}

/// Get job counts by status plus aggregates.
pub async fn get_job_statistics(pool: &PgPool) -> StoreResult<JobStatistics> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::text, COUNT(*) as cnt FROM jobs GROUP BY status")
            .fetch_all(pool)
            .await?;

    let mut stats = JobStatistics::default();
    for (status, count) in &rows {
        match status.as_str() {
            "created" => stats.created = *count,
            "processing" => stats.processing = *count,
            "pending_review" => stats.pending_review = *count,
            "completed" => stats.completed = *count,
            "failed" => stats.failed = *count,
            "cancelled" => stats.cancelled = *count,
            _ => {}
        }
        stats.total += count;
    }

    let (avg_secs, tokens): (Option<f64>, Option<i64>) = sqlx::query_as(
        "SELECT AVG(EXTRACT(EPOCH FROM (completed_at - created_at)))::float8, \
                SUM(total_tokens)::bigint \
         FROM jobs WHERE status = 'completed'",
    )
    .fetch_one(pool)
    .await?;
    stats.avg_completion_secs = avg_secs;
    stats.total_tokens = tokens.unwrap_or(0);

    Ok(stats)
}

/// Agent counts by status.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AgentStatistics {
    pub booting: i64,
    pub ready: i64,
    pub working: i64,
    pub completed: i64,
    pub failed: i64,
    pub offline: i64,
    pub total: i64,
    /// Per-variant breakdown: `(config_name, total, ready)`.
    pub by_config: Vec<ConfigAgentCount>,
}

/// Agent availability for one config name.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ConfigAgentCount {
    pub config_name: String,
    pub total: i64,
    pub ready: i64,
}

/// Get agent counts by status and by config name.
pub async fn get_agent_statistics(pool: &PgPool) -> StoreResult<AgentStatistics> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::text, COUNT(*) as cnt FROM agents GROUP BY status")
            .fetch_all(pool)
            .await?;

    let mut stats = AgentStatistics::default();
    for (status, count) in &rows {
        match status.as_str() {
            "booting" => stats.booting = *count,
            "ready" => stats.ready = *count,
            "working" => stats.working = *count,
            "completed" => stats.completed = *count,
            "failed" => stats.failed = *count,
            "offline" => stats.offline = *count,
            _ => {}
        }
        stats.total += count;
    }

    stats.by_config = sqlx::query_as::<_, ConfigAgentCount>(
        "SELECT config_name, \
                COUNT(*) as total, \
                COUNT(*) FILTER (WHERE status = 'ready') as ready \
         FROM agents \
         GROUP BY config_name \
         ORDER BY config_name",
    )
    .fetch_all(pool)
    .await?;

    Ok(stats)
}

/// Recompute today's statistics row from the jobs table. Idempotent
/// upsert; the scheduler runs this hourly so the row converges on the
/// day's final numbers.
pub async fn upsert_daily_statistics(pool: &PgPool) -> StoreResult<DailyStatistics> {
    let row = sqlx::query_as::<_, DailyStatistics>(
        "INSERT INTO daily_statistics \
             (day, jobs_created, jobs_completed, jobs_failed, jobs_cancelled, total_tokens) \
         SELECT CURRENT_DATE, \
                COUNT(*) FILTER (WHERE created_at::date = CURRENT_DATE), \
                COUNT(*) FILTER (WHERE status = 'completed' \
                                   AND completed_at::date = CURRENT_DATE), \
                COUNT(*) FILTER (WHERE status = 'failed' \
                                   AND completed_at::date = CURRENT_DATE), \
                COUNT(*) FILTER (WHERE status = 'cancelled' \
                                   AND completed_at::date = CURRENT_DATE), \
                COALESCE(SUM(total_tokens) \
                    FILTER (WHERE completed_at::date = CURRENT_DATE), 0) \
         FROM jobs \
         ON CONFLICT (day) DO UPDATE \
         SET jobs_created = EXCLUDED.jobs_created, \
             jobs_completed = EXCLUDED.jobs_completed, \
             jobs_failed = EXCLUDED.jobs_failed, \
             jobs_cancelled = EXCLUDED.jobs_cancelled, \
             total_tokens = EXCLUDED.total_tokens, \
             updated_at = NOW() \
         RETURNING *",
    )
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// List rolled-up daily statistics, newest day first.
pub async fn list_daily_statistics(pool: &PgPool, limit: i64) -> StoreResult<Vec<DailyStatistics>> {
    let rows = sqlx::query_as::<_, DailyStatistics>(
        "SELECT * FROM daily_statistics ORDER BY day DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
