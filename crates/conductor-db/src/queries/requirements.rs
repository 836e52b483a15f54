//! Database query functions for the `requirements` table.
//!
//! Requirements are produced by agents through this same gateway; the
//! control plane itself only counts them by status for progress reporting.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Requirement, RequirementStatus};

/// Insert a new requirement row in `pending` status.
pub async fn insert_requirement(
    pool: &PgPool,
    job_id: Uuid,
    description: &str,
    graph_node_id: Option<&str>,
) -> StoreResult<Requirement> {
    let requirement = sqlx::query_as::<_, Requirement>(
        "INSERT INTO requirements (job_id, description, graph_node_id) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(job_id)
    .bind(description)
    .bind(graph_node_id)
    .fetch_one(pool)
    .await?;
    Ok(requirement)
}

/// Update a requirement's status. Returns rows affected.
pub async fn update_requirement_status(
    pool: &PgPool,
    id: Uuid,
    status: RequirementStatus,
) -> StoreResult<u64> {
    let rows = sqlx::query("UPDATE requirements SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows)
}

/// List all requirements for a job, oldest first.
pub async fn list_requirements_for_job(pool: &PgPool, job_id: Uuid) -> StoreResult<Vec<Requirement>> {
    let requirements = sqlx::query_as::<_, Requirement>(
        "SELECT * FROM requirements WHERE job_id = $1 ORDER BY created_at ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;
    Ok(requirements)
}

/// Status counts for a job's requirements.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RequirementCounts {
    pub pending: i64,
    pub validating: i64,
    pub integrated: i64,
    pub rejected: i64,
    pub failed: i64,
    pub total: i64,
}

impl RequirementCounts {
    /// Requirements that may still change status.
    pub fn remaining(&self) -> i64 {
        self.pending + self.validating
    }
}

/// Get a summary of requirement counts by status for a given job.
pub async fn get_requirement_counts(pool: &PgPool, job_id: Uuid) -> StoreResult<RequirementCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM requirements \
         WHERE job_id = $1 \
         GROUP BY status",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    let mut counts = RequirementCounts::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => counts.pending = *count,
            "validating" => counts.validating = *count,
            "integrated" => counts.integrated = *count,
            "rejected" => counts.rejected = *count,
            "failed" => counts.failed = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}
