//! Database query functions for the `audit_entries` table.
//!
//! Entries are append-only. Transition queries write their own entries
//! inside the same transaction; agents append through [`append_entry`]
//! directly.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::AuditEntry;

/// Append an audit entry. Takes any executor so callers can write the
/// entry inside their own transaction.
pub async fn append_entry<'e, E>(
    executor: E,
    job_id: Uuid,
    actor: &str,
    action: &str,
    detail: serde_json::Value,
) -> StoreResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO audit_entries (job_id, actor, action, detail) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(job_id)
    .bind(actor)
    .bind(action)
    .bind(detail)
    .execute(executor)
    .await?;
    Ok(())
}

/// One page of audit entries for a job, oldest first.
pub async fn list_entries(
    pool: &PgPool,
    job_id: Uuid,
    limit: i64,
    offset: i64,
) -> StoreResult<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM audit_entries \
         WHERE job_id = $1 \
         ORDER BY id ASC \
         LIMIT $2 OFFSET $3",
    )
    .bind(job_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

/// Total number of audit entries for a job.
pub async fn count_entries(pool: &PgPool, job_id: Uuid) -> StoreResult<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_entries WHERE job_id = $1")
        .bind(job_id)
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}
