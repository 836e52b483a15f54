//! Database query functions for the `sources` and `citations` tables.
//!
//! Both are artifacts of the citation subsystem, owned by a job and
//! cascade-deleted with it. The control plane stores and serves them
//! without interpreting their payloads.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Citation, Source};

/// Insert a source row.
pub async fn insert_source(
    pool: &PgPool,
    job_id: Uuid,
    title: &str,
    url: Option<&str>,
    payload: serde_json::Value,
) -> StoreResult<Source> {
    let source = sqlx::query_as::<_, Source>(
        "INSERT INTO sources (job_id, title, url, payload) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(job_id)
    .bind(title)
    .bind(url)
    .bind(payload)
    .fetch_one(pool)
    .await?;
    Ok(source)
}

/// Insert a citation row pointing at an existing source.
pub async fn insert_citation(
    pool: &PgPool,
    job_id: Uuid,
    source_id: Uuid,
    snippet: &str,
    payload: serde_json::Value,
) -> StoreResult<Citation> {
    let citation = sqlx::query_as::<_, Citation>(
        "INSERT INTO citations (job_id, source_id, snippet, payload) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(job_id)
    .bind(source_id)
    .bind(snippet)
    .bind(payload)
    .fetch_one(pool)
    .await?;
    Ok(citation)
}

/// List all sources for a job, oldest first.
pub async fn list_sources_for_job(pool: &PgPool, job_id: Uuid) -> StoreResult<Vec<Source>> {
    let sources =
        sqlx::query_as::<_, Source>("SELECT * FROM sources WHERE job_id = $1 ORDER BY created_at ASC")
            .bind(job_id)
            .fetch_all(pool)
            .await?;
    Ok(sources)
}

/// List all citations for a job, oldest first.
pub async fn list_citations_for_job(pool: &PgPool, job_id: Uuid) -> StoreResult<Vec<Citation>> {
    let citations = sqlx::query_as::<_, Citation>(
        "SELECT * FROM citations WHERE job_id = $1 ORDER BY created_at ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;
    Ok(citations)
}
