//! Job operations with semantic names, wrapping [`super::JobStateMachine`]
//! transitions together with their side effects (agent release, outbound
//! cancel commands, audit).

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{AgentStatus, Job, JobStatus, RoleStatus};
use conductor_db::queries::{agents as agent_db, jobs as db, uploads as upload_db};
use conductor_db::{StoreError, StoreResult};

use crate::client::AgentClient;
use crate::registry::AgentRegistry;
use crate::settings::Settings;
use super::JobStateMachine;

/// User-supplied fields for a new job.
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub description: String,
    pub upload_id: Option<Uuid>,
    pub context: Option<String>,
    pub instructions: Option<String>,
    pub config_name: Option<String>,
}

/// Validate and insert a new job in `created` status.
pub async fn create_job(pool: &PgPool, settings: &Settings, req: CreateJob) -> StoreResult<Job> {
    if req.description.trim().is_empty() {
        return Err(StoreError::constraint("description must not be empty"));
    }
    let config_name = match req.config_name {
        Some(name) if !name.trim().is_empty() => name,
        Some(_) => return Err(StoreError::constraint("config_name must not be empty")),
        None => settings.default_config_name.clone(),
    };
    if let Some(upload_id) = req.upload_id {
        if upload_db::get_upload(pool, upload_id).await?.is_none() {
            return Err(StoreError::constraint(format!(
                "upload {upload_id} does not exist"
            )));
        }
    }

    db::insert_job(
        pool,
        &db::NewJob {
            description: req.description,
            upload_id: req.upload_id,
            context: req.context,
            instructions: req.instructions,
            config_name,
        },
    )
    .await
}

/// Fetch a job or fail with `NotFound`.
pub async fn require_job(pool: &PgPool, job_id: Uuid) -> StoreResult<Job> {
    db::get_job(pool, job_id)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("job {job_id}")))
}

/// Cancel a job from `created`, `processing`, or `pending_review`.
///
/// An assigned agent gets a fire-and-forget cancel command; its own status
/// reconciles through its next heartbeat.
pub async fn cancel_job(
    pool: &PgPool,
    client: &Arc<AgentClient>,
    job_id: Uuid,
) -> StoreResult<Job> {
    let job = require_job(pool, job_id).await?;
    if job.status.is_terminal() {
        return Err(StoreError::conflict(format!(
            "job {job_id} is already {}",
            job.status
        )));
    }

    JobStateMachine::transition(pool, job_id, job.status, JobStatus::Cancelled, "user").await?;

    if let Some(agent_id) = job.assigned_agent_id {
        if let Some(agent) = agent_db::get_agent(pool, agent_id).await? {
            let client = Arc::clone(client);
            tokio::spawn(async move {
                if let Err(err) = client.cancel(&agent, job_id).await {
                    tracing::warn!(job_id = %job_id, agent_id = %agent.id, error = %err,
                        "cancel command not delivered");
                }
            });
        }
    }

    require_job(pool, job_id).await
}

/// Informational progress report from the assigned agent: per-role
/// statuses and usage deltas. Neither drives dispatch; both advance the
/// job's observable progress.
#[derive(Debug, Clone, Default)]
pub struct ProgressReport {
    pub creator_status: Option<RoleStatus>,
    pub validator_status: Option<RoleStatus>,
    pub total_tokens: i64,
    pub request_count: i32,
}

/// Fold an agent progress report into a live job.
pub async fn report_progress(
    pool: &PgPool,
    job_id: Uuid,
    report: ProgressReport,
) -> StoreResult<Job> {
    let job = require_job(pool, job_id).await?;
    if job.status.is_terminal() {
        return Err(StoreError::conflict(format!(
            "job {job_id} is already {}",
            job.status
        )));
    }

    if report.creator_status.is_some() || report.validator_status.is_some() {
        db::update_role_statuses(pool, job_id, report.creator_status, report.validator_status)
            .await?;
    }
    if report.total_tokens != 0 || report.request_count != 0 {
        db::record_job_usage(pool, job_id, report.total_tokens, report.request_count).await?;
    }

    require_job(pool, job_id).await
}

/// Record a successful finish reported by the assigned agent and release
/// the agent (`working -> completed`).
pub async fn report_completion(
    pool: &PgPool,
    job_id: Uuid,
    total_tokens: i64,
    request_count: i32,
) -> StoreResult<Job> {
    let job = require_job(pool, job_id).await?;

    let rows = db::complete_job(pool, job_id, total_tokens, request_count).await?;
    if rows == 0 {
        return Err(StoreError::conflict(format!(
            "job {job_id} has status {}, expected processing",
            job.status
        )));
    }

    if let Some(agent_id) = job.assigned_agent_id {
        if let Err(err) = AgentRegistry::mark_finished(pool, agent_id, AgentStatus::Completed).await
        {
            tracing::warn!(agent_id = %agent_id, error = %err,
                "agent not released on completion; will reconcile on heartbeat");
        }
    }

    require_job(pool, job_id).await
}

/// Record a failure reported by the assigned agent and mark the agent
/// failed.
pub async fn report_failure(
    pool: &PgPool,
    job_id: Uuid,
    error_message: &str,
    error_details: Option<&serde_json::Value>,
) -> StoreResult<Job> {
    let job = require_job(pool, job_id).await?;

    let rows = db::fail_job(pool, job_id, error_message, error_details).await?;
    if rows == 0 {
        return Err(StoreError::conflict(format!(
            "job {job_id} has status {}, expected processing",
            job.status
        )));
    }

    if let Some(agent_id) = job.assigned_agent_id {
        if let Err(err) = AgentRegistry::mark_finished(pool, agent_id, AgentStatus::Failed).await {
            tracing::warn!(agent_id = %agent_id, error = %err,
                "agent not released on failure; will reconcile on heartbeat");
        }
    }

    require_job(pool, job_id).await
}

/// Delete a job. Only terminal jobs can be deleted; owned rows cascade.
pub async fn delete_job(pool: &PgPool, job_id: Uuid) -> StoreResult<()> {
    let rows = db::delete_job(pool, job_id).await?;
    if rows == 0 {
        let job = require_job(pool, job_id).await?;
        return Err(StoreError::conflict(format!(
            "job {job_id} has status {}; only terminal jobs can be deleted",
            job.status
        )));
    }
    Ok(())
}
