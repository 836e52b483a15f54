//! Human-in-the-loop review coordination: freeze, approve, resume.
//!
//! An agent that reaches a self-declared checkpoint freezes its job and
//! keeps waiting; the job sits in `pending_review` until a human approves
//! or resumes it. The waiting agent stays `working` the whole time and is
//! only released through the commands sent from here (or by going
//! offline, in which case resume re-places the job).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{AgentStatus, Job, JobStatus};
use conductor_db::queries::{agents as agent_db, jobs as job_db};
use conductor_db::{StoreError, StoreResult};

use crate::client::AgentClient;
use crate::state::JobStateMachine;
use crate::state::actions::require_job;

/// Checkpoint payload an agent submits when freezing a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreezePayload {
    pub summary: String,
    #[serde(default)]
    pub deliverables: serde_json::Value,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub phase_number: Option<i32>,
    #[serde(default)]
    pub frozen_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// The review coordinator.
pub struct ReviewCoordinator {
    pool: PgPool,
    client: Arc<AgentClient>,
}

impl ReviewCoordinator {
    pub fn new(pool: PgPool, client: Arc<AgentClient>) -> Self {
        Self { pool, client }
    }

    /// Agent-initiated checkpoint: store the payload and move the job
    /// `processing -> pending_review`. The agent assignment is kept.
    pub async fn freeze(&self, job_id: Uuid, payload: FreezePayload) -> StoreResult<Job> {
        let frozen = serde_json::to_value(&payload)
            .map_err(|e| StoreError::constraint(format!("unserializable freeze payload: {e}")))?;

        let rows = job_db::freeze_job(&self.pool, job_id, &frozen).await?;
        if rows == 0 {
            let job = require_job(&self.pool, job_id).await?;
            return Err(StoreError::conflict(format!(
                "job {job_id} has status {}, expected processing",
                job.status
            )));
        }
        require_job(&self.pool, job_id).await
    }

    /// Approve a frozen job: `pending_review -> completed`, agent detached
    /// and told to wrap up. The agent releases itself (`working ->
    /// completed -> ready`) through its own acknowledgment heartbeats.
    pub async fn approve(&self, job_id: Uuid) -> StoreResult<Job> {
        let job = require_job(&self.pool, job_id).await?;
        let agent_id = job.assigned_agent_id;

        JobStateMachine::transition(
            &self.pool,
            job_id,
            JobStatus::PendingReview,
            JobStatus::Completed,
            "user",
        )
        .await?;

        if let Some(agent_id) = agent_id {
            if let Some(agent) = agent_db::get_agent(&self.pool, agent_id).await? {
                let client = Arc::clone(&self.client);
                tokio::spawn(async move {
                    if let Err(err) = client.approve(&agent, job_id).await {
                        tracing::warn!(job_id = %job_id, agent_id = %agent.id, error = %err,
                            "approve command not delivered; agent reconciles on heartbeat");
                    }
                });
            }
        }

        require_job(&self.pool, job_id).await
    }

    /// Resume a frozen job with optional reviewer feedback.
    ///
    /// With a reachable assigned agent: `pending_review -> processing` and
    /// the feedback goes out verbatim. With a missing, offline, or
    /// unreachable agent: the job is detached back to `created` so the
    /// dispatcher re-places it on the next compatible pod.
    pub async fn resume(&self, job_id: Uuid, feedback: Option<String>) -> StoreResult<Job> {
        let job = require_job(&self.pool, job_id).await?;
        if job.status != JobStatus::PendingReview {
            return Err(StoreError::conflict(format!(
                "job {job_id} has status {}, expected pending_review",
                job.status
            )));
        }

        let agent = match job.assigned_agent_id {
            Some(agent_id) => agent_db::get_agent(&self.pool, agent_id).await?,
            None => None,
        };

        let Some(agent) = agent.filter(|a| a.status != AgentStatus::Offline) else {
            tracing::info!(job_id = %job_id,
                "resume with no live assigned agent; detaching for re-dispatch");
            return self.detach_for_redispatch(job_id, JobStatus::PendingReview).await;
        };

        JobStateMachine::transition(
            &self.pool,
            job_id,
            JobStatus::PendingReview,
            JobStatus::Processing,
            "user",
        )
        .await?;

        match self
            .client
            .resume(&agent, job_id, feedback.as_deref())
            .await
        {
            Ok(()) => require_job(&self.pool, job_id).await,
            Err(err) => {
                tracing::warn!(job_id = %job_id, agent_id = %agent.id, error = %err,
                    "resume command not delivered; detaching for re-dispatch");
                self.detach_for_redispatch(job_id, JobStatus::Processing)
                    .await
            }
        }
    }

    async fn detach_for_redispatch(&self, job_id: Uuid, from: JobStatus) -> StoreResult<Job> {
        let rows = job_db::detach_job(&self.pool, job_id, from).await?;
        if rows == 0 {
            // A concurrent writer moved the job meanwhile; report its
            // current shape rather than failing the resume outright.
            tracing::debug!(job_id = %job_id, "detach lost a race, returning current row");
        }
        require_job(&self.pool, job_id).await
    }
}
