//! Agent pod registry: registration, heartbeats, and the agent state
//! machine.
//!
//! Registration is idempotent on the pod's `(hostname, pod_ip, pod_port)`
//! address. Heartbeats always use the server clock and never move
//! backwards; an offline agent's heartbeat is rejected so the pod
//! re-registers from scratch.

use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{Agent, AgentStatus};
use conductor_db::queries::agents as db;
use conductor_db::{StoreError, StoreResult};

/// Registration payload from a booting pod.
#[derive(Debug, Clone)]
pub struct Registration {
    pub hostname: String,
    pub pod_ip: String,
    pub pod_port: i32,
    pub config_name: String,
    pub metadata: serde_json::Value,
}

/// The agent registry.
///
/// Enforces the valid transition graph:
///
/// ```text
/// booting   -> ready | failed
/// ready     -> working | offline
/// working   -> completed | failed | offline
/// completed -> ready
/// failed    -> offline
/// offline   -> booting   (re-registration only)
/// ```
pub struct AgentRegistry;

impl AgentRegistry {
    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the state graph.
    pub fn is_valid_transition(from: AgentStatus, to: AgentStatus) -> bool {
        matches!(
            (from, to),
            (AgentStatus::Booting, AgentStatus::Ready)
                | (AgentStatus::Booting, AgentStatus::Failed)
                | (AgentStatus::Ready, AgentStatus::Working)
                | (AgentStatus::Ready, AgentStatus::Offline)
                | (AgentStatus::Working, AgentStatus::Completed)
                | (AgentStatus::Working, AgentStatus::Failed)
                | (AgentStatus::Working, AgentStatus::Offline)
                | (AgentStatus::Completed, AgentStatus::Ready)
                | (AgentStatus::Failed, AgentStatus::Offline)
                | (AgentStatus::Offline, AgentStatus::Booting)
        )
    }

    /// Register a pod, reusing any existing record with the same address.
    /// The reused record resets to `booting` with a cleared job link.
    pub async fn register(pool: &PgPool, reg: Registration) -> StoreResult<Agent> {
        if reg.config_name.trim().is_empty() {
            return Err(StoreError::constraint("config_name must not be empty"));
        }
        if reg.hostname.trim().is_empty() || reg.pod_ip.trim().is_empty() {
            return Err(StoreError::constraint(
                "hostname and pod_ip must not be empty",
            ));
        }

        db::upsert_agent(
            pool,
            &db::NewAgent {
                hostname: reg.hostname,
                pod_ip: reg.pod_ip,
                pod_port: reg.pod_port,
                config_name: reg.config_name,
                metadata: reg.metadata,
            },
        )
        .await
    }

    /// Process a heartbeat: advance `last_heartbeat` to the server clock
    /// and apply the reported status when it forms a legal edge.
    ///
    /// An unknown or `offline` agent gets `NotFound`, which tells the pod
    /// to re-register. An illegal reported transition is ignored (with a
    /// warning) rather than rejected, so a lagging pod cannot lose its
    /// liveness signal over a stale status.
    pub async fn heartbeat(
        pool: &PgPool,
        agent_id: Uuid,
        reported: Option<AgentStatus>,
        current_job_id: Option<Uuid>,
    ) -> StoreResult<Agent> {
        let rows = db::touch_heartbeat(pool, agent_id).await?;
        if rows == 0 {
            return Err(StoreError::not_found(format!(
                "agent {agent_id} is unknown or offline; re-register"
            )));
        }

        let agent = Self::require(pool, agent_id).await?;

        if let Some(reported) = reported {
            if reported != agent.status {
                Self::apply_reported_status(pool, &agent, reported, current_job_id).await?;
            }
        }

        Self::require(pool, agent_id).await
    }

    async fn apply_reported_status(
        pool: &PgPool,
        agent: &Agent,
        reported: AgentStatus,
        current_job_id: Option<Uuid>,
    ) -> StoreResult<()> {
        if !Self::is_valid_transition(agent.status, reported) {
            tracing::warn!(agent_id = %agent.id, from = %agent.status, to = %reported,
                "ignoring illegal status transition reported via heartbeat");
            return Ok(());
        }

        let rows = match (agent.status, reported) {
            // Finishing work clears the job link in the same statement.
            (AgentStatus::Working, AgentStatus::Completed)
            | (AgentStatus::Working, AgentStatus::Failed) => {
                db::set_finished(pool, agent.id, reported).await?
            }
            // Picking up work requires the job reference.
            (AgentStatus::Ready, AgentStatus::Working) => match current_job_id {
                Some(job_id) => db::set_working(pool, agent.id, job_id).await?,
                None => {
                    tracing::warn!(agent_id = %agent.id,
                        "heartbeat reported working without a job id; ignoring");
                    return Ok(());
                }
            },
            _ => db::transition_agent_status(pool, agent.id, agent.status, reported).await?,
        };

        if rows == 0 {
            // A concurrent writer (dispatcher, detector) won the race; the
            // next heartbeat will converge.
            tracing::debug!(agent_id = %agent.id, from = %agent.status, to = %reported,
                "heartbeat status update lost a race");
        }
        Ok(())
    }

    /// Transition `booting -> ready`; the pod is now dispatchable.
    pub async fn mark_ready(pool: &PgPool, agent_id: Uuid) -> StoreResult<Agent> {
        let rows =
            db::transition_agent_status(pool, agent_id, AgentStatus::Booting, AgentStatus::Ready)
                .await?;
        if rows == 0 {
            let agent = Self::require(pool, agent_id).await?;
            return Err(StoreError::conflict(format!(
                "agent {agent_id} has status {}, expected booting",
                agent.status
            )));
        }
        Self::require(pool, agent_id).await
    }

    /// Transition `ready -> working` and link the job. Rejects when the
    /// agent is not ready or already holds a job.
    pub async fn mark_working(pool: &PgPool, agent_id: Uuid, job_id: Uuid) -> StoreResult<Agent> {
        let rows = db::set_working(pool, agent_id, job_id).await?;
        if rows == 0 {
            let agent = Self::require(pool, agent_id).await?;
            return Err(StoreError::conflict(format!(
                "agent {agent_id} has status {} (job link {:?}); expected ready and idle",
                agent.status, agent.current_job_id
            )));
        }
        Self::require(pool, agent_id).await
    }

    /// Transition `working -> completed|failed` and clear the job link.
    pub async fn mark_finished(
        pool: &PgPool,
        agent_id: Uuid,
        outcome: AgentStatus,
    ) -> StoreResult<Agent> {
        if !matches!(outcome, AgentStatus::Completed | AgentStatus::Failed) {
            return Err(StoreError::constraint(format!(
                "finish outcome must be completed or failed, got {outcome}"
            )));
        }
        let rows = db::set_finished(pool, agent_id, outcome).await?;
        if rows == 0 {
            let agent = Self::require(pool, agent_id).await?;
            return Err(StoreError::conflict(format!(
                "agent {agent_id} has status {}, expected working",
                agent.status
            )));
        }
        Self::require(pool, agent_id).await
    }

    /// Hard-delete an agent. Only settled pods (`offline`, `failed`,
    /// `completed`) can be removed; a live job blocks removal.
    pub async fn remove(pool: &PgPool, agent_id: Uuid) -> StoreResult<()> {
        let rows = db::delete_agent(pool, agent_id).await?;
        if rows == 0 {
            let agent = Self::require(pool, agent_id).await?;
            return Err(StoreError::conflict(format!(
                "agent {agent_id} has status {}; only offline, failed, or completed \
                 agents can be removed",
                agent.status
            )));
        }
        Ok(())
    }

    /// Fetch an agent or fail with `NotFound`.
    pub async fn require(pool: &PgPool, agent_id: Uuid) -> StoreResult<Agent> {
        db::get_agent(pool, agent_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("agent {agent_id}")))
    }
}
