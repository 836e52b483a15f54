//! The dispatcher: moves jobs from `created` to `processing` by claiming
//! compatible ready agents, then pushes the start command to each matched
//! pod.
//!
//! The claim itself is one skip-locked transaction in the gateway
//! ([`conductor_db::queries::dispatch::claim_created_jobs`]); delivery of
//! the start command happens after commit, detached from the tick, so a
//! slow pod cannot stall the next pass.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinHandle;

use conductor_db::queries::dispatch::{DispatchPair, claim_created_jobs};
use conductor_db::queries::{agents as agent_db, jobs as job_db};
use conductor_db::{StoreResult, retry_transient};

use crate::client::AgentClient;
use crate::settings::Settings;

/// Result of one dispatch tick.
pub struct DispatchOutcome {
    /// Matched pairs, already committed as `processing`/`working`.
    pub pairs: Vec<DispatchPair>,
    /// Detached start-command deliveries; tests await these for
    /// determinism, the scheduler lets them run out on their own.
    pub deliveries: Vec<JoinHandle<()>>,
}

/// The dispatcher.
pub struct Dispatcher {
    pool: PgPool,
    client: Arc<AgentClient>,
    settings: Arc<Settings>,
}

impl Dispatcher {
    pub fn new(pool: PgPool, client: Arc<AgentClient>, settings: Arc<Settings>) -> Self {
        Self {
            pool,
            client,
            settings,
        }
    }

    /// One dispatch pass: claim a batch, then fire a start command per
    /// matched pair.
    pub async fn tick(&self) -> StoreResult<DispatchOutcome> {
        let batch = self.settings.dispatch_batch_size;
        let pairs = retry_transient(|| claim_created_jobs(&self.pool, batch)).await?;

        if !pairs.is_empty() {
            tracing::info!(matched = pairs.len(), "dispatch tick matched jobs");
        }

        let deliveries = pairs
            .iter()
            .cloned()
            .map(|pair| {
                let pool = self.pool.clone();
                let client = Arc::clone(&self.client);
                let settings = Arc::clone(&self.settings);
                tokio::spawn(async move {
                    deliver_start(pool, client, settings, pair).await;
                })
            })
            .collect();

        Ok(DispatchOutcome { pairs, deliveries })
    }
}

/// Deliver the start command for one matched pair, rolling the claim back
/// if the pod never acknowledges it.
async fn deliver_start(
    pool: PgPool,
    client: Arc<AgentClient>,
    settings: Arc<Settings>,
    pair: DispatchPair,
) {
    match client.start(&pair.agent, &pair.job).await {
        Ok(()) => {
            tracing::info!(job_id = %pair.job.id, agent_id = %pair.agent.id,
                "start command acknowledged");
        }
        Err(err) => {
            tracing::warn!(job_id = %pair.job.id, agent_id = %pair.agent.id, error = %err,
                "start command failed after retries, rolling back dispatch");
            roll_back(&pool, &settings, &pair).await;
        }
    }
}

/// Undo a claim whose start command was never acknowledged: the agent is
/// failed (reason `start_command_failed`), the job returns to `created`
/// with its attempt counter advanced, and a job that has exhausted its
/// dispatch attempts fails for good.
async fn roll_back(pool: &PgPool, settings: &Settings, pair: &DispatchPair) {
    if let Err(err) = agent_db::mark_start_failed(pool, pair.agent.id).await {
        tracing::warn!(agent_id = %pair.agent.id, error = %err,
            "could not mark agent failed after undelivered start");
    }

    match job_db::release_failed_dispatch(pool, pair.job.id, pair.agent.id).await {
        Ok(Some(job)) => {
            if job.dispatch_attempts >= settings.max_dispatch_attempts {
                tracing::warn!(job_id = %job.id, attempts = job.dispatch_attempts,
                    "dispatch attempts exhausted, failing job");
                if let Err(err) =
                    job_db::fail_unplaceable_job(pool, job.id, "no_compatible_agent").await
                {
                    tracing::warn!(job_id = %job.id, error = %err,
                        "could not fail exhausted job");
                }
            }
        }
        Ok(None) => {
            // The job moved on concurrently (cancelled, or re-claimed by a
            // detector pass); nothing left to undo.
            tracing::debug!(job_id = %pair.job.id, "dispatch rollback found job already moved");
        }
        Err(err) => {
            tracing::warn!(job_id = %pair.job.id, error = %err,
                "could not roll back failed dispatch");
        }
    }
}
