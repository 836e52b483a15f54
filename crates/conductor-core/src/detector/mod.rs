//! Stuck-work detection: liveness timeouts for agents, recovery grace
//! windows and progress stalls for jobs.
//!
//! Every pass is idempotent: an agent only expires once (the status flips
//! to `offline`), an orphaned job only gets its stamp once, and each
//! failure query moves rows into a terminal state they cannot match from
//! again.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;

use conductor_db::StoreResult;
use conductor_db::models::Job;
use conductor_db::queries::{agents as agent_db, jobs as job_db};

use crate::settings::Settings;

/// What one detector pass did.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectorPass {
    pub agents_expired: usize,
    pub jobs_orphaned: usize,
    pub jobs_failed_offline: usize,
    pub jobs_failed_stalled: usize,
}

/// One entry of the stuck-work report.
#[derive(Debug, Clone, Serialize)]
pub struct StuckJob {
    #[serde(flatten)]
    pub job: Job,
    /// Seconds since the job's `updated_at` last advanced.
    pub stalled_secs: i64,
}

/// The stuck-work detector.
pub struct StuckWorkDetector {
    pool: PgPool,
    settings: Arc<Settings>,
}

impl StuckWorkDetector {
    pub fn new(pool: PgPool, settings: Arc<Settings>) -> Self {
        Self { pool, settings }
    }

    /// One detection pass.
    ///
    /// 1. Agents past the liveness threshold go `offline`; a `processing`
    ///    job attached to one is detached back to `created` with an orphan
    ///    stamp, opening its recovery grace window.
    /// 2. Orphaned jobs whose grace window elapsed without a re-dispatch
    ///    fail with reason `agent_offline`.
    /// 3. `processing` jobs stalled past the escalation threshold fail
    ///    with reason `no_progress`.
    pub async fn run_pass(&self) -> StoreResult<DetectorPass> {
        let mut pass = DetectorPass::default();

        let expired =
            agent_db::expire_agents(&self.pool, self.settings.liveness_threshold.as_secs_f64())
                .await?;
        pass.agents_expired = expired.len();

        for agent in &expired {
            tracing::warn!(agent_id = %agent.id, hostname = %agent.hostname,
                last_heartbeat = %agent.last_heartbeat, "agent heartbeat expired, now offline");
            if let Some(job_id) = agent.current_job_id {
                let rows = job_db::orphan_job(&self.pool, job_id, agent.id).await?;
                if rows > 0 {
                    pass.jobs_orphaned += 1;
                    tracing::warn!(job_id = %job_id, agent_id = %agent.id,
                        "job orphaned, recovery grace window started");
                }
            }
        }

        let failed_offline = job_db::fail_grace_expired_jobs(
            &self.pool,
            self.settings.recovery_grace_window.as_secs_f64(),
        )
        .await?;
        pass.jobs_failed_offline = failed_offline.len();
        for job in &failed_offline {
            tracing::warn!(job_id = %job.id, "recovery grace window elapsed, job failed");
        }

        let failed_stalled = job_db::fail_stalled_jobs(
            &self.pool,
            self.settings.escalation_threshold.as_secs_f64(),
        )
        .await?;
        pass.jobs_failed_stalled = failed_stalled.len();
        for job in &failed_stalled {
            tracing::warn!(job_id = %job.id, updated_at = %job.updated_at,
                "job made no progress past the escalation threshold, failed");
        }

        Ok(pass)
    }

    /// The stuck-work report: jobs whose progress has stalled past the
    /// progress threshold. Reported only, never failed from here; the
    /// escalation in [`Self::run_pass`] has its own, longer threshold.
    pub async fn stuck_report(&self) -> StoreResult<Vec<StuckJob>> {
        let jobs = job_db::stuck_job_report(
            &self.pool,
            self.settings.progress_threshold.as_secs_f64(),
        )
        .await?;

        let now = Utc::now();
        Ok(jobs
            .into_iter()
            .map(|job| {
                let stalled_secs = (now - job.updated_at).num_seconds().max(0);
                StuckJob { job, stalled_secs }
            })
            .collect())
    }
}
