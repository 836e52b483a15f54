//! Progress and ETA computation over a job's requirements.

use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;

use conductor_db::StoreResult;
use conductor_db::models::Job;
use conductor_db::queries::requirements::{RequirementCounts, get_requirement_counts};

/// Integrations needed before an ETA is worth extrapolating.
const MIN_INTEGRATIONS_FOR_ETA: i64 = 3;

/// Progress summary served with job detail.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSummary {
    pub requirements: RequirementCounts,
    /// Fraction of requirements integrated, in `[0, 1]`.
    pub percent: f64,
    /// Estimated seconds until the remaining requirements settle, when
    /// enough integrations exist to extrapolate from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<i64>,
}

/// Fraction of a job's requirements that are integrated, clamped to
/// `[0, 1]`; 0.0 when there are no requirements at all.
pub fn percent(counts: &RequirementCounts) -> f64 {
    if counts.total == 0 {
        return 0.0;
    }
    (counts.integrated as f64 / counts.total as f64).clamp(0.0, 1.0)
}

/// Extrapolated seconds to finish: elapsed-per-integration times the
/// remaining non-terminal requirements. `None` below
/// [`MIN_INTEGRATIONS_FOR_ETA`] integrations.
pub fn eta_secs(counts: &RequirementCounts, elapsed_secs: i64) -> Option<i64> {
    if counts.integrated < MIN_INTEGRATIONS_FOR_ETA {
        return None;
    }
    let per_integration = elapsed_secs as f64 / counts.integrated as f64;
    Some((per_integration * counts.remaining() as f64).round() as i64)
}

/// Build the progress summary for one job.
pub async fn job_progress(pool: &PgPool, job: &Job) -> StoreResult<ProgressSummary> {
    let counts = get_requirement_counts(pool, job.id).await?;
    let elapsed_secs = (Utc::now() - job.created_at).num_seconds().max(0);
    Ok(ProgressSummary {
        percent: percent(&counts),
        eta_secs: eta_secs(&counts, elapsed_secs),
        requirements: counts,
    })
}
