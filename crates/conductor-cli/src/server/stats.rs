//! Statistics endpoints: aggregations and the stuck-work report.

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;

use conductor_core::detector::StuckJob;
use conductor_db::models::DailyStatistics;
use conductor_db::queries::stats as stats_db;

use super::AppState;
use super::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct DailyQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn job_statistics(
    State(state): State<AppState>,
) -> Result<Json<stats_db::JobStatistics>, ApiError> {
    let stats = stats_db::get_job_statistics(&state.pool).await?;
    Ok(Json(stats))
}

pub async fn agent_statistics(
    State(state): State<AppState>,
) -> Result<Json<stats_db::AgentStatistics>, ApiError> {
    let stats = stats_db::get_agent_statistics(&state.pool).await?;
    Ok(Json(stats))
}

pub async fn daily_statistics(
    State(state): State<AppState>,
    Query(query): Query<DailyQuery>,
) -> Result<Json<Vec<DailyStatistics>>, ApiError> {
    let limit = query.limit.unwrap_or(30).clamp(1, 365);
    let rows = stats_db::list_daily_statistics(&state.pool, limit).await?;
    Ok(Json(rows))
}

pub async fn stuck_jobs(State(state): State<AppState>) -> Result<Json<Vec<StuckJob>>, ApiError> {
    let report = state.detector.stuck_report().await?;
    Ok(Json(report))
}
