//! Job endpoints: creation, listing, lifecycle commands, audit, progress.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conductor_core::progress::{self, ProgressSummary};
use conductor_core::review::FreezePayload;
use conductor_core::state::actions;
use conductor_db::models::{AuditEntry, Citation, Job, JobStatus, Requirement, RoleStatus, Source};
use conductor_db::queries::{
    audit as audit_db, citations as citation_db, jobs as job_db,
    requirements as requirement_db,
};

use super::AppState;
use super::error::ApiError;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub description: String,
    #[serde(default)]
    pub upload_id: Option<Uuid>,
    #[serde(default)]
    pub config_name: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    #[serde(flatten)]
    pub job: Job,
    pub progress: ProgressSummary,
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CompleteRequest {
    #[serde(default)]
    pub total_tokens: Option<i64>,
    #[serde(default)]
    pub request_count: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    #[serde(default)]
    pub creator_status: Option<String>,
    #[serde(default)]
    pub validator_status: Option<String>,
    #[serde(default)]
    pub total_tokens: Option<i64>,
    #[serde(default)]
    pub request_count: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub error_message: String,
    #[serde(default)]
    pub error_details: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = actions::create_job(
        &state.pool,
        &state.settings,
        actions::CreateJob {
            description: req.description,
            upload_id: req.upload_id,
            context: req.context,
            instructions: req.instructions,
            config_name: req.config_name,
        },
    )
    .await?;

    // Wake the dispatcher rather than waiting out its cadence.
    state.dispatch_kick.notify_one();

    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<JobStatus>()
                .map_err(|e| ApiError::bad_request(e.to_string()))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    let jobs = job_db::list_jobs(&state.pool, status, limit).await?;
    Ok(Json(jobs))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobDetailResponse>, ApiError> {
    let job = actions::require_job(&state.pool, id).await?;
    let progress = progress::job_progress(&state.pool, &job).await?;
    Ok(Json(JobDetailResponse { job, progress }))
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    actions::delete_job(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = actions::cancel_job(&state.pool, &state.client, id).await?;
    Ok(Json(job))
}

pub async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ResumeRequest>>,
) -> Result<Json<Job>, ApiError> {
    let feedback = body.and_then(|Json(req)| req.feedback);
    let job = state.review.resume(id, feedback).await?;
    Ok(Json(job))
}

pub async fn approve_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = state.review.approve(id).await?;
    Ok(Json(job))
}

pub async fn freeze_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<FreezePayload>,
) -> Result<Json<Job>, ApiError> {
    let job = state.review.freeze(id, payload).await?;
    Ok(Json(job))
}

pub async fn complete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CompleteRequest>>,
) -> Result<Json<Job>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let job = actions::report_completion(
        &state.pool,
        id,
        req.total_tokens.unwrap_or(0),
        req.request_count.unwrap_or(0),
    )
    .await?;
    Ok(Json(job))
}

pub async fn report_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReportRequest>,
) -> Result<Json<Job>, ApiError> {
    let creator_status = parse_role_status(req.creator_status.as_deref())?;
    let validator_status = parse_role_status(req.validator_status.as_deref())?;

    let job = actions::report_progress(
        &state.pool,
        id,
        actions::ProgressReport {
            creator_status,
            validator_status,
            total_tokens: req.total_tokens.unwrap_or(0),
            request_count: req.request_count.unwrap_or(0),
        },
    )
    .await?;
    Ok(Json(job))
}

fn parse_role_status(raw: Option<&str>) -> Result<Option<RoleStatus>, ApiError> {
    match raw {
        Some(raw) => raw
            .parse::<RoleStatus>()
            .map(Some)
            .map_err(|e| ApiError::bad_request(e.to_string())),
        None => Ok(None),
    }
}

pub async fn fail_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FailRequest>,
) -> Result<Json<Job>, ApiError> {
    let job = actions::report_failure(
        &state.pool,
        id,
        &req.error_message,
        req.error_details.as_ref(),
    )
    .await?;
    Ok(Json(job))
}

pub async fn job_audit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditPage>, ApiError> {
    // 404 for an unknown job rather than an empty page.
    actions::require_job(&state.pool, id).await?;

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let entries = audit_db::list_entries(&state.pool, id, limit, offset).await?;
    let total = audit_db::count_entries(&state.pool, id).await?;
    Ok(Json(AuditPage {
        entries,
        total,
        limit,
        offset,
    }))
}

pub async fn job_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProgressSummary>, ApiError> {
    let job = actions::require_job(&state.pool, id).await?;
    let progress = progress::job_progress(&state.pool, &job).await?;
    Ok(Json(progress))
}

// Read-only views over the artifacts agents write through the shared
// store. The control plane never interprets these.

pub async fn job_requirements(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Requirement>>, ApiError> {
    actions::require_job(&state.pool, id).await?;
    let requirements = requirement_db::list_requirements_for_job(&state.pool, id).await?;
    Ok(Json(requirements))
}

pub async fn job_sources(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Source>>, ApiError> {
    actions::require_job(&state.pool, id).await?;
    let sources = citation_db::list_sources_for_job(&state.pool, id).await?;
    Ok(Json(sources))
}

pub async fn job_citations(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Citation>>, ApiError> {
    actions::require_job(&state.pool, id).await?;
    let citations = citation_db::list_citations_for_job(&state.pool, id).await?;
    Ok(Json(citations))
}
