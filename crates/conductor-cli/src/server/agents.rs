//! Agent endpoints: registration, heartbeat, readiness, listing, removal.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use conductor_core::registry::{AgentRegistry, Registration};
use conductor_db::models::{Agent, AgentStatus};
use conductor_db::queries::agents as agent_db;

use super::AppState;
use super::error::ApiError;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub hostname: String,
    pub pod_ip: String,
    pub pod_port: i32,
    pub config_name: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_job_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListAgentsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub config_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<RegisterAgentRequest>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    let agent = AgentRegistry::register(
        &state.pool,
        Registration {
            hostname: req.hostname,
            pod_ip: req.pod_ip,
            pod_port: req.pod_port,
            config_name: req.config_name,
            metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<HeartbeatRequest>>,
) -> Result<Json<Agent>, ApiError> {
    let req = match body {
        Some(Json(req)) => req,
        None => HeartbeatRequest {
            status: None,
            current_job_id: None,
        },
    };

    let reported = match req.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<AgentStatus>()
                .map_err(|e| ApiError::bad_request(e.to_string()))?,
        ),
        None => None,
    };

    let agent = AgentRegistry::heartbeat(&state.pool, id, reported, req.current_job_id).await?;

    // An agent that just became dispatchable is worth an eager tick.
    if agent.status == AgentStatus::Ready {
        state.dispatch_kick.notify_one();
    }

    Ok(Json(agent))
}

pub async fn mark_ready(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Agent>, ApiError> {
    let agent = AgentRegistry::mark_ready(&state.pool, id).await?;
    state.dispatch_kick.notify_one();
    Ok(Json(agent))
}

pub async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
) -> Result<Json<Vec<Agent>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<AgentStatus>()
                .map_err(|e| ApiError::bad_request(e.to_string()))?,
        ),
        None => None,
    };

    let agents = agent_db::list_agents(&state.pool, status, query.config_name.as_deref()).await?;
    Ok(Json(agents))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Agent>, ApiError> {
    let agent = AgentRegistry::require(&state.pool, id).await?;
    Ok(Json(agent))
}

pub async fn remove_agent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    AgentRegistry::remove(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
