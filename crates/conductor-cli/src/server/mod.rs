//! The HTTP API surface.
//!
//! All endpoints live under `/api` and speak JSON; `/healthz` sits at the
//! root for probes. Handlers route writes through `conductor-core` and
//! reads through the gateway, never around them.

pub mod agents;
pub mod error;
pub mod jobs;
pub mod stats;
pub mod uploads;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use sqlx::PgPool;
use tokio::sync::Notify;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use conductor_core::client::AgentClient;
use conductor_core::detector::StuckWorkDetector;
use conductor_core::review::ReviewCoordinator;
use conductor_core::scheduler;
use conductor_core::settings::Settings;
use conductor_core::uploads::UploadStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub settings: Arc<Settings>,
    pub client: Arc<AgentClient>,
    pub review: Arc<ReviewCoordinator>,
    pub detector: Arc<StuckWorkDetector>,
    pub uploads: Arc<UploadStore>,
    /// Wakes the dispatcher ahead of its cadence after job creation or an
    /// agent turning ready.
    pub dispatch_kick: Arc<Notify>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        settings: Arc<Settings>,
        client: Arc<AgentClient>,
        dispatch_kick: Arc<Notify>,
    ) -> Self {
        let review = Arc::new(ReviewCoordinator::new(pool.clone(), Arc::clone(&client)));
        let detector = Arc::new(StuckWorkDetector::new(pool.clone(), Arc::clone(&settings)));
        let uploads = Arc::new(UploadStore::new(
            settings.upload_root.clone(),
            settings.max_upload_bytes,
        ));
        Self {
            pool,
            settings,
            client,
            review,
            detector,
            uploads,
            dispatch_kick,
        }
    }
}

/// Build the full router.
pub fn build_router(state: AppState) -> Router {
    let request_timeout = state.settings.request_timeout;
    // Multipart bodies need headroom beyond the bundle limit itself.
    let body_limit = usize::try_from(state.settings.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(1024 * 1024);

    let api = Router::new()
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{id}/resume", post(jobs::resume_job))
        .route("/jobs/{id}/approve", post(jobs::approve_job))
        .route("/jobs/{id}/freeze", post(jobs::freeze_job))
        .route("/jobs/{id}/complete", post(jobs::complete_job))
        .route("/jobs/{id}/fail", post(jobs::fail_job))
        .route("/jobs/{id}/report", post(jobs::report_progress))
        .route("/jobs/{id}/audit", get(jobs::job_audit))
        .route("/jobs/{id}/progress", get(jobs::job_progress))
        .route("/jobs/{id}/requirements", get(jobs::job_requirements))
        .route("/jobs/{id}/sources", get(jobs::job_sources))
        .route("/jobs/{id}/citations", get(jobs::job_citations))
        .route("/agents", post(agents::register_agent).get(agents::list_agents))
        .route("/agents/{id}", get(agents::get_agent).delete(agents::remove_agent))
        .route("/agents/{id}/heartbeat", post(agents::heartbeat))
        .route("/agents/{id}/ready", post(agents::mark_ready))
        .route("/uploads", post(uploads::create_upload))
        .route("/uploads/{id}", get(uploads::get_upload))
        .route("/statistics/jobs", get(stats::job_statistics))
        .route("/statistics/agents", get(stats::agent_statistics))
        .route("/statistics/daily", get(stats::daily_statistics))
        .route("/statistics/stuck-jobs", get(stats::stuck_jobs));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Run the API server with the background scheduler, until ctrl-c.
pub async fn run_serve(
    pool: PgPool,
    settings: Arc<Settings>,
    bind: &str,
    port: u16,
) -> Result<()> {
    let client = Arc::new(AgentClient::new()?);
    let scheduler = scheduler::start(pool.clone(), Arc::clone(&settings), Arc::clone(&client));

    let state = AppState::new(
        pool,
        settings,
        client,
        Arc::clone(&scheduler.dispatch_kick),
    );
    let app = build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("conductor serving on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    tracing::info!("conductor shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install ctrl-c handler");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::PgPool;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    use conductor_core::client::AgentClient;
    use conductor_core::settings::Settings;
    use conductor_test_utils::{create_test_db, drop_test_db};

    use super::{AppState, build_router};

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn test_router(pool: PgPool, upload_root: &std::path::Path) -> Router {
        let settings = Arc::new(Settings {
            upload_root: upload_root.to_path_buf(),
            ..Settings::default()
        });
        let client = Arc::new(AgentClient::new().expect("client should build"));
        let state = AppState::new(pool, settings, client, Arc::new(Notify::new()));
        build_router(state)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> axum::response::Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .expect("request should build"),
            None => builder.body(Body::empty()).expect("request should build"),
        };
        app.clone()
            .oneshot(request)
            .await
            .expect("request should not fail")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
            .await
            .expect("body should be readable");
        serde_json::from_slice(&bytes).expect("body should be JSON")
    }

    async fn create_job(app: &Router, description: &str, config: &str) -> serde_json::Value {
        let resp = send(
            app,
            "POST",
            "/api/jobs",
            Some(serde_json::json!({ "description": description, "config_name": config })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await
    }

    async fn register_agent(app: &Router, config: &str) -> serde_json::Value {
        let resp = send(
            app,
            "POST",
            "/api/agents",
            Some(serde_json::json!({
                "hostname": format!("pod-{}", uuid::Uuid::new_v4().simple()),
                "pod_ip": "127.0.0.1",
                "pod_port": 9300,
                "config_name": config,
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn healthz_answers() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        let resp = send(&app, "GET", "/healthz", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn job_create_list_get() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        let job = create_job(&app, "write poem", "writer").await;
        assert_eq!(job["status"], "created");
        assert_eq!(job["config_name"], "writer");
        let id = job["id"].as_str().expect("id should be a string");

        let resp = send(&app, "GET", "/api/jobs", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let listed = body_json(resp).await;
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        let resp = send(&app, "GET", &format!("/api/jobs/{id}"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let detail = body_json(resp).await;
        assert_eq!(detail["description"], "write poem");
        assert!(detail.get("progress").is_some(), "detail carries progress");
        assert_eq!(detail["progress"]["percent"], 0.0);

        let resp = send(&app, "GET", "/api/jobs?status=processing", None).await;
        let filtered = body_json(resp).await;
        assert_eq!(filtered.as_array().map(Vec::len), Some(0));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn job_validation_errors() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        let resp = send(
            &app,
            "POST",
            "/api/jobs",
            Some(serde_json::json!({ "description": "   " })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(&app, "GET", "/api/jobs?status=sleeping", None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let random = uuid::Uuid::new_v4();
        let resp = send(&app, "GET", &format!("/api/jobs/{random}"), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn cancel_then_delete_lifecycle() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        let job = create_job(&app, "short lived", "writer").await;
        let id = job["id"].as_str().expect("id should be a string");

        let resp = send(&app, "DELETE", &format!("/api/jobs/{id}"), None).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT, "live jobs stay");

        let resp = send(&app, "POST", &format!("/api/jobs/{id}/cancel"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "cancelled");

        let resp = send(&app, "POST", &format!("/api/jobs/{id}/cancel"), None).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT, "terminal is terminal");

        let resp = send(&app, "DELETE", &format!("/api/jobs/{id}"), None).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn freeze_requires_a_processing_job() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        let job = create_job(&app, "too early", "writer").await;
        let id = job["id"].as_str().expect("id should be a string");

        let resp = send(
            &app,
            "POST",
            &format!("/api/jobs/{id}/freeze"),
            Some(serde_json::json!({ "summary": "done enough", "confidence": 0.9 })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn agent_registration_heartbeat_ready() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        let agent = register_agent(&app, "writer").await;
        assert_eq!(agent["status"], "booting");
        let id = agent["id"].as_str().expect("id should be a string");

        let resp = send(
            &app,
            "POST",
            &format!("/api/agents/{id}/heartbeat"),
            Some(serde_json::json!({ "status": "booting" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(&app, "POST", &format!("/api/agents/{id}/ready"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ready");

        let resp = send(&app, "GET", "/api/agents?status=ready", None).await;
        let listed = body_json(resp).await;
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        let random = uuid::Uuid::new_v4();
        let resp = send(
            &app,
            "POST",
            &format!("/api/agents/{random}/heartbeat"),
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "unknowns re-register");

        let resp = send(&app, "DELETE", &format!("/api/agents/{id}"), None).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT, "ready pods stay");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn upload_roundtrip_and_job_reference() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        let boundary = "conductor-test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             remember the milk\r\n\
             --{boundary}--\r\n"
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/uploads")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .expect("request should build");
        let resp = app
            .clone()
            .oneshot(request)
            .await
            .expect("request should not fail");
        assert_eq!(resp.status(), StatusCode::CREATED);
        let upload = body_json(resp).await;
        let upload_id = upload["upload_id"].as_str().expect("upload_id");
        assert_eq!(upload["files"][0]["name"], "notes.txt");
        assert_eq!(upload["files"][0]["mime_type"], "text/plain");

        // The file landed under {root}/{upload_id}/{name}.
        let on_disk = tmp.path().join(upload_id).join("notes.txt");
        let contents = std::fs::read_to_string(&on_disk).expect("file should exist");
        assert_eq!(contents, "remember the milk");

        let resp = send(&app, "GET", &format!("/api/uploads/{upload_id}"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(
            &app,
            "POST",
            "/api/jobs",
            Some(serde_json::json!({
                "description": "summarize the notes",
                "upload_id": upload_id,
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(body_json(resp).await["upload_id"], upload_id);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn empty_uploads_are_rejected() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        let boundary = "conductor-test-boundary";
        let body = format!("--{boundary}--\r\n");
        let request = Request::builder()
            .method("POST")
            .uri("/api/uploads")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .expect("request should build");
        let resp = app
            .clone()
            .oneshot(request)
            .await
            .expect("request should not fail");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn audit_trail_is_paginated() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        let job = create_job(&app, "audited", "writer").await;
        let id = job["id"].as_str().expect("id should be a string");

        let resp = send(&app, "GET", &format!("/api/jobs/{id}/audit?limit=10"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let page = body_json(resp).await;
        assert_eq!(page["total"], 1, "creation is audited");
        assert_eq!(page["entries"][0]["action"], "job_created");

        let random = uuid::Uuid::new_v4();
        let resp = send(&app, "GET", &format!("/api/jobs/{random}/audit"), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn agent_reports_fold_into_the_job() {
        use conductor_db::queries::dispatch::claim_created_jobs;

        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        let job = create_job(&app, "tracked work", "writer").await;
        let id = job["id"].as_str().expect("id should be a string");

        let agent = register_agent(&app, "writer").await;
        let agent_id = agent["id"].as_str().expect("id should be a string");
        let resp = send(&app, "POST", &format!("/api/agents/{agent_id}/ready"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let pairs = claim_created_jobs(&pool, 16)
            .await
            .expect("claim should succeed");
        assert_eq!(pairs.len(), 1);

        let resp = send(
            &app,
            "POST",
            &format!("/api/jobs/{id}/report"),
            Some(serde_json::json!({
                "creator_status": "processing",
                "total_tokens": 100,
                "request_count": 1,
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let reported = body_json(resp).await;
        assert_eq!(reported["creator_status"], "processing");
        assert_eq!(reported["validator_status"], "pending");
        assert_eq!(reported["total_tokens"], 100);

        let resp = send(
            &app,
            "POST",
            &format!("/api/jobs/{id}/report"),
            Some(serde_json::json!({ "creator_status": "daydreaming" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn progress_reflects_requirements() {
        use conductor_db::models::RequirementStatus;
        use conductor_db::queries::requirements as requirement_db;

        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        let job = create_job(&app, "tracked", "writer").await;
        let id = job["id"].as_str().expect("id should be a string");
        let job_id: uuid::Uuid = id.parse().expect("id should be a uuid");

        // Agents write requirements through the shared gateway.
        for i in 0..4 {
            let req = requirement_db::insert_requirement(
                &pool,
                job_id,
                &format!("requirement {i}"),
                None,
            )
            .await
            .expect("insert should succeed");
            if i == 0 {
                requirement_db::update_requirement_status(
                    &pool,
                    req.id,
                    RequirementStatus::Integrated,
                )
                .await
                .expect("update should succeed");
            }
        }

        let resp = send(&app, "GET", &format!("/api/jobs/{id}/progress"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let progress = body_json(resp).await;
        assert_eq!(progress["requirements"]["total"], 4);
        assert_eq!(progress["requirements"]["integrated"], 1);
        assert_eq!(progress["percent"], 0.25);
        assert!(
            progress.get("eta_secs").is_none(),
            "one integration is not enough for an ETA"
        );

        let resp = send(&app, "GET", &format!("/api/jobs/{id}/requirements"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let listed = body_json(resp).await;
        assert_eq!(listed.as_array().map(Vec::len), Some(4));

        let resp = send(&app, "GET", &format!("/api/jobs/{id}/sources"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await.as_array().map(Vec::len), Some(0));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn statistics_endpoints_answer() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let app = test_router(pool.clone(), tmp.path());

        create_job(&app, "counted", "writer").await;
        register_agent(&app, "writer").await;

        let resp = send(&app, "GET", "/api/statistics/jobs", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let stats = body_json(resp).await;
        assert_eq!(stats["created"], 1);
        assert_eq!(stats["total"], 1);

        let resp = send(&app, "GET", "/api/statistics/agents", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let stats = body_json(resp).await;
        assert_eq!(stats["booting"], 1);
        assert_eq!(stats["by_config"][0]["config_name"], "writer");

        let resp = send(&app, "GET", "/api/statistics/daily", None).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(&app, "GET", "/api/statistics/stuck-jobs", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let report = body_json(resp).await;
        assert_eq!(report.as_array().map(Vec::len), Some(0));

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
