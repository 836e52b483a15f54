//! Shared test utilities for conductor integration tests.
//!
//! Provides a PostgreSQL instance shared across tests (each test gets its
//! own database within the instance) and a mock agent pod HTTP server for
//! exercising outbound commands.
//!
//! Two database modes:
//! - **`CONDUCTOR_TEST_PG_URL`** set: use the external server directly.
//!   No testcontainers overhead per process.
//! - **No env var** (`cargo test`): spin up a container via testcontainers,
//!   shared per binary through a `OnceCell`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use conductor_db::pool;

// ---------------------------------------------------------------------------
// Shared PostgreSQL
// ---------------------------------------------------------------------------

/// Shared container state: base URL and optional container handle (kept alive).
struct SharedPg {
    base_url: String,
    /// Held to keep the container alive. `None` when using an external URL.
    _container: Option<ContainerAsync<Postgres>>,
}

/// Lazily-initialized shared PostgreSQL.
static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    if let Ok(url) = std::env::var("CONDUCTOR_TEST_PG_URL") {
        return SharedPg {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("17")
        .start()
        .await
        .expect("failed to start PostgreSQL container");

    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    let base_url = format!("postgresql://postgres:postgres@{host}:{port}");

    SharedPg {
        base_url,
        _container: Some(container),
    }
}

/// Base URL for the shared PostgreSQL (server root, no database name).
pub async fn pg_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, db_name)`. Call [`drop_test_db`] with the returned
/// `db_name` when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let base_url = pg_url().await;

    let maint_url = format!("{base_url}/postgres");
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database");

    let db_name = format!("conductor_test_{}", Uuid::new_v4().simple());
    let stmt = format!("CREATE DATABASE {db_name}");
    maint_pool
        .execute(stmt.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create temp database {db_name}: {e}"));
    maint_pool.close().await;

    let temp_url = format!("{base_url}/{db_name}");
    let temp_pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&temp_url)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to temp database {db_name}: {e}"));

    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (temp_pool, db_name)
}

/// Drop a temporary database.
///
/// Terminates existing connections and drops the database. Safe to call
/// even if the database was already dropped.
pub async fn drop_test_db(db_name: &str) {
    let base_url = pg_url().await;
    let maint_url = format!("{base_url}/postgres");

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database for cleanup");

    let terminate = format!(
        "SELECT pg_terminate_backend(pid) \
         FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint_pool.execute(terminate.as_str()).await;

    let stmt = format!("DROP DATABASE IF EXISTS {db_name}");
    let _ = maint_pool.execute(stmt.as_str()).await;
    maint_pool.close().await;
}

// ---------------------------------------------------------------------------
// Mock agent pod
// ---------------------------------------------------------------------------

/// A command received by the mock pod: `(command, body)`.
pub type ReceivedCommand = (String, serde_json::Value);

#[derive(Clone)]
struct PodState {
    commands: Arc<Mutex<Vec<ReceivedCommand>>>,
    failing: Arc<AtomicBool>,
}

/// A fake agent pod listening on an ephemeral local port.
///
/// Accepts `POST /run`, `/cancel`, `/resume`, `/approve`, records every
/// received body, and can be flipped into a failing mode that answers 500.
pub struct MockAgentPod {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<ReceivedCommand>>>,
    failing: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockAgentPod {
    /// Bind to `127.0.0.1:0` and start serving.
    pub async fn start() -> Self {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(AtomicBool::new(false));
        let state = PodState {
            commands: commands.clone(),
            failing: failing.clone(),
        };

        let app = Router::new()
            .route("/{command}", post(receive_command))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock agent pod");
        let addr = listener.local_addr().expect("mock pod has no local addr");

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            commands,
            failing,
            handle,
        }
    }

    /// Hostname the orchestrator should register for this pod.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Port the orchestrator should register for this pod.
    pub fn port(&self) -> i32 {
        i32::from(self.addr.port())
    }

    /// Make every subsequent request fail with HTTP 500 (or recover).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of the commands received so far.
    pub async fn received(&self) -> Vec<ReceivedCommand> {
        self.commands.lock().await.clone()
    }

    /// Wait until at least `n` commands have arrived, up to ~2 seconds.
    pub async fn wait_for_commands(&self, n: usize) -> Vec<ReceivedCommand> {
        for _ in 0..100 {
            let received = self.commands.lock().await.clone();
            if received.len() >= n {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.commands.lock().await.clone()
    }
}

impl Drop for MockAgentPod {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn receive_command(
    State(state): State<PodState>,
    Path(command): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    if state.failing.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "mock pod failure" })),
        );
    }
    state.commands.lock().await.push((command, body));
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}
