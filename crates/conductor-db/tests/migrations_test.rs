//! Schema smoke tests: migrations apply cleanly, re-apply as a no-op, and
//! the store-level constraints hold the line on their own.

use sqlx::PgPool;

use conductor_db::pool;
use conductor_test_utils::{create_test_db, drop_test_db};

async fn table_names(pool: &PgPool) -> Vec<String> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
    )
    .fetch_all(pool)
    .await
    .expect("should list tables");
    rows.into_iter().map(|(name,)| name).collect()
}

#[tokio::test]
async fn migrations_create_all_tables() {
    let (pool, db_name) = create_test_db().await;

    let tables = table_names(&pool).await;
    for expected in [
        "agents",
        "audit_entries",
        "citations",
        "daily_statistics",
        "jobs",
        "requirements",
        "sources",
        "upload_files",
        "uploads",
    ] {
        assert!(
            tables.iter().any(|t| t == expected),
            "missing table {expected}, got: {tables:?}"
        );
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, db_name) = create_test_db().await;

    // create_test_db already ran them once; a second run must be a no-op.
    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("re-running migrations should succeed");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn job_status_check_constraint_rejects_unknown_values() {
    let (pool, db_name) = create_test_db().await;

    let result = sqlx::query(
        "INSERT INTO jobs (description, config_name, status) VALUES ('x', 'writer', 'sleeping')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err(), "unknown status should be rejected");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn job_assignment_and_status_are_coupled() {
    let (pool, db_name) = create_test_db().await;

    // A created job must not carry an assignment.
    let agent_id: (uuid::Uuid,) = sqlx::query_as(
        "INSERT INTO agents (hostname, pod_ip, pod_port, config_name) \
         VALUES ('h', '10.0.0.1', 8200, 'writer') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .expect("agent insert should succeed");

    let result = sqlx::query(
        "INSERT INTO jobs (description, config_name, assigned_agent_id) \
         VALUES ('x', 'writer', $1)",
    )
    .bind(agent_id.0)
    .execute(&pool)
    .await;
    assert!(
        result.is_err(),
        "created job with an assignment should be rejected"
    );

    // A processing job must carry one.
    let result = sqlx::query(
        "INSERT INTO jobs (description, config_name, status) VALUES ('x', 'writer', 'processing')",
    )
    .execute(&pool)
    .await;
    assert!(
        result.is_err(),
        "processing job without an assignment should be rejected"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn agent_job_link_requires_working_family_status() {
    let (pool, db_name) = create_test_db().await;

    let job_id: (uuid::Uuid,) = sqlx::query_as(
        "INSERT INTO jobs (description, config_name) VALUES ('x', 'writer') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .expect("job insert should succeed");

    let result = sqlx::query(
        "INSERT INTO agents (hostname, pod_ip, pod_port, config_name, status, current_job_id) \
         VALUES ('h', '10.0.0.2', 8200, 'writer', 'ready', $1)",
    )
    .bind(job_id.0)
    .execute(&pool)
    .await;
    assert!(
        result.is_err(),
        "a ready agent with a job link should be rejected"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn terminal_jobs_need_completed_at() {
    let (pool, db_name) = create_test_db().await;

    let result = sqlx::query(
        "INSERT INTO jobs (description, config_name, status) VALUES ('x', 'writer', 'cancelled')",
    )
    .execute(&pool)
    .await;
    assert!(
        result.is_err(),
        "terminal status without completed_at should be rejected"
    );

    let result = sqlx::query(
        "INSERT INTO jobs (description, config_name, status, completed_at) \
         VALUES ('x', 'writer', 'cancelled', NOW())",
    )
    .execute(&pool)
    .await;
    assert!(result.is_ok(), "terminal status with completed_at is fine");

    pool.close().await;
    drop_test_db(&db_name).await;
}
