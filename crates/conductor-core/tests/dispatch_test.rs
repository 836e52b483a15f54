//! Integration tests for the dispatcher: matching, start delivery,
//! rollback on undeliverable starts, and placement order.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use conductor_core::client::AgentClient;
use conductor_core::dispatch::Dispatcher;
use conductor_core::registry::{AgentRegistry, Registration};
use conductor_core::settings::Settings;
use conductor_core::state::actions::{self, CreateJob};
use conductor_db::models::{Agent, AgentStatus, JobStatus};
use conductor_db::queries::dispatch::claim_created_jobs;
use conductor_db::queries::jobs as job_db;
use conductor_test_utils::{MockAgentPod, create_test_db, drop_test_db};

async fn ready_agent(pool: &PgPool, pod: &MockAgentPod, config: &str) -> Agent {
    let agent = AgentRegistry::register(
        pool,
        Registration {
            hostname: format!("pod-{}", Uuid::new_v4().simple()),
            pod_ip: pod.host(),
            pod_port: pod.port(),
            config_name: config.to_owned(),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .expect("register should succeed");
    AgentRegistry::mark_ready(pool, agent.id)
        .await
        .expect("mark_ready should succeed")
}

async fn create_job(pool: &PgPool, description: &str, config: &str) -> Uuid {
    actions::create_job(
        pool,
        &Settings::default(),
        CreateJob {
            description: description.to_owned(),
            upload_id: None,
            context: None,
            instructions: None,
            config_name: Some(config.to_owned()),
        },
    )
    .await
    .expect("create should succeed")
    .id
}

fn dispatcher(pool: &PgPool) -> Dispatcher {
    Dispatcher::new(
        pool.clone(),
        Arc::new(AgentClient::new().expect("client should build")),
        Arc::new(Settings::default()),
    )
}

#[tokio::test]
async fn happy_path_dispatch_delivers_the_run_command() {
    let (pool, db_name) = create_test_db().await;
    let pod = MockAgentPod::start().await;

    let agent = ready_agent(&pool, &pod, "writer").await;
    let job_id = create_job(&pool, "write poem", "writer").await;

    let outcome = dispatcher(&pool).tick().await.expect("tick should succeed");
    assert_eq!(outcome.pairs.len(), 1);
    for delivery in outcome.deliveries {
        delivery.await.expect("delivery task should not panic");
    }

    let job = job_db::get_job(&pool, job_id)
        .await
        .expect("get should succeed")
        .expect("job should exist");
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.assigned_agent_id, Some(agent.id));

    let agent = AgentRegistry::require(&pool, agent.id)
        .await
        .expect("agent should exist");
    assert_eq!(agent.status, AgentStatus::Working);
    assert_eq!(agent.current_job_id, Some(job_id));

    let received = pod.received().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "run");
    assert_eq!(
        received[0].1.get("job_id").and_then(|v| v.as_str()),
        Some(job_id.to_string().as_str())
    );
    assert_eq!(
        received[0].1.get("prompt").and_then(|v| v.as_str()),
        Some("write poem")
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn incompatible_config_names_never_match() {
    let (pool, db_name) = create_test_db().await;
    let pod = MockAgentPod::start().await;

    ready_agent(&pool, &pod, "coder").await;
    let job_id = create_job(&pool, "write poem", "writer").await;

    let outcome = dispatcher(&pool).tick().await.expect("tick should succeed");
    assert!(outcome.pairs.is_empty());

    let job = job_db::get_job(&pool, job_id)
        .await
        .expect("get should succeed")
        .expect("job should exist");
    assert_eq!(job.status, JobStatus::Created, "the job keeps waiting");
    assert!(pod.received().await.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn busy_agents_are_never_double_booked() {
    let (pool, db_name) = create_test_db().await;
    let pod = MockAgentPod::start().await;

    ready_agent(&pool, &pod, "writer").await;
    create_job(&pool, "first", "writer").await;
    let second = create_job(&pool, "second", "writer").await;

    let outcome = dispatcher(&pool).tick().await.expect("tick should succeed");
    assert_eq!(outcome.pairs.len(), 1, "one agent takes one job");
    for delivery in outcome.deliveries {
        delivery.await.expect("delivery task should not panic");
    }

    let outcome = dispatcher(&pool).tick().await.expect("tick should succeed");
    assert!(outcome.pairs.is_empty(), "the working agent is not reused");

    let job = job_db::get_job(&pool, second)
        .await
        .expect("get should succeed")
        .expect("job should exist");
    assert_eq!(job.status, JobStatus::Created);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn undeliverable_start_rolls_the_claim_back() {
    let (pool, db_name) = create_test_db().await;
    let pod = MockAgentPod::start().await;
    pod.set_failing(true);

    let agent = ready_agent(&pool, &pod, "writer").await;
    let job_id = create_job(&pool, "doomed start", "writer").await;

    let outcome = dispatcher(&pool).tick().await.expect("tick should succeed");
    assert_eq!(outcome.pairs.len(), 1);
    for delivery in outcome.deliveries {
        delivery.await.expect("delivery task should not panic");
    }

    let job = job_db::get_job(&pool, job_id)
        .await
        .expect("get should succeed")
        .expect("job should exist");
    assert_eq!(job.status, JobStatus::Created, "the claim was rolled back");
    assert!(job.assigned_agent_id.is_none());
    assert_eq!(job.dispatch_attempts, 1);

    let agent = AgentRegistry::require(&pool, agent.id)
        .await
        .expect("agent should exist");
    assert_eq!(agent.status, AgentStatus::Failed);
    assert_eq!(
        agent.metadata.get("last_error").and_then(|v| v.as_str()),
        Some("start_command_failed")
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn exhausted_dispatch_attempts_fail_the_job() {
    let (pool, db_name) = create_test_db().await;
    let pod = MockAgentPod::start().await;
    pod.set_failing(true);

    ready_agent(&pool, &pod, "writer").await;
    let job_id = create_job(&pool, "unplaceable", "writer").await;

    // Four failed deliveries already happened.
    sqlx::query("UPDATE jobs SET dispatch_attempts = 4 WHERE id = $1")
        .bind(job_id)
        .execute(&pool)
        .await
        .expect("seed should succeed");

    let outcome = dispatcher(&pool).tick().await.expect("tick should succeed");
    assert_eq!(outcome.pairs.len(), 1);
    for delivery in outcome.deliveries {
        delivery.await.expect("delivery task should not panic");
    }

    let job = job_db::get_job(&pool, job_id)
        .await
        .expect("get should succeed")
        .expect("job should exist");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.dispatch_attempts, 5);
    assert_eq!(
        job.error_details
            .as_ref()
            .and_then(|d| d.get("reason"))
            .and_then(|v| v.as_str()),
        Some("no_compatible_agent")
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn freshest_heartbeat_wins_the_assignment() {
    let (pool, db_name) = create_test_db().await;
    let pod = MockAgentPod::start().await;

    let stale = ready_agent(&pool, &pod, "writer").await;
    let fresh = ready_agent(&pool, &pod, "writer").await;
    sqlx::query("UPDATE agents SET last_heartbeat = NOW() - INTERVAL '40 seconds' WHERE id = $1")
        .bind(stale.id)
        .execute(&pool)
        .await
        .expect("backdate should succeed");

    create_job(&pool, "affinity", "writer").await;

    let pairs = claim_created_jobs(&pool, 16)
        .await
        .expect("claim should succeed");
    assert_eq!(pairs.len(), 1);
    assert_eq!(
        pairs[0].agent.id, fresh.id,
        "the most recently alive pod is preferred"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn oldest_job_is_placed_first() {
    let (pool, db_name) = create_test_db().await;
    let pod = MockAgentPod::start().await;

    ready_agent(&pool, &pod, "writer").await;
    let newer = create_job(&pool, "newer", "writer").await;
    let older = create_job(&pool, "older", "writer").await;
    sqlx::query("UPDATE jobs SET created_at = NOW() - INTERVAL '1 minute' WHERE id = $1")
        .bind(older)
        .execute(&pool)
        .await
        .expect("backdate should succeed");

    let pairs = claim_created_jobs(&pool, 16)
        .await
        .expect("claim should succeed");
    assert_eq!(pairs.len(), 1, "a single agent places a single job");
    assert_eq!(pairs[0].job.id, older);

    let skipped = job_db::get_job(&pool, newer)
        .await
        .expect("get should succeed")
        .expect("job should exist");
    assert_eq!(skipped.status, JobStatus::Created);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn redispatch_clears_the_orphan_stamp() {
    let (pool, db_name) = create_test_db().await;
    let pod = MockAgentPod::start().await;

    let first = ready_agent(&pool, &pod, "writer").await;
    let job_id = create_job(&pool, "orphan then rescue", "writer").await;
    let pairs = claim_created_jobs(&pool, 16)
        .await
        .expect("claim should succeed");
    assert_eq!(pairs.len(), 1);

    let rows = job_db::orphan_job(&pool, job_id, first.id)
        .await
        .expect("orphan should succeed");
    assert_eq!(rows, 1);

    ready_agent(&pool, &pod, "writer").await;
    let pairs = claim_created_jobs(&pool, 16)
        .await
        .expect("claim should succeed");
    assert_eq!(pairs.len(), 1);
    assert!(
        pairs[0].job.orphaned_at.is_none(),
        "a re-placed job leaves its grace window"
    );
    assert_eq!(pairs[0].job.status, JobStatus::Processing);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_respects_the_batch_size() {
    let (pool, db_name) = create_test_db().await;
    let pod = MockAgentPod::start().await;

    for i in 0..4 {
        ready_agent(&pool, &pod, "writer").await;
        create_job(&pool, &format!("job {i}"), "writer").await;
    }

    let pairs = claim_created_jobs(&pool, 2)
        .await
        .expect("claim should succeed");
    assert_eq!(pairs.len(), 2, "the batch limit bounds one pass");

    let pairs = claim_created_jobs(&pool, 2)
        .await
        .expect("claim should succeed");
    assert_eq!(pairs.len(), 2, "the rest goes on the next pass");

    pool.close().await;
    drop_test_db(&db_name).await;
}
