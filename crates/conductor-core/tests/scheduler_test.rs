//! End-to-end scheduler test: the periodic loops place work, detect
//! nothing when healthy, and roll statistics up.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use conductor_core::client::AgentClient;
use conductor_core::registry::{AgentRegistry, Registration};
use conductor_core::scheduler;
use conductor_core::settings::Settings;
use conductor_core::state::actions::{self, CreateJob};
use conductor_db::models::JobStatus;
use conductor_db::queries::jobs as job_db;
use conductor_test_utils::{MockAgentPod, create_test_db, drop_test_db};

fn fast_settings() -> Settings {
    Settings {
        dispatch_interval: Duration::from_millis(100),
        detector_interval: Duration::from_millis(100),
        rollup_interval: Duration::from_millis(200),
        ..Settings::default()
    }
}

#[tokio::test]
async fn scheduler_places_jobs_and_rolls_up() {
    let (pool, db_name) = create_test_db().await;
    let pod = MockAgentPod::start().await;
    let settings = Arc::new(fast_settings());

    let handle = scheduler::start(
        pool.clone(),
        Arc::clone(&settings),
        Arc::new(AgentClient::new().expect("client should build")),
    );

    let agent = AgentRegistry::register(
        &pool,
        Registration {
            hostname: format!("pod-{}", Uuid::new_v4().simple()),
            pod_ip: pod.host(),
            pod_port: pod.port(),
            config_name: "writer".to_owned(),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .expect("register should succeed");
    AgentRegistry::mark_ready(&pool, agent.id)
        .await
        .expect("mark_ready should succeed");

    let job = actions::create_job(
        &pool,
        &settings,
        CreateJob {
            description: "scheduled poem".to_owned(),
            upload_id: None,
            context: None,
            instructions: None,
            config_name: Some("writer".to_owned()),
        },
    )
    .await
    .expect("create should succeed");
    handle.dispatch_kick.notify_one();

    // Wait for a tick to place the job and deliver the start command.
    let mut placed = false;
    for _ in 0..50 {
        let current = job_db::get_job(&pool, job.id)
            .await
            .expect("get should succeed")
            .expect("job should exist");
        if current.status == JobStatus::Processing {
            placed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(placed, "the scheduler should have placed the job");

    let received = pod.wait_for_commands(1).await;
    assert_eq!(received[0].0, "run");

    // The rollup loop should have produced today's row by now.
    let mut rolled_up = false;
    for _ in 0..50 {
        let rows = conductor_db::queries::stats::list_daily_statistics(&pool, 5)
            .await
            .expect("list should succeed");
        if rows.iter().any(|r| r.jobs_created >= 1) {
            rolled_up = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(rolled_up, "the rollup loop should have produced a row");

    let runs = handle
        .counters
        .dispatch
        .runs
        .load(std::sync::atomic::Ordering::Relaxed);
    assert!(runs >= 1, "the dispatch loop should have run");

    handle.shutdown().await;

    pool.close().await;
    drop_test_db(&db_name).await;
}
