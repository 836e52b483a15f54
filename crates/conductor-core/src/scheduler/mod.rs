//! The background scheduler: the only component allowed to run periodic
//! work.
//!
//! Three loops with an explicit start/stop lifecycle: the dispatcher tick
//! (plus eager kicks after job creation or an agent turning ready), the
//! stuck-work detector, and the hourly statistics rollup. A tick that is
//! due while its predecessor still runs is skipped and counted; a task
//! that fails repeatedly is paused before it can busy-loop on a broken
//! store.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::queries::stats;

use crate::client::AgentClient;
use crate::detector::StuckWorkDetector;
use crate::dispatch::Dispatcher;
use crate::settings::Settings;

/// Consecutive failures after which a task loop pauses.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// How long a failing task loop pauses.
const FAILURE_PAUSE: Duration = Duration::from_secs(60);

/// Observability counters for one periodic task.
#[derive(Debug, Default)]
pub struct TaskCounters {
    pub runs: AtomicU64,
    pub skipped: AtomicU64,
    pub errors: AtomicU64,
}

/// Counters for all three periodic tasks.
#[derive(Debug, Default)]
pub struct SchedulerCounters {
    pub dispatch: TaskCounters,
    pub detector: TaskCounters,
    pub rollup: TaskCounters,
}

/// Handle to a started scheduler.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    /// Wakes the dispatch loop ahead of its cadence. Fired after job
    /// creation and after an agent turns ready.
    pub dispatch_kick: Arc<Notify>,
    pub counters: Arc<SchedulerCounters>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop all loops and wait for them to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Start the scheduler loops.
pub fn start(pool: PgPool, settings: Arc<Settings>, client: Arc<AgentClient>) -> SchedulerHandle {
    let cancel = CancellationToken::new();
    let dispatch_kick = Arc::new(Notify::new());
    let counters = Arc::new(SchedulerCounters::default());

    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        client,
        Arc::clone(&settings),
    ));
    let detector = Arc::new(StuckWorkDetector::new(pool.clone(), Arc::clone(&settings)));

    let mut tasks = Vec::new();

    {
        let dispatcher = Arc::clone(&dispatcher);
        tasks.push(tokio::spawn(run_periodic(
            "dispatch",
            settings.dispatch_interval,
            cancel.clone(),
            Arc::clone(&counters),
            |c| &c.dispatch,
            Some(Arc::clone(&dispatch_kick)),
            move || {
                let dispatcher = Arc::clone(&dispatcher);
                async move {
                    dispatcher.tick().await?;
                    Ok(())
                }
            },
        )));
    }

    {
        let detector = Arc::clone(&detector);
        tasks.push(tokio::spawn(run_periodic(
            "detector",
            settings.detector_interval,
            cancel.clone(),
            Arc::clone(&counters),
            |c| &c.detector,
            None,
            move || {
                let detector = Arc::clone(&detector);
                async move {
                    detector.run_pass().await?;
                    Ok(())
                }
            },
        )));
    }

    {
        let pool = pool.clone();
        tasks.push(tokio::spawn(run_periodic(
            "rollup",
            settings.rollup_interval,
            cancel.clone(),
            Arc::clone(&counters),
            |c| &c.rollup,
            None,
            move || {
                let pool = pool.clone();
                async move {
                    stats::upsert_daily_statistics(&pool).await?;
                    Ok(())
                }
            },
        )));
    }

    SchedulerHandle {
        cancel,
        dispatch_kick,
        counters,
        tasks,
    }
}

/// One periodic loop: wait for the cadence (or a kick), suppress
/// overlapping runs, pause after repeated failures.
#[allow(clippy::too_many_arguments)]
async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    counters: Arc<SchedulerCounters>,
    select_counters: fn(&SchedulerCounters) -> &TaskCounters,
    kick: Option<Arc<Notify>>,
    task: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let in_flight = Arc::new(AtomicBool::new(false));
    let consecutive_failures = Arc::new(AtomicU32::new(0));

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of tokio's interval fires immediately; consume it so
    // a fresh start does not race the caller's own setup.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = kicked(kick.as_deref()) => {}
        }

        if consecutive_failures.load(Ordering::SeqCst) >= MAX_CONSECUTIVE_FAILURES {
            tracing::warn!(task = name, pause_secs = FAILURE_PAUSE.as_secs(),
                "task failing repeatedly, pausing");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(FAILURE_PAUSE) => {}
            }
            consecutive_failures.store(0, Ordering::SeqCst);
        }

        if in_flight.swap(true, Ordering::SeqCst) {
            select_counters(&counters).skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(task = name, "previous run still in flight, skipping tick");
            continue;
        }

        select_counters(&counters).runs.fetch_add(1, Ordering::Relaxed);
        let fut = task();
        let in_flight = Arc::clone(&in_flight);
        let counters = Arc::clone(&counters);
        let consecutive_failures = Arc::clone(&consecutive_failures);
        tokio::spawn(async move {
            match fut.await {
                Ok(()) => {
                    consecutive_failures.store(0, Ordering::SeqCst);
                }
                Err(err) => {
                    // Background tasks never propagate; log with a
                    // correlation id and count.
                    let correlation_id = Uuid::new_v4();
                    tracing::error!(task = name, %correlation_id, error = %format!("{err:#}"),
                        "background task failed");
                    select_counters(&counters).errors.fetch_add(1, Ordering::Relaxed);
                    consecutive_failures.fetch_add(1, Ordering::SeqCst);
                }
            }
            in_flight.store(false, Ordering::SeqCst);
        });
    }

    tracing::info!(task = name, "scheduler loop stopped");
}

/// Resolve when the kick fires; never resolves for tasks without one.
async fn kicked(kick: Option<&Notify>) {
    match kick {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}
