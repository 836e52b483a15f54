//! Runtime tunables, read from the environment at startup.
//!
//! Every knob has a default suitable for a single-node deployment; the
//! env variable names mirror the field names with a `CONDUCTOR_` prefix.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Orchestrator settings resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Cadence of the dispatcher tick.
    pub dispatch_interval: Duration,
    /// Maximum `created` jobs considered per dispatch tick.
    pub dispatch_batch_size: i64,
    /// Failed start-command deliveries before a job is given up on.
    pub max_dispatch_attempts: i32,
    /// Config name assumed for jobs submitted without one.
    pub default_config_name: String,
    /// Cadence of the stuck-work detector.
    pub detector_interval: Duration,
    /// Heartbeat gap after which an agent is considered offline.
    pub liveness_threshold: Duration,
    /// How long an orphaned job waits for re-dispatch before failing.
    pub recovery_grace_window: Duration,
    /// `updated_at` stall after which a job lands in the stuck report.
    pub progress_threshold: Duration,
    /// `updated_at` stall after which a `processing` job is failed.
    pub escalation_threshold: Duration,
    /// Cadence of the daily-statistics rollup.
    pub rollup_interval: Duration,
    /// Directory where upload bundles are materialized.
    pub upload_root: PathBuf,
    /// Maximum total bytes accepted per upload bundle.
    pub max_upload_bytes: u64,
    /// Deadline applied to every inbound API request.
    pub request_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_secs(2),
            dispatch_batch_size: 16,
            max_dispatch_attempts: 5,
            default_config_name: "general".to_owned(),
            detector_interval: Duration::from_secs(30),
            liveness_threshold: Duration::from_secs(90),
            recovery_grace_window: Duration::from_secs(120),
            progress_threshold: Duration::from_secs(600),
            escalation_threshold: Duration::from_secs(3600),
            rollup_interval: Duration::from_secs(3600),
            upload_root: PathBuf::from("uploads"),
            max_upload_bytes: 256 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Build settings from the environment, falling back to defaults.
    ///
    /// A present-but-unparseable variable is a configuration error, not a
    /// silent fallback.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            dispatch_interval: secs_var("CONDUCTOR_DISPATCH_INTERVAL_SECS", d.dispatch_interval)?,
            dispatch_batch_size: parsed_var("CONDUCTOR_DISPATCH_BATCH_SIZE", d.dispatch_batch_size)?,
            max_dispatch_attempts: parsed_var(
                "CONDUCTOR_MAX_DISPATCH_ATTEMPTS",
                d.max_dispatch_attempts,
            )?,
            default_config_name: env::var("CONDUCTOR_DEFAULT_CONFIG_NAME")
                .unwrap_or(d.default_config_name),
            detector_interval: secs_var("CONDUCTOR_DETECTOR_INTERVAL_SECS", d.detector_interval)?,
            liveness_threshold: secs_var(
                "CONDUCTOR_LIVENESS_THRESHOLD_SECS",
                d.liveness_threshold,
            )?,
            recovery_grace_window: secs_var(
                "CONDUCTOR_RECOVERY_GRACE_SECS",
                d.recovery_grace_window,
            )?,
            progress_threshold: secs_var(
                "CONDUCTOR_PROGRESS_THRESHOLD_SECS",
                d.progress_threshold,
            )?,
            escalation_threshold: secs_var(
                "CONDUCTOR_ESCALATION_THRESHOLD_SECS",
                d.escalation_threshold,
            )?,
            rollup_interval: secs_var("CONDUCTOR_ROLLUP_INTERVAL_SECS", d.rollup_interval)?,
            upload_root: env::var("CONDUCTOR_UPLOAD_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.upload_root),
            max_upload_bytes: parsed_var("CONDUCTOR_MAX_UPLOAD_BYTES", d.max_upload_bytes)?,
            request_timeout: secs_var("CONDUCTOR_REQUEST_TIMEOUT_SECS", d.request_timeout)?,
        })
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(parsed_var(
        name,
        default.as_secs(),
    )?))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
