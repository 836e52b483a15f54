//! Outbound HTTP client for pushing commands to agent pods.
//!
//! Commands are plain JSON POSTs against the pod's callback endpoint.
//! A non-2xx answer counts as a failure. A command that was acknowledged
//! (2xx) is never retried; when a later store update fails, the store is
//! reconciled on the agent's next heartbeat instead.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use uuid::Uuid;

use conductor_db::models::{Agent, Job};

/// Failure to deliver a command to an agent pod, after retries.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The pod answered, but not with a 2xx.
    #[error("agent rejected {command} with HTTP {status}")]
    Rejected {
        command: &'static str,
        status: reqwest::StatusCode,
    },
    /// The pod could not be reached at all.
    #[error("agent unreachable for {command}")]
    Unreachable {
        command: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Delay sequence between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// `base * 2^n`, with a +-`jitter` fraction applied.
    Jittered { base: Duration, jitter: f64 },
    /// Fixed schedule; the last entry repeats when retries outnumber it.
    Fixed(Vec<Duration>),
}

/// Retry behavior for one command delivery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Default command policy: 3 retries, 250 ms doubling, +-20% jitter.
    pub fn standard() -> Self {
        Self {
            retries: 3,
            backoff: Backoff::Jittered {
                base: Duration::from_millis(250),
                jitter: 0.2,
            },
        }
    }

    /// Start-command policy: 3 retries on a fixed 1 s / 2 s schedule.
    pub fn start_command() -> Self {
        Self {
            retries: 3,
            backoff: Backoff::Fixed(vec![Duration::from_secs(1), Duration::from_secs(2)]),
        }
    }

    /// Delay before retry number `n` (0-based).
    fn delay(&self, n: u32) -> Duration {
        match &self.backoff {
            Backoff::Jittered { base, jitter } => {
                let exp = base.saturating_mul(2u32.saturating_pow(n));
                let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
                exp.mul_f64(factor)
            }
            Backoff::Fixed(schedule) => match schedule.get(n as usize).or(schedule.last()) {
                Some(d) => *d,
                None => Duration::ZERO,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct RunCommand<'a> {
    job_id: Uuid,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    upload_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct JobCommand<'a> {
    job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<&'a str>,
}

/// HTTP client for agent pod commands.
pub struct AgentClient {
    http: reqwest::Client,
}

impl AgentClient {
    /// Build a client with the standard pod timeouts (2 s connect,
    /// 10 s per request).
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http })
    }

    /// Push a job to a pod: `POST {base}/run`.
    pub async fn start(&self, agent: &Agent, job: &Job) -> Result<(), ClientError> {
        let body = RunCommand {
            job_id: job.id,
            prompt: &job.description,
            upload_id: job.upload_id,
            instructions: job.instructions.as_deref(),
            context: job.context.as_deref(),
        };
        self.send(agent, "run", &body, &RetryPolicy::start_command())
            .await
    }

    /// Tell a pod to abandon a job: `POST {base}/cancel`.
    pub async fn cancel(&self, agent: &Agent, job_id: Uuid) -> Result<(), ClientError> {
        let body = JobCommand {
            job_id,
            feedback: None,
        };
        self.send(agent, "cancel", &body, &RetryPolicy::standard())
            .await
    }

    /// Resume a frozen job, optionally carrying reviewer feedback:
    /// `POST {base}/resume`.
    pub async fn resume(
        &self,
        agent: &Agent,
        job_id: Uuid,
        feedback: Option<&str>,
    ) -> Result<(), ClientError> {
        let body = JobCommand { job_id, feedback };
        self.send(agent, "resume", &body, &RetryPolicy::standard())
            .await
    }

    /// Approve a frozen job: `POST {base}/approve`.
    pub async fn approve(&self, agent: &Agent, job_id: Uuid) -> Result<(), ClientError> {
        let body = JobCommand {
            job_id,
            feedback: None,
        };
        self.send(agent, "approve", &body, &RetryPolicy::standard())
            .await
    }

    async fn send<B: Serialize>(
        &self,
        agent: &Agent,
        command: &'static str,
        body: &B,
        policy: &RetryPolicy,
    ) -> Result<(), ClientError> {
        let url = format!("{}/{command}", agent.base_url());
        let mut attempt = 0;
        loop {
            let result = self.http.post(&url).json(body).send().await;
            let error = match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => ClientError::Rejected {
                    command,
                    status: resp.status(),
                },
                Err(source) => ClientError::Unreachable { command, source },
            };

            if attempt >= policy.retries {
                return Err(error);
            }
            tracing::debug!(agent_id = %agent.id, %url, attempt, error = %error,
                "agent command attempt failed, backing off");
            tokio::time::sleep(policy.delay(attempt)).await;
            attempt += 1;
        }
    }
}
