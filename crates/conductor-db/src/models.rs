use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Processing,
    PendingReview,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether no transition out of this state is permitted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::PendingReview => "pending_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "processing" => Ok(Self::Processing),
            "pending_review" => Ok(Self::PendingReview),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// Per-role progress inside the agent (creator and validator). Informational
/// to the control plane; never drives dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RoleStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for RoleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RoleStatus {
    type Err = RoleStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(RoleStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RoleStatus`] string.
#[derive(Debug, Clone)]
pub struct RoleStatusParseError(pub String);

impl fmt::Display for RoleStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid role status: {:?}", self.0)
    }
}

impl std::error::Error for RoleStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a registered agent pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Booting,
    Ready,
    Working,
    Completed,
    Failed,
    Offline,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Booting => "booting",
            Self::Ready => "ready",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "booting" => Ok(Self::Booting),
            "ready" => Ok(Self::Ready),
            "working" => Ok(Self::Working),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "offline" => Ok(Self::Offline),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a requirement produced by an agent during a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    Pending,
    Validating,
    Integrated,
    Rejected,
    Failed,
}

impl RequirementStatus {
    /// Whether this requirement will not change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Integrated | Self::Rejected | Self::Failed)
    }
}

impl fmt::Display for RequirementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Integrated => "integrated",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RequirementStatus {
    type Err = RequirementStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "validating" => Ok(Self::Validating),
            "integrated" => Ok(Self::Integrated),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            other => Err(RequirementStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RequirementStatus`] string.
#[derive(Debug, Clone)]
pub struct RequirementStatusParseError(pub String);

impl fmt::Display for RequirementStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid requirement status: {:?}", self.0)
    }
}

impl std::error::Error for RequirementStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A job -- a unit of work submitted by a user.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub description: String,
    pub upload_id: Option<Uuid>,
    pub context: Option<String>,
    pub instructions: Option<String>,
    /// Names the agent variant required; dispatch requires equality.
    pub config_name: String,
    pub assigned_agent_id: Option<Uuid>,
    pub status: JobStatus,
    pub creator_status: RoleStatus,
    pub validator_status: RoleStatus,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    /// Checkpoint payload stored when the agent freezes the job for review.
    pub frozen_job_data: Option<serde_json::Value>,
    pub dispatch_attempts: i32,
    pub total_tokens: i64,
    pub request_count: i32,
    /// Set when the assigned agent went offline; cleared on reassignment.
    pub orphaned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A registered agent pod.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub hostname: String,
    pub pod_ip: String,
    pub pod_port: i32,
    pub config_name: String,
    pub status: AgentStatus,
    pub current_job_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    /// Base URL of the pod's command endpoint.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.pod_ip, self.pod_port)
    }
}

/// An artifact produced by an agent during a job. Stored for observability;
/// the control plane only ever counts these by status.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Requirement {
    pub id: Uuid,
    pub job_id: Uuid,
    pub description: String,
    pub status: RequirementStatus,
    pub graph_node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A source document discovered by the citation subsystem. Opaque here.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Source {
    pub id: Uuid,
    pub job_id: Uuid,
    pub title: String,
    pub url: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A citation linking a job artifact to a source. Opaque here.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Citation {
    pub id: Uuid,
    pub job_id: Uuid,
    pub source_id: Uuid,
    pub snippet: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An immutable named group of files attached to a job at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Upload {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A single file descriptor within an upload bundle.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UploadFile {
    pub upload_id: Uuid,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
}

/// An append-only audit record for a job.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub job_id: Uuid,
    pub actor: String,
    pub action: String,
    pub detail: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// One day of rolled-up job statistics, refreshed hourly.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DailyStatistics {
    pub day: chrono::NaiveDate,
    pub jobs_created: i64,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub jobs_cancelled: i64,
    pub total_tokens: i64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_display_roundtrip() {
        let variants = [
            JobStatus::Created,
            JobStatus::Processing,
            JobStatus::PendingReview,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: JobStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn job_status_invalid() {
        let result = "bogus".parse::<JobStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Created.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::PendingReview.is_terminal());
    }

    #[test]
    fn role_status_display_roundtrip() {
        let variants = [
            RoleStatus::Pending,
            RoleStatus::Processing,
            RoleStatus::Completed,
            RoleStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RoleStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_status_display_roundtrip() {
        let variants = [
            AgentStatus::Booting,
            AgentStatus::Ready,
            AgentStatus::Working,
            AgentStatus::Completed,
            AgentStatus::Failed,
            AgentStatus::Offline,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_status_invalid() {
        let result = "asleep".parse::<AgentStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn requirement_status_display_roundtrip() {
        let variants = [
            RequirementStatus::Pending,
            RequirementStatus::Validating,
            RequirementStatus::Integrated,
            RequirementStatus::Rejected,
            RequirementStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RequirementStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn requirement_terminal_states() {
        assert!(RequirementStatus::Integrated.is_terminal());
        assert!(RequirementStatus::Rejected.is_terminal());
        assert!(RequirementStatus::Failed.is_terminal());
        assert!(!RequirementStatus::Pending.is_terminal());
        assert!(!RequirementStatus::Validating.is_terminal());
    }

    #[test]
    fn agent_base_url() {
        let agent = Agent {
            id: Uuid::new_v4(),
            hostname: "pod-7".to_owned(),
            pod_ip: "10.0.3.17".to_owned(),
            pod_port: 8200,
            config_name: "writer".to_owned(),
            status: AgentStatus::Ready,
            current_job_id: None,
            metadata: serde_json::json!({}),
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        };
        assert_eq!(agent.base_url(), "http://10.0.3.17:8200");
    }
}
