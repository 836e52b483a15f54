//! Job state machine transitions.
//!
//! Validates and executes job status transitions, enforcing the allowed
//! transition graph and optimistic locking. The dispatcher's
//! `created -> processing` edge and the rollback edges back to `created`
//! are executed by their own compound queries; everything else funnels
//! through [`JobStateMachine::transition`].

pub mod actions;

use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::JobStatus;
use conductor_db::queries::jobs as db;
use conductor_db::{StoreError, StoreResult};

/// The job state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// created        -> processing      (dispatch claim)
/// created        -> cancelled
/// created        -> failed          (detector escalation)
/// processing     -> pending_review
/// processing     -> completed
/// processing     -> failed
/// processing     -> cancelled
/// pending_review -> processing      (resume)
/// pending_review -> completed       (approve)
/// pending_review -> cancelled
/// pending_review -> failed          (detector escalation)
/// ```
///
/// `completed`, `failed`, and `cancelled` are terminal.
pub struct JobStateMachine;

impl JobStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the state graph.
    pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
        if from.is_terminal() {
            return false;
        }
        // The detector may force any non-terminal job to failed.
        if to == JobStatus::Failed {
            return true;
        }
        matches!(
            (from, to),
            (JobStatus::Created, JobStatus::Processing)
                | (JobStatus::Created, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::PendingReview)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Cancelled)
                | (JobStatus::PendingReview, JobStatus::Processing)
                | (JobStatus::PendingReview, JobStatus::Completed)
                | (JobStatus::PendingReview, JobStatus::Cancelled)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Errors with [`StoreError::ConflictingState`] when the transition is
    /// not a valid edge or the row's current status does not match `from`,
    /// and [`StoreError::NotFound`] when the job does not exist.
    pub async fn transition(
        pool: &PgPool,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        actor: &str,
    ) -> StoreResult<()> {
        if !Self::is_valid_transition(from, to) {
            return Err(StoreError::conflict(format!(
                "invalid state transition: {from} -> {to} for job {job_id}"
            )));
        }

        let rows = db::transition_job_status(pool, job_id, from, to, actor).await?;
        if rows == 0 {
            // Either the job does not exist or the status did not match.
            return match db::get_job(pool, job_id).await? {
                None => Err(StoreError::not_found(format!("job {job_id}"))),
                Some(job) => Err(StoreError::conflict(format!(
                    "job {job_id} has status {}, expected {from}",
                    job.status
                ))),
            };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for to in [
                JobStatus::Created,
                JobStatus::Processing,
                JobStatus::PendingReview,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(
                    !JobStateMachine::is_valid_transition(from, to),
                    "{from} -> {to} should be rejected"
                );
            }
        }
    }

    #[test]
    fn happy_path_edges_are_valid() {
        assert!(JobStateMachine::is_valid_transition(
            JobStatus::Created,
            JobStatus::Processing
        ));
        assert!(JobStateMachine::is_valid_transition(
            JobStatus::Processing,
            JobStatus::PendingReview
        ));
        assert!(JobStateMachine::is_valid_transition(
            JobStatus::PendingReview,
            JobStatus::Processing
        ));
        assert!(JobStateMachine::is_valid_transition(
            JobStatus::PendingReview,
            JobStatus::Completed
        ));
        assert!(JobStateMachine::is_valid_transition(
            JobStatus::Processing,
            JobStatus::Completed
        ));
    }

    #[test]
    fn every_non_terminal_state_can_fail() {
        for from in [
            JobStatus::Created,
            JobStatus::Processing,
            JobStatus::PendingReview,
        ] {
            assert!(JobStateMachine::is_valid_transition(from, JobStatus::Failed));
        }
    }

    #[test]
    fn skipping_review_backwards_is_rejected() {
        assert!(!JobStateMachine::is_valid_transition(
            JobStatus::Created,
            JobStatus::PendingReview
        ));
        assert!(!JobStateMachine::is_valid_transition(
            JobStatus::PendingReview,
            JobStatus::Created
        ));
        assert!(!JobStateMachine::is_valid_transition(
            JobStatus::Completed,
            JobStatus::Processing
        ));
    }
}
