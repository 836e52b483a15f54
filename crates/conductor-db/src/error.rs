//! Error taxonomy for the persistence gateway.
//!
//! Every driver-level failure is converted into one of the kinds below
//! before it leaves this crate. Only [`StoreError::TransientBackend`] is
//! retryable; [`retry_transient`] implements the bounded backoff policy.

use std::future::Future;
use std::time::Duration;

/// A failure surfaced by the persistence gateway.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested transition is not permitted from the current state, or
    /// an optimistic-lock conflict occurred.
    #[error("conflicting state: {0}")]
    ConflictingState(String),

    /// Input failed validation (unknown enum value, missing required field,
    /// violated check or foreign-key constraint).
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Temporary store or network failure; retryable with bounded backoff.
    #[error("transient backend failure")]
    TransientBackend(#[source] sqlx::Error),

    /// The store is not reachable at all (pool closed, never connected).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Unexpected driver failure that maps to none of the other kinds.
    #[error("internal store error")]
    Internal(#[source] sqlx::Error),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::ConflictingState(what.into())
    }

    pub fn constraint(what: impl Into<String>) -> Self {
        Self::ConstraintViolation(what.into())
    }

    /// Whether an internal retry may recover this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBackend(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_owned()),
            sqlx::Error::PoolClosed => Self::Unavailable("connection pool closed".to_owned()),
            sqlx::Error::PoolTimedOut => Self::TransientBackend(err),
            sqlx::Error::Io(_) => Self::TransientBackend(err),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // unique_violation: a concurrent writer got there first.
                Some("23505") => Self::ConflictingState(db.message().to_owned()),
                // Remaining class 23 (integrity): check, FK, not-null.
                Some(code) if code.starts_with("23") => {
                    Self::ConstraintViolation(db.message().to_owned())
                }
                // Class 08 (connection), serialization failure, deadlock.
                Some(code) if code.starts_with("08") => Self::TransientBackend(err),
                Some("40001") | Some("40P01") => Self::TransientBackend(err),
                _ => Self::Internal(err),
            },
            _ => Self::Internal(err),
        }
    }
}

/// Convenience alias used throughout the gateway.
pub type StoreResult<T> = Result<T, StoreError>;

/// Initial backoff delay for transient retries.
const RETRY_INITIAL: Duration = Duration::from_millis(50);
/// Backoff cap.
const RETRY_CAP: Duration = Duration::from_secs(2);
/// Total attempts (first try included).
const RETRY_ATTEMPTS: u32 = 5;

/// Run `op`, retrying on [`StoreError::TransientBackend`] with exponential
/// backoff: 50 ms initial, doubling, capped at 2 s, at most 5 attempts.
/// All other errors propagate on the first occurrence.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut delay = RETRY_INITIAL;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                tracing::warn!(attempt, error = %e, "transient store error, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_CAP);
                attempt += 1;
            }
            other => return other,
        }
    }
}
