//! # Error Taxonomy
//!
//! One crate-wide error enum shared by the gateway, orchestrator, and worker.
//! HTTP-facing conversions live in `web::errors`; background consumers treat
//! `DatastoreUnavailable` as retryable and everything else as a request-level
//! outcome.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValuationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("payload of {actual} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { limit: usize, actual: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("expired: {0}")]
    Gone(String),

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("idempotency key conflict: {0}")]
    IdempotencyConflict(String),

    #[error("payload not visible after write: {0}")]
    PayloadNotVisible(String),

    #[error("datastore unavailable: {0}")]
    DatastoreUnavailable(String),

    #[error("task {task_id} failed on attempt {attempt}: {reason}")]
    TaskFailure {
        task_id: String,
        attempt: u32,
        reason: String,
    },

    #[error("task {task_id} exhausted its retry budget after {attempts} attempts")]
    RetryBudgetExhausted { task_id: String, attempts: u32 },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("hydration failed: {0}")]
    Hydration(String),

    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ValuationError {
    /// Transient datastore faults are the only errors background consumers
    /// retry in place; everything else resolves the message they carry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ValuationError::DatastoreUnavailable(_))
    }
}

impl From<redis::RedisError> for ValuationError {
    fn from(error: redis::RedisError) -> Self {
        ValuationError::DatastoreUnavailable(error.to_string())
    }
}

impl From<serde_json::Error> for ValuationError {
    fn from(error: serde_json::Error) -> Self {
        ValuationError::Internal(format!("JSON serialization error: {error}"))
    }
}

impl From<std::io::Error> for ValuationError {
    fn from(error: std::io::Error) -> Self {
        ValuationError::Internal(format!("I/O error: {error}"))
    }
}

pub type Result<T> = std::result::Result<T, ValuationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_datastore_faults_are_retryable() {
        assert!(ValuationError::DatastoreUnavailable("conn refused".into()).is_retryable());
        assert!(!ValuationError::Timeout("group 0".into()).is_retryable());
        assert!(!ValuationError::InvalidInput("bad xml".into()).is_retryable());
    }

    #[test]
    fn task_failure_display_carries_context() {
        let err = ValuationError::TaskFailure {
            task_id: "g1-t1-px".into(),
            attempt: 2,
            reason: "pricing script exited non-zero".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("g1-t1-px"));
        assert!(rendered.contains("attempt 2"));
    }
}
