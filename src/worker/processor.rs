//! # Task Processor
//!
//! Executes one claimed dispatch: fetch the task payload, run the valuation
//! engine, store the result, and publish the outcome on the update stream.
//! The processor never mutates request or group state; those hashes belong to
//! the gateway and the orchestrator.

use crate::constants::{keys, streams};
use crate::error::{Result, ValuationError};
use crate::messaging::{RedisStore, TaskDispatch, TaskUpdate};
use crate::worker::engine::ValuationEngine;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub struct TaskProcessor {
    store: RedisStore,
    engine: Arc<dyn ValuationEngine>,
}

impl TaskProcessor {
    pub fn new(store: RedisStore, engine: Arc<dyn ValuationEngine>) -> Self {
        Self { store, engine }
    }

    /// Process one dispatch end to end and publish its task update.
    ///
    /// Task-level failures (missing payload, engine errors) become `failed`
    /// updates; only datastore faults propagate as errors, leaving the
    /// dispatch unacknowledged for redelivery.
    pub async fn handle_dispatch(&self, dispatch: &TaskDispatch) -> Result<TaskUpdate> {
        let started = Instant::now();

        let update = match self.execute(dispatch).await {
            Ok(()) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    request_id = %dispatch.request_id,
                    task_id = %dispatch.task_id,
                    attempt = dispatch.attempt,
                    duration_ms = duration_ms,
                    "Task completed"
                );
                TaskUpdate::completed(dispatch, duration_ms)
            }
            Err(error) if error.is_retryable() => return Err(error),
            Err(error) => {
                warn!(
                    request_id = %dispatch.request_id,
                    task_id = %dispatch.task_id,
                    attempt = dispatch.attempt,
                    error = %error,
                    "Task failed"
                );
                self.record_failure_detail(dispatch, &error).await;
                TaskUpdate::failed(dispatch, error.to_string())
            }
        };

        self.store
            .stream_add(streams::TASK_UPDATES, &update.to_fields())
            .await?;
        Ok(update)
    }

    async fn execute(&self, dispatch: &TaskDispatch) -> Result<()> {
        let payload = self
            .store
            .get(&dispatch.payload_key)
            .await?
            .ok_or_else(|| ValuationError::TaskFailure {
                task_id: dispatch.task_id.clone(),
                attempt: dispatch.attempt,
                reason: format!("missing task payload {}", dispatch.payload_key),
            })?;

        let result = self
            .engine
            .evaluate(&payload)
            .await
            .map_err(|e| match e {
                retryable @ ValuationError::DatastoreUnavailable(_) => retryable,
                other => ValuationError::TaskFailure {
                    task_id: dispatch.task_id.clone(),
                    attempt: dispatch.attempt,
                    reason: other.to_string(),
                },
            })?;

        self.store_result(dispatch, &result).await
    }

    /// Write the result under the attempt-suffixed key, then promote it to
    /// the canonical key only when this attempt is strictly newer than the
    /// last promoted one. A replayed or stale attempt can never clobber a
    /// newer result.
    async fn store_result(&self, dispatch: &TaskDispatch, result: &str) -> Result<()> {
        let attempt_key = keys::task_attempt_result(
            &dispatch.request_id,
            dispatch.group_idx,
            &dispatch.task_id,
            dispatch.attempt,
        );
        self.store.set(&attempt_key, result).await?;

        let marker_key = keys::task_result_attempt(
            &dispatch.request_id,
            dispatch.group_idx,
            &dispatch.task_id,
        );
        let promoted: Option<u32> = self
            .store
            .get(&marker_key)
            .await?
            .and_then(|raw| raw.parse().ok());

        if promoted.is_none_or(|recorded| dispatch.attempt > recorded) {
            self.store.set(&dispatch.result_key, result).await?;
            self.store
                .set(&marker_key, &dispatch.attempt.to_string())
                .await?;
        }
        Ok(())
    }

    async fn record_failure_detail(&self, dispatch: &TaskDispatch, error: &ValuationError) {
        let detail = serde_json::json!({
            "taskId": dispatch.task_id,
            "groupIdx": dispatch.group_idx,
            "attempt": dispatch.attempt,
            "error": error.to_string(),
        });
        let key = keys::request_failure(&dispatch.request_id);
        if let Err(e) = self.store.set(&key, &detail.to_string()).await {
            warn!(
                request_id = %dispatch.request_id,
                task_id = %dispatch.task_id,
                error = %e,
                "Unable to persist failure detail"
            );
        }
    }
}
