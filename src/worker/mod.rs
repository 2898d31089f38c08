//! # Task Worker
//!
//! Stateless consumer of the task-dispatch stream. Each instance claims
//! dispatches under the shared worker consumer group, executes them through
//! the [`TaskProcessor`], and acknowledges only after the outcome has been
//! published.

pub mod engine;
pub mod processor;

pub use engine::{PricingCommandEngine, ValuationEngine};
pub use processor::TaskProcessor;

use crate::config::Config;
use crate::constants::{groups, streams};
use crate::error::Result;
use crate::messaging::{RedisStore, TaskDispatch};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

const CLAIM_BATCH_SIZE: usize = 5;
const BACKOFF_ON_FAULT: Duration = Duration::from_millis(500);

/// Blocking consumer loop claiming from the shared dispatch group
pub struct TaskWorker {
    store: RedisStore,
    config: Arc<Config>,
    processor: Arc<TaskProcessor>,
    shutdown: watch::Receiver<bool>,
}

impl TaskWorker {
    pub fn new(
        store: RedisStore,
        config: Arc<Config>,
        processor: Arc<TaskProcessor>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            processor,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.store
            .ensure_group(streams::TASK_DISPATCH, groups::TASK_WORKERS, "0")
            .await?;

        let consumer = format!("worker-{}", Uuid::new_v4().simple());
        let mut conn = self.store.dedicated_connection().await?;
        info!(consumer = %consumer, "Task worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let read = tokio::select! {
                _ = self.shutdown.changed() => continue,
                read = self.store.read_group(
                    &mut conn,
                    streams::TASK_DISPATCH,
                    groups::TASK_WORKERS,
                    &consumer,
                    CLAIM_BATCH_SIZE,
                    self.config.request_stream_block_ms,
                ) => read,
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(e) if e.to_string().contains("NOGROUP") => {
                    self.store
                        .ensure_group(streams::TASK_DISPATCH, groups::TASK_WORKERS, "0")
                        .await?;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Dispatch read failed; backing off");
                    tokio::time::sleep(BACKOFF_ON_FAULT).await;
                    continue;
                }
            };

            for entry in entries {
                let dispatch = match TaskDispatch::from_entry(&entry) {
                    Ok(dispatch) => dispatch,
                    Err(e) => {
                        warn!(entry_id = %entry.id, error = %e, "Malformed dispatch record");
                        self.store
                            .ack(streams::TASK_DISPATCH, groups::TASK_WORKERS, &entry.id)
                            .await?;
                        continue;
                    }
                };

                match self.processor.handle_dispatch(&dispatch).await {
                    Ok(_) => {
                        self.store
                            .ack(streams::TASK_DISPATCH, groups::TASK_WORKERS, &entry.id)
                            .await?;
                    }
                    Err(e) if e.is_retryable() => {
                        // Leave unacknowledged; the group redelivers after
                        // the visibility window.
                        warn!(
                            task_id = %dispatch.task_id,
                            error = %e,
                            "Datastore fault during task processing"
                        );
                        tokio::time::sleep(BACKOFF_ON_FAULT).await;
                    }
                    Err(e) => {
                        error!(
                            task_id = %dispatch.task_id,
                            error = %e,
                            "Unrecoverable dispatch processing error"
                        );
                        self.store
                            .ack(streams::TASK_DISPATCH, groups::TASK_WORKERS, &entry.id)
                            .await?;
                    }
                }
            }
        }

        info!(consumer = %consumer, "Task worker stopped");
        Ok(())
    }
}
