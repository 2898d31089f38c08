//! # Sync Waiter
//!
//! Blocks a synchronous submission until its terminal lifecycle event or a
//! deadline. Reads the shared lifecycle stream as a raw tail (no consumer
//! group), so waiters never compete with each other and leave no pending
//! entries behind. Unrelated records advance the cursor without resetting
//! the deadline.

use crate::constants::streams;
use crate::error::Result;
use crate::messaging::{LifecycleEvent, RedisStore};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub struct SyncWaiter {
    store: RedisStore,
    block_ms: u64,
}

impl SyncWaiter {
    pub fn new(store: RedisStore, block_ms: u64) -> Self {
        Self { store, block_ms }
    }

    /// Wait for a terminal lifecycle event for `request_id`, starting after
    /// `start_id`. Returns `None` when the deadline passes first.
    ///
    /// Callers record `start_id` *before* publishing the ingress envelope so
    /// a fast pipeline cannot slip its terminal event past the cursor.
    pub async fn await_terminal(
        &self,
        request_id: &str,
        start_id: &str,
        timeout: Duration,
    ) -> Result<Option<LifecycleEvent>> {
        let mut conn = self.store.dedicated_connection().await?;
        let deadline = Instant::now() + timeout;
        let mut last_id = start_id.to_string();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(request_id = %request_id, "Sync wait deadline reached");
                return Ok(None);
            }
            let block = self
                .block_ms
                .min(remaining.as_millis() as u64)
                .max(1);

            let entries = self
                .store
                .read_tail(&mut conn, streams::REQUEST_LIFECYCLE, &last_id, block)
                .await?;

            for entry in entries {
                last_id = entry.id.clone();
                let Ok(event) = LifecycleEvent::from_entry(&entry) else {
                    continue;
                };
                if event.request_id != request_id {
                    continue;
                }
                if event.status.is_terminal() {
                    return Ok(Some(event));
                }
            }
        }
    }
}
