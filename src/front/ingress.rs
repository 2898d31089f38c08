//! # Ingress Consumer
//!
//! Background loop claiming ingress envelopes under the shared gateway
//! consumer group. Each claim initializes request state, broadcasts the
//! `received` lifecycle event, and launches the request orchestrator. The
//! envelope is acknowledged only once all three steps succeed; anything less
//! leaves it pending for redelivery.

use crate::config::Config;
use crate::constants::{groups, streams};
use crate::error::Result;
use crate::messaging::{IngressEnvelope, LifecycleEvent, LifecycleStatus, RedisStore};
use crate::orchestrator::{OrchestratorInvocation, OrchestratorInvoker};
use crate::state::RequestStateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

const CLAIM_BATCH_SIZE: usize = 10;
const BACKOFF_ON_FAULT: Duration = Duration::from_millis(500);

pub struct IngressConsumer {
    store: RedisStore,
    config: Arc<Config>,
    request_state: RequestStateStore,
    invoker: Arc<dyn OrchestratorInvoker>,
    shutdown: watch::Receiver<bool>,
}

impl IngressConsumer {
    pub fn new(
        store: RedisStore,
        config: Arc<Config>,
        invoker: Arc<dyn OrchestratorInvoker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let request_state = RequestStateStore::new(store.clone());
        Self {
            store,
            config,
            request_state,
            invoker,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.store
            .ensure_group(streams::REQUEST_INGEST, groups::INGRESS_CONSUMERS, "0")
            .await?;

        let consumer = format!("gateway-{}", Uuid::new_v4().simple());
        let mut conn = self.store.dedicated_connection().await?;
        info!(consumer = %consumer, "Ingress consumer started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let read = tokio::select! {
                _ = self.shutdown.changed() => continue,
                read = self.store.read_group(
                    &mut conn,
                    streams::REQUEST_INGEST,
                    groups::INGRESS_CONSUMERS,
                    &consumer,
                    CLAIM_BATCH_SIZE,
                    self.config.request_stream_block_ms,
                ) => read,
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(e) if e.to_string().contains("NOGROUP") => {
                    self.store
                        .ensure_group(streams::REQUEST_INGEST, groups::INGRESS_CONSUMERS, "0")
                        .await?;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Ingress read failed; backing off");
                    tokio::time::sleep(BACKOFF_ON_FAULT).await;
                    continue;
                }
            };

            for entry in entries {
                let envelope = match IngressEnvelope::from_entry(&entry) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(entry_id = %entry.id, error = %e, "Malformed ingress envelope");
                        self.store
                            .ack(streams::REQUEST_INGEST, groups::INGRESS_CONSUMERS, &entry.id)
                            .await?;
                        continue;
                    }
                };

                match self.handle_envelope(&envelope).await {
                    Ok(()) => {
                        self.store
                            .ack(streams::REQUEST_INGEST, groups::INGRESS_CONSUMERS, &entry.id)
                            .await?;
                    }
                    Err(e) => {
                        // Unacknowledged: the group redelivers after the
                        // visibility window, and state-existence checks make
                        // the replay idempotent.
                        warn!(
                            request_id = %envelope.request_id,
                            error = %e,
                            "Envelope processing failed; leaving pending"
                        );
                        if e.is_retryable() {
                            tokio::time::sleep(BACKOFF_ON_FAULT).await;
                        }
                    }
                }
            }
        }

        info!(consumer = %consumer, "Ingress consumer stopped");
        Ok(())
    }

    async fn handle_envelope(&self, envelope: &IngressEnvelope) -> Result<()> {
        let request_id = &envelope.request_id;

        let existing = self.request_state.load(request_id).await?;
        match existing {
            Some(state) if state.status != crate::state::RequestStatus::Received => {
                // Redelivery of an envelope whose request already progressed:
                // nothing to do beyond acknowledging.
                info!(
                    request_id = %request_id,
                    status = %state.status,
                    "Envelope replay for progressed request; skipping re-invocation"
                );
                return Ok(());
            }
            Some(_) => {
                // State exists but the orchestrator never took over; invoke
                // again without re-announcing `received`.
            }
            None => {
                self.request_state
                    .initialize(
                        request_id,
                        &envelope.xml_key,
                        &envelope.response_key,
                        envelope.metadata_key.as_deref(),
                        &envelope.submitted_at,
                    )
                    .await?;

                let mut event = LifecycleEvent::new(request_id, LifecycleStatus::Received)
                    .with_detail("xmlKey", &envelope.xml_key);
                if let Some(group_count) = envelope.group_count {
                    event = event.with_detail("groupCount", group_count);
                }
                self.store
                    .stream_add(streams::REQUEST_LIFECYCLE, &event.to_fields())
                    .await?;
            }
        }

        self.invoker
            .invoke(OrchestratorInvocation::from_envelope(envelope))
            .await?;
        info!(request_id = %request_id, "Request handed to orchestrator");
        Ok(())
    }
}
