//! # Submission Service
//!
//! The accept path: validate, persist the payload, honor idempotency keys,
//! emit the ingress envelope, and (for synchronous submissions) block on the
//! lifecycle stream. Also serves the status and results queries.

use crate::config::Config;
use crate::constants::{keys, streams};
use crate::error::{Result, ValuationError};
use crate::front::sync_waiter::SyncWaiter;
use crate::messaging::{IngressEnvelope, LifecycleStatus, RedisStore};
use crate::state::{RequestStateStore, RequestStatus};
use crate::xml::parse_document;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const VISIBILITY_ATTEMPTS: u32 = 5;
const VISIBILITY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionMode {
    Sync,
    Async,
}

impl SubmissionMode {
    /// The sync flag is `Y` or `N`; absence means asynchronous.
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw {
            None => Ok(SubmissionMode::Async),
            Some("Y") => Ok(SubmissionMode::Sync),
            Some("N") => Ok(SubmissionMode::Async),
            Some(other) => Err(ValuationError::InvalidInput(format!(
                "sync flag must be Y or N, got {other:?}"
            ))),
        }
    }
}

/// What the HTTP layer renders back to the submitter
#[derive(Debug)]
pub enum SubmissionOutcome {
    /// Accepted for asynchronous processing (or an idempotent replay)
    Accepted { request_id: String },
    /// Synchronous wait hit its deadline; processing continues
    Pending { request_id: String },
    /// Synchronous success: the exact bytes written to the response key
    Completed {
        request_id: String,
        response_xml: String,
    },
    /// Synchronous terminal failure, with detail when it was persisted
    Failed {
        request_id: String,
        detail: Option<String>,
    },
}

/// Normalized status projection of the request-state hash
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub request_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_group: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_count: Option<usize>,
    pub received_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Results query resolution
#[derive(Debug)]
pub enum ResultsOutcome {
    Ready(String),
    Failed { detail: Option<String> },
}

#[derive(Serialize, Deserialize)]
struct IdempotencyRecord {
    request_id: String,
    fingerprint: String,
}

pub struct SubmissionService {
    store: RedisStore,
    config: Arc<Config>,
    request_state: RequestStateStore,
}

impl SubmissionService {
    pub fn new(store: RedisStore, config: Arc<Config>) -> Self {
        let request_state = RequestStateStore::new(store.clone());
        Self {
            store,
            config,
            request_state,
        }
    }

    pub async fn submit(
        &self,
        payload: &str,
        mode: SubmissionMode,
        metadata: Vec<(String, String)>,
        idempotency_key: Option<&str>,
    ) -> Result<SubmissionOutcome> {
        if payload.len() > self.config.max_payload_bytes {
            return Err(ValuationError::PayloadTooLarge {
                limit: self.config.max_payload_bytes,
                actual: payload.len(),
            });
        }
        // Well-formedness is the only validation the edge performs.
        parse_document(payload)?;

        let request_id = Uuid::new_v4().to_string();
        let xml_key = keys::request_xml(&request_id);
        let response_key = keys::request_response(&request_id);
        let ttl = self.config.request_ttl_seconds;

        self.store.set_with_ttl(&xml_key, payload, ttl).await?;
        self.verify_payload_visible(&xml_key).await?;

        if let Some(key) = idempotency_key {
            if let Some(existing) = self.claim_idempotency(key, payload, &request_id).await? {
                info!(
                    request_id = %existing,
                    idempotency_key = %key,
                    "Idempotent replay; reusing original request"
                );
                return self.replay_outcome(existing, mode).await;
            }
        }

        let metadata_key = if metadata.is_empty() {
            None
        } else {
            let key = keys::request_metadata(&request_id);
            self.store.hash_set(&key, &metadata).await?;
            self.store.expire(&key, ttl).await?;
            Some(key)
        };

        let mut envelope = IngressEnvelope::new(request_id.clone(), xml_key, response_key.clone());
        envelope.metadata_key = metadata_key;

        // For sync submissions the lifecycle cursor is captured before the
        // envelope becomes visible, closing the publish/subscribe race.
        let lifecycle_start = match mode {
            SubmissionMode::Sync => Some(
                self.store
                    .latest_stream_id(streams::REQUEST_LIFECYCLE)
                    .await?,
            ),
            SubmissionMode::Async => None,
        };

        self.store
            .stream_add(streams::REQUEST_INGEST, &envelope.to_fields())
            .await?;
        info!(request_id = %request_id, sync = matches!(mode, SubmissionMode::Sync), "Submission accepted");

        match lifecycle_start {
            None => Ok(SubmissionOutcome::Accepted { request_id }),
            Some(start_id) => {
                self.wait_for_terminal(request_id, &response_key, &start_id)
                    .await
            }
        }
    }

    /// The store may serve reads from a lagging replica; the envelope must
    /// not become visible before the payload is observable.
    async fn verify_payload_visible(&self, xml_key: &str) -> Result<()> {
        for attempt in 1..=VISIBILITY_ATTEMPTS {
            if self.store.exists(xml_key).await? {
                return Ok(());
            }
            if attempt < VISIBILITY_ATTEMPTS {
                tokio::time::sleep(VISIBILITY_BACKOFF).await;
            }
        }
        Err(ValuationError::PayloadNotVisible(xml_key.to_string()))
    }

    /// Returns the previously mapped request ID when the key was already
    /// claimed with an identical payload; errors on a differing payload.
    async fn claim_idempotency(
        &self,
        key: &str,
        payload: &str,
        request_id: &str,
    ) -> Result<Option<String>> {
        let fingerprint = payload_fingerprint(payload);
        let record = IdempotencyRecord {
            request_id: request_id.to_string(),
            fingerprint: fingerprint.clone(),
        };
        let mapping_key = keys::idempotency(key);
        let installed = self
            .store
            .set_if_absent(&mapping_key, &serde_json::to_string(&record)?)
            .await?;
        if installed {
            self.store
                .expire(&mapping_key, self.config.request_ttl_seconds)
                .await?;
            return Ok(None);
        }

        let raw = self.store.get(&mapping_key).await?.ok_or_else(|| {
            ValuationError::DatastoreUnavailable("idempotency mapping vanished".to_string())
        })?;
        let existing: IdempotencyRecord = serde_json::from_str(&raw)?;
        if existing.fingerprint != fingerprint {
            return Err(ValuationError::IdempotencyConflict(format!(
                "key {key:?} was used with a different payload"
            )));
        }
        Ok(Some(existing.request_id))
    }

    /// An idempotent replay re-reads whatever the original produced.
    async fn replay_outcome(
        &self,
        request_id: String,
        mode: SubmissionMode,
    ) -> Result<SubmissionOutcome> {
        if matches!(mode, SubmissionMode::Sync) {
            let response_key = keys::request_response(&request_id);
            if let Some(response_xml) = self.store.get(&response_key).await? {
                return Ok(SubmissionOutcome::Completed {
                    request_id,
                    response_xml,
                });
            }
        }
        Ok(SubmissionOutcome::Accepted { request_id })
    }

    async fn wait_for_terminal(
        &self,
        request_id: String,
        response_key: &str,
        start_id: &str,
    ) -> Result<SubmissionOutcome> {
        let waiter = SyncWaiter::new(self.store.clone(), self.config.lifecycle_block_ms);
        let timeout = Duration::from_millis(self.config.sync_wait_timeout_ms);

        match waiter.await_terminal(&request_id, start_id, timeout).await? {
            None => Ok(SubmissionOutcome::Pending { request_id }),
            Some(event) if event.status == LifecycleStatus::Succeeded => {
                let response_xml = self.store.get(response_key).await?.ok_or_else(|| {
                    ValuationError::Internal(format!(
                        "request {request_id} succeeded but its response is missing"
                    ))
                })?;
                Ok(SubmissionOutcome::Completed {
                    request_id,
                    response_xml,
                })
            }
            Some(_) => {
                let detail = self
                    .store
                    .get(&keys::request_failure(&request_id))
                    .await
                    .unwrap_or_else(|e| {
                        warn!(request_id = %request_id, error = %e, "Failure detail unavailable");
                        None
                    });
                Ok(SubmissionOutcome::Failed { request_id, detail })
            }
        }
    }

    /// Status projection for `GET /valuation/{id}/status`.
    pub async fn status(&self, request_id: &str) -> Result<StatusView> {
        let state = self
            .request_state
            .load(request_id)
            .await?
            .ok_or_else(|| ValuationError::NotFound(format!("request {request_id}")))?;

        Ok(StatusView {
            request_id: request_id.to_string(),
            status: state.status.to_string(),
            current_group: state.current_group,
            group_count: state.group_count,
            received_at: state.received_at,
            completed_at: state.completed_at,
        })
    }

    /// Results resolution for `GET /valuation/{id}/results`.
    pub async fn results(&self, request_id: &str) -> Result<ResultsOutcome> {
        let response_key = keys::request_response(request_id);
        if let Some(response_xml) = self.store.get(&response_key).await? {
            return Ok(ResultsOutcome::Ready(response_xml));
        }

        let state = self
            .request_state
            .load(request_id)
            .await?
            .ok_or_else(|| ValuationError::NotFound(format!("request {request_id}")))?;

        match state.status {
            RequestStatus::Failed => {
                let detail = self.store.get(&keys::request_failure(request_id)).await?;
                Ok(ResultsOutcome::Failed { detail })
            }
            // A terminal success whose response key has already expired is
            // the evidence of prior existence the Gone contract asks for.
            RequestStatus::Succeeded => Err(ValuationError::Gone(format!(
                "results for request {request_id} have expired"
            ))),
            _ => Err(ValuationError::NotReady(format!(
                "request {request_id} is still processing"
            ))),
        }
    }
}

/// Idempotency fingerprint: content hash of the submitted payload.
pub fn payload_fingerprint(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flag_parsing_is_strict() {
        assert_eq!(SubmissionMode::parse(None).unwrap(), SubmissionMode::Async);
        assert_eq!(
            SubmissionMode::parse(Some("Y")).unwrap(),
            SubmissionMode::Sync
        );
        assert_eq!(
            SubmissionMode::parse(Some("N")).unwrap(),
            SubmissionMode::Async
        );
        assert!(SubmissionMode::parse(Some("yes")).is_err());
        assert!(SubmissionMode::parse(Some("")).is_err());
    }

    #[test]
    fn fingerprints_distinguish_payloads() {
        let a = payload_fingerprint("<vnml><project/></vnml>");
        let b = payload_fingerprint("<vnml><project></project></vnml>");
        assert_ne!(a, b);
        assert_eq!(a, payload_fingerprint("<vnml><project/></vnml>"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn status_view_serializes_camel_case_with_numeric_counters() {
        let view = StatusView {
            request_id: "req-1".to_string(),
            status: "started".to_string(),
            current_group: Some(1),
            group_count: Some(3),
            received_at: "2026-01-01T00:00:00Z".to_string(),
            completed_at: None,
        };
        let rendered = serde_json::to_value(&view).unwrap();
        assert_eq!(rendered["currentGroup"], 1);
        assert_eq!(rendered["groupCount"], 3);
        assert!(rendered.get("completedAt").is_none());
    }
}
