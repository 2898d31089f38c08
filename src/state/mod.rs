//! # Request and Group State
//!
//! The state hashes shared between the gateway and the request orchestrator.
//! The gateway creates request state and owns the `received` transition; the
//! orchestrator owns everything after. Group state belongs exclusively to the
//! orchestrator instance driving that request.

use crate::constants::keys;
use crate::error::{Result, ValuationError};
use crate::messaging::RedisStore;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;

/// Request status as persisted in the request-state hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Received,
    Started,
    Succeeded,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Legal forward transitions. Terminal states absorb.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        match self {
            Self::Received => matches!(next, Self::Started | Self::Failed),
            Self::Started => matches!(next, Self::Succeeded | Self::Failed),
            Self::Succeeded | Self::Failed => false,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::Started => write!(f, "started"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "started" | "running" => Ok(Self::Started),
            // `completed` is a historical synonym for terminal success
            "succeeded" | "completed" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid request status: {s}")),
        }
    }
}

/// Materialized view of the request-state hash
#[derive(Debug, Clone)]
pub struct RequestState {
    pub request_id: String,
    pub status: RequestStatus,
    pub xml_key: String,
    pub response_key: String,
    pub metadata_key: Option<String>,
    pub group_count: Option<usize>,
    pub current_group: Option<usize>,
    pub retry_count: u32,
    pub received_at: String,
    pub submitted_at: String,
    pub completed_at: Option<String>,
}

impl RequestState {
    fn from_hash(request_id: &str, hash: &HashMap<String, String>) -> Result<Self> {
        let raw_status = hash
            .get("status")
            .ok_or_else(|| ValuationError::NotFound(format!("request {request_id}")))?;
        let status: RequestStatus = raw_status
            .parse()
            .map_err(|e: String| ValuationError::Internal(e))?;

        Ok(Self {
            request_id: request_id.to_string(),
            status,
            xml_key: hash.get("xmlKey").cloned().unwrap_or_default(),
            response_key: hash.get("responseKey").cloned().unwrap_or_default(),
            metadata_key: hash.get("metadataKey").cloned().filter(|v| !v.is_empty()),
            group_count: parse_optional_number(hash, "groupCount"),
            current_group: parse_optional_number(hash, "currentGroup"),
            retry_count: parse_optional_number(hash, "retryCount").unwrap_or(0),
            received_at: hash.get("receivedAt").cloned().unwrap_or_default(),
            submitted_at: hash.get("submittedAt").cloned().unwrap_or_default(),
            completed_at: hash.get("completedAt").cloned().filter(|v| !v.is_empty()),
        })
    }
}

fn parse_optional_number<T: std::str::FromStr>(
    hash: &HashMap<String, String>,
    field: &str,
) -> Option<T> {
    hash.get(field).and_then(|raw| raw.parse().ok())
}

/// Read/write access to one request's state hash
#[derive(Clone)]
pub struct RequestStateStore {
    store: RedisStore,
}

impl RequestStateStore {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    /// Create the state hash on ingress-envelope claim. The gateway is the
    /// only writer of this transition.
    pub async fn initialize(
        &self,
        request_id: &str,
        xml_key: &str,
        response_key: &str,
        metadata_key: Option<&str>,
        submitted_at: &str,
    ) -> Result<()> {
        let key = keys::request_state(request_id);
        let mut fields = vec![
            ("status".to_string(), RequestStatus::Received.to_string()),
            ("xmlKey".to_string(), xml_key.to_string()),
            ("responseKey".to_string(), response_key.to_string()),
            ("retryCount".to_string(), "0".to_string()),
            ("receivedAt".to_string(), Utc::now().to_rfc3339()),
            ("submittedAt".to_string(), submitted_at.to_string()),
        ];
        if let Some(metadata_key) = metadata_key {
            fields.push(("metadataKey".to_string(), metadata_key.to_string()));
        }
        self.store.hash_set(&key, &fields).await
    }

    pub async fn load(&self, request_id: &str) -> Result<Option<RequestState>> {
        let hash = self.store.hash_get_all(&keys::request_state(request_id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        RequestState::from_hash(request_id, &hash).map(Some)
    }

    pub async fn mark_started(&self, request_id: &str, group_count: usize) -> Result<()> {
        self.write(
            request_id,
            &[
                ("status".to_string(), RequestStatus::Started.to_string()),
                ("groupCount".to_string(), group_count.to_string()),
            ],
        )
        .await
    }

    pub async fn set_current_group(&self, request_id: &str, group_idx: usize) -> Result<()> {
        self.write(
            request_id,
            &[("currentGroup".to_string(), group_idx.to_string())],
        )
        .await
    }

    pub async fn mark_succeeded(&self, request_id: &str) -> Result<()> {
        self.write(
            request_id,
            &[
                ("status".to_string(), RequestStatus::Succeeded.to_string()),
                ("completedAt".to_string(), Utc::now().to_rfc3339()),
            ],
        )
        .await
    }

    pub async fn mark_failed(&self, request_id: &str) -> Result<()> {
        self.write(
            request_id,
            &[
                ("status".to_string(), RequestStatus::Failed.to_string()),
                ("completedAt".to_string(), Utc::now().to_rfc3339()),
            ],
        )
        .await
    }

    async fn write(&self, request_id: &str, fields: &[(String, String)]) -> Result<()> {
        self.store
            .hash_set(&keys::request_state(request_id), fields)
            .await
    }
}

/// Group status as persisted in the group-state hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for GroupStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid group status: {s}")),
        }
    }
}

/// Materialized view of one group's counters
#[derive(Debug, Clone)]
pub struct GroupState {
    pub expected: usize,
    pub completed: usize,
    pub failed: usize,
    pub status: GroupStatus,
}

impl GroupState {
    pub fn is_satisfied(&self) -> bool {
        self.completed == self.expected && self.failed == 0
    }
}

/// Read/write access to group-state hashes, owned by one orchestrator
#[derive(Clone)]
pub struct GroupStateStore {
    store: RedisStore,
}

impl GroupStateStore {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    pub async fn initialize(&self, request_id: &str, group_idx: usize, expected: usize) -> Result<()> {
        let fields = vec![
            ("expected".to_string(), expected.to_string()),
            ("completed".to_string(), "0".to_string()),
            ("failed".to_string(), "0".to_string()),
            ("status".to_string(), GroupStatus::Running.to_string()),
        ];
        self.store
            .hash_set(&keys::group_state(request_id, group_idx), &fields)
            .await
    }

    pub async fn load(&self, request_id: &str, group_idx: usize) -> Result<Option<GroupState>> {
        let hash = self
            .store
            .hash_get_all(&keys::group_state(request_id, group_idx))
            .await?;
        if hash.is_empty() {
            return Ok(None);
        }

        let status: GroupStatus = hash
            .get("status")
            .map(String::as_str)
            .unwrap_or("running")
            .parse()
            .map_err(|e: String| ValuationError::Internal(e))?;

        Ok(Some(GroupState {
            expected: parse_optional_number(&hash, "expected").unwrap_or(0),
            completed: parse_optional_number(&hash, "completed").unwrap_or(0),
            failed: parse_optional_number(&hash, "failed").unwrap_or(0),
            status,
        }))
    }

    pub async fn increment_completed(&self, request_id: &str, group_idx: usize) -> Result<i64> {
        self.store
            .hash_incr(&keys::group_state(request_id, group_idx), "completed", 1)
            .await
    }

    pub async fn increment_failed(&self, request_id: &str, group_idx: usize) -> Result<i64> {
        self.store
            .hash_incr(&keys::group_state(request_id, group_idx), "failed", 1)
            .await
    }

    pub async fn mark_status(
        &self,
        request_id: &str,
        group_idx: usize,
        status: GroupStatus,
    ) -> Result<()> {
        self.store
            .hash_set(
                &keys::group_state(request_id, group_idx),
                &[("status".to_string(), status.to_string())],
            )
            .await
    }
}
