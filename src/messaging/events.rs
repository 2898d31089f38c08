//! # Stream Record Types
//!
//! Wire formats for the four shared streams. Everything is stringly typed on
//! the wire (flat field pairs); these types own the encode/decode so the rest
//! of the crate never touches raw field maps.

use crate::error::{Result, ValuationError};
use crate::messaging::redis_client::StreamEntry;
use chrono::Utc;
use std::collections::HashMap;

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ValuationError::Internal(format!("stream record missing field `{name}`")))
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| ValuationError::Internal(format!("stream field `{name}`={raw:?}: {e}")))
}

/// Handoff record from the HTTP edge to the background pipeline
#[derive(Debug, Clone)]
pub struct IngressEnvelope {
    pub request_id: String,
    pub xml_key: String,
    pub response_key: String,
    pub metadata_key: Option<String>,
    pub group_count: Option<usize>,
    pub submitted_at: String,
}

impl IngressEnvelope {
    pub fn new(request_id: String, xml_key: String, response_key: String) -> Self {
        Self {
            request_id,
            xml_key,
            response_key,
            metadata_key: None,
            group_count: None,
            submitted_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("requestId".to_string(), self.request_id.clone()),
            ("xmlKey".to_string(), self.xml_key.clone()),
            ("responseKey".to_string(), self.response_key.clone()),
            ("submittedAt".to_string(), self.submitted_at.clone()),
        ];
        if let Some(metadata_key) = &self.metadata_key {
            fields.push(("metadataKey".to_string(), metadata_key.clone()));
        }
        if let Some(group_count) = self.group_count {
            fields.push(("groupCount".to_string(), group_count.to_string()));
        }
        fields
    }

    pub fn from_entry(entry: &StreamEntry) -> Result<Self> {
        let fields = &entry.fields;
        Ok(Self {
            request_id: required(fields, "requestId")?.to_string(),
            xml_key: required(fields, "xmlKey")?.to_string(),
            response_key: required(fields, "responseKey")?.to_string(),
            metadata_key: fields.get("metadataKey").cloned(),
            group_count: fields
                .get("groupCount")
                .map(|raw| parse_number("groupCount", raw))
                .transpose()?,
            submitted_at: fields
                .get("submittedAt")
                .cloned()
                .unwrap_or_else(|| Utc::now().to_rfc3339()),
        })
    }
}

/// Status values carried on the lifecycle stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Received,
    Started,
    GroupStarted,
    GroupCompleted,
    Succeeded,
    Failed,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Received => "received",
            LifecycleStatus::Started => "started",
            LifecycleStatus::GroupStarted => "group_started",
            LifecycleStatus::GroupCompleted => "group_completed",
            LifecycleStatus::Succeeded => "succeeded",
            LifecycleStatus::Failed => "failed",
        }
    }

    /// Readers accept `completed` as a historical synonym for `succeeded`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "received" => Some(LifecycleStatus::Received),
            "started" => Some(LifecycleStatus::Started),
            "group_started" => Some(LifecycleStatus::GroupStarted),
            "group_completed" => Some(LifecycleStatus::GroupCompleted),
            "succeeded" | "completed" => Some(LifecycleStatus::Succeeded),
            "failed" => Some(LifecycleStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleStatus::Succeeded | LifecycleStatus::Failed)
    }
}

/// Broadcast record announcing a request's status transition
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub request_id: String,
    pub status: LifecycleStatus,
    pub at: String,
    pub detail: Vec<(String, String)>,
}

impl LifecycleEvent {
    pub fn new(request_id: &str, status: LifecycleStatus) -> Self {
        Self {
            request_id: request_id.to_string(),
            status,
            at: Utc::now().to_rfc3339(),
            detail: Vec::new(),
        }
    }

    pub fn with_detail(mut self, name: &str, value: impl ToString) -> Self {
        self.detail.push((name.to_string(), value.to_string()));
        self
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("requestId".to_string(), self.request_id.clone()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("at".to_string(), self.at.clone()),
        ];
        fields.extend(self.detail.iter().cloned());
        fields
    }

    pub fn from_entry(entry: &StreamEntry) -> Result<Self> {
        let fields = &entry.fields;
        let raw_status = required(fields, "status")?;
        let status = LifecycleStatus::parse(raw_status).ok_or_else(|| {
            ValuationError::Internal(format!("unknown lifecycle status {raw_status:?}"))
        })?;
        let mut detail: Vec<(String, String)> = fields
            .iter()
            .filter(|(name, _)| !matches!(name.as_str(), "requestId" | "status" | "at"))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        detail.sort();
        Ok(Self {
            request_id: required(fields, "requestId")?.to_string(),
            status,
            at: fields.get("at").cloned().unwrap_or_default(),
            detail,
        })
    }

    pub fn detail_value(&self, name: &str) -> Option<&str> {
        self.detail
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Fan-out record instructing a worker to execute one task attempt
#[derive(Debug, Clone)]
pub struct TaskDispatch {
    pub request_id: String,
    pub group_idx: usize,
    pub group_name: String,
    pub task_id: String,
    pub valuation_name: String,
    pub payload_key: String,
    pub result_key: String,
    pub attempt: u32,
}

impl TaskDispatch {
    /// The same task, one attempt later. Used by the orchestrator's retry path.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("requestId".to_string(), self.request_id.clone()),
            ("groupIdx".to_string(), self.group_idx.to_string()),
            ("groupName".to_string(), self.group_name.clone()),
            ("taskId".to_string(), self.task_id.clone()),
            ("valuationName".to_string(), self.valuation_name.clone()),
            ("payloadKey".to_string(), self.payload_key.clone()),
            ("resultKey".to_string(), self.result_key.clone()),
            ("attempt".to_string(), self.attempt.to_string()),
        ]
    }

    pub fn from_entry(entry: &StreamEntry) -> Result<Self> {
        let fields = &entry.fields;
        Ok(Self {
            request_id: required(fields, "requestId")?.to_string(),
            group_idx: parse_number("groupIdx", required(fields, "groupIdx")?)?,
            group_name: fields.get("groupName").cloned().unwrap_or_default(),
            task_id: required(fields, "taskId")?.to_string(),
            valuation_name: fields
                .get("valuationName")
                .or_else(|| fields.get("taskId"))
                .cloned()
                .unwrap_or_default(),
            payload_key: required(fields, "payloadKey")?.to_string(),
            result_key: required(fields, "resultKey")?.to_string(),
            attempt: fields
                .get("attempt")
                .map(|raw| parse_number("attempt", raw))
                .transpose()?
                .unwrap_or(1),
        })
    }
}

/// Task attempt outcome on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskUpdateStatus {
    Completed,
    Failed,
}

impl TaskUpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskUpdateStatus::Completed => "completed",
            TaskUpdateStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(TaskUpdateStatus::Completed),
            "failed" => Some(TaskUpdateStatus::Failed),
            _ => None,
        }
    }
}

/// Fan-in record reporting one task attempt's outcome
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub request_id: String,
    pub group_idx: usize,
    pub group_name: String,
    pub task_id: String,
    pub valuation_name: String,
    pub status: TaskUpdateStatus,
    pub result_key: Option<String>,
    pub error: Option<String>,
    pub attempt: u32,
    pub duration_ms: Option<u64>,
}

impl TaskUpdate {
    pub fn completed(dispatch: &TaskDispatch, duration_ms: u64) -> Self {
        Self {
            request_id: dispatch.request_id.clone(),
            group_idx: dispatch.group_idx,
            group_name: dispatch.group_name.clone(),
            task_id: dispatch.task_id.clone(),
            valuation_name: dispatch.valuation_name.clone(),
            status: TaskUpdateStatus::Completed,
            result_key: Some(dispatch.result_key.clone()),
            error: None,
            attempt: dispatch.attempt,
            duration_ms: Some(duration_ms),
        }
    }

    pub fn failed(dispatch: &TaskDispatch, error: String) -> Self {
        Self {
            request_id: dispatch.request_id.clone(),
            group_idx: dispatch.group_idx,
            group_name: dispatch.group_name.clone(),
            task_id: dispatch.task_id.clone(),
            valuation_name: dispatch.valuation_name.clone(),
            status: TaskUpdateStatus::Failed,
            result_key: None,
            error: Some(error),
            attempt: dispatch.attempt,
            duration_ms: None,
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("requestId".to_string(), self.request_id.clone()),
            ("groupIdx".to_string(), self.group_idx.to_string()),
            ("groupName".to_string(), self.group_name.clone()),
            ("taskId".to_string(), self.task_id.clone()),
            ("valuationName".to_string(), self.valuation_name.clone()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("attempt".to_string(), self.attempt.to_string()),
        ];
        if let Some(result_key) = &self.result_key {
            fields.push(("resultKey".to_string(), result_key.clone()));
        }
        if let Some(error) = &self.error {
            fields.push(("error".to_string(), error.clone()));
        }
        if let Some(duration_ms) = self.duration_ms {
            fields.push(("durationMs".to_string(), duration_ms.to_string()));
        }
        fields
    }

    pub fn from_entry(entry: &StreamEntry) -> Result<Self> {
        let fields = &entry.fields;
        let raw_status = required(fields, "status")?;
        let status = TaskUpdateStatus::parse(raw_status).ok_or_else(|| {
            ValuationError::Internal(format!("unknown task update status {raw_status:?}"))
        })?;
        Ok(Self {
            request_id: required(fields, "requestId")?.to_string(),
            group_idx: parse_number("groupIdx", required(fields, "groupIdx")?)?,
            group_name: fields.get("groupName").cloned().unwrap_or_default(),
            task_id: required(fields, "taskId")?.to_string(),
            valuation_name: fields.get("valuationName").cloned().unwrap_or_default(),
            status,
            result_key: fields.get("resultKey").cloned(),
            error: fields.get("error").cloned(),
            attempt: fields
                .get("attempt")
                .map(|raw| parse_number("attempt", raw))
                .transpose()?
                .unwrap_or(1),
            duration_ms: fields
                .get("durationMs")
                .map(|raw| parse_number("durationMs", raw))
                .transpose()?,
        })
    }
}
