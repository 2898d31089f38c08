//! # Orchestrator Invocation
//!
//! The gateway hands claimed ingress envelopes to an orchestrator through
//! this seam. The local invoker runs the orchestrator on the shared runtime;
//! deployments that host the orchestrator elsewhere implement the same trait.

use crate::config::Config;
use crate::error::Result;
use crate::messaging::{IngressEnvelope, RedisStore};
use crate::orchestrator::RequestOrchestrator;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Payload an orchestrator instance is started with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorInvocation {
    pub request_id: String,
    pub xml_key: String,
    pub response_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_count: Option<usize>,
    #[serde(default = "new_execution_token")]
    pub execution_token: String,
}

fn new_execution_token() -> String {
    Uuid::new_v4().to_string()
}

impl OrchestratorInvocation {
    pub fn from_envelope(envelope: &IngressEnvelope) -> Self {
        Self {
            request_id: envelope.request_id.clone(),
            xml_key: envelope.xml_key.clone(),
            response_key: envelope.response_key.clone(),
            metadata_key: envelope.metadata_key.clone(),
            group_count: envelope.group_count,
            execution_token: new_execution_token(),
        }
    }
}

/// Fire-and-forget launch of one request orchestrator
#[async_trait]
pub trait OrchestratorInvoker: Send + Sync {
    async fn invoke(&self, invocation: OrchestratorInvocation) -> Result<()>;
}

/// Runs the orchestrator as a task on the local runtime
pub struct LocalInvoker {
    store: RedisStore,
    config: Arc<Config>,
}

impl LocalInvoker {
    pub fn new(store: RedisStore, config: Arc<Config>) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl OrchestratorInvoker for LocalInvoker {
    async fn invoke(&self, invocation: OrchestratorInvocation) -> Result<()> {
        let orchestrator = RequestOrchestrator::new(self.store.clone(), self.config.clone());
        tokio::spawn(async move {
            let request_id = invocation.request_id.clone();
            if let Err(e) = orchestrator.run(invocation).await {
                error!(request_id = %request_id, error = %e, "Request orchestration failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_json_round_trips_camel_case() {
        let raw = r#"{
            "requestId": "req-1",
            "xmlKey": "cache:request:req-1:xml",
            "responseKey": "cache:request:req-1:response",
            "groupCount": 2
        }"#;
        let invocation: OrchestratorInvocation = serde_json::from_str(raw).unwrap();
        assert_eq!(invocation.request_id, "req-1");
        assert_eq!(invocation.group_count, Some(2));
        assert!(!invocation.execution_token.is_empty());

        let rendered = serde_json::to_string(&invocation).unwrap();
        assert!(rendered.contains("\"requestId\""));
        assert!(!rendered.contains("metadataKey"));
    }

    #[test]
    fn envelope_conversion_mints_a_fresh_token() {
        let envelope = IngressEnvelope::new(
            "req-2".to_string(),
            "xml".to_string(),
            "resp".to_string(),
        );
        let first = OrchestratorInvocation::from_envelope(&envelope);
        let second = OrchestratorInvocation::from_envelope(&envelope);
        assert_ne!(first.execution_token, second.execution_token);
        assert_eq!(first.request_id, "req-2");
    }
}
