//! # Request Orchestrator
//!
//! One logical instance per request. Parses the submission into ordered
//! groups, hydrates and dispatches each group's tasks, drives the completion
//! loop over a request-scoped consumer group, retries failures within the
//! attempt budget, and assembles the final response document.
//!
//! The orchestrator must be safe under repeated delivery: a terminal request
//! returns immediately, and a request interrupted mid-flight resumes at its
//! checkpointed group using the stored counters and task results.

pub mod invoker;

pub use invoker::{LocalInvoker, OrchestratorInvocation, OrchestratorInvoker};

use crate::config::Config;
use crate::constants::{groups, keys, streams};
use crate::error::{Result, ValuationError};
use crate::hydration::HydrationEngine;
use crate::messaging::{
    LifecycleEvent, LifecycleStatus, RedisStore, TaskDispatch, TaskUpdate, TaskUpdateStatus,
};
use crate::state::{GroupStateStore, GroupStatus, RequestStateStore};
use crate::xml::project::{
    build_response_document, compose_task_document, task_id, ProjectPlan, ResponseGroup,
    ResponseTask,
};
use crate::xml::{element_to_string, parse_document};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;
use xmltree::Element;

const XML_LOAD_ATTEMPTS: u32 = 5;
const XML_LOAD_BACKOFF: Duration = Duration::from_millis(200);
const FAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Terminal summary returned to the invoking runner
#[derive(Debug, Clone)]
pub struct OrchestrationOutcome {
    pub response_key: String,
    pub group_count: usize,
}

/// One task planned for a group, after hydration expansion
#[derive(Debug, Clone)]
struct TaskDescriptor {
    task_id: String,
    valuation_name: String,
    element: Element,
    payload_key: String,
    result_key: String,
}

pub struct RequestOrchestrator {
    store: RedisStore,
    config: Arc<Config>,
    request_state: RequestStateStore,
    group_state: GroupStateStore,
}

impl RequestOrchestrator {
    pub fn new(store: RedisStore, config: Arc<Config>) -> Self {
        let request_state = RequestStateStore::new(store.clone());
        let group_state = GroupStateStore::new(store.clone());
        Self {
            store,
            config,
            request_state,
            group_state,
        }
    }

    pub async fn run(&self, invocation: OrchestratorInvocation) -> Result<OrchestrationOutcome> {
        let request_id = invocation.request_id.clone();

        // Repeated delivery: a terminal request is done, a started request
        // resumes at its checkpoint.
        let mut resume_group = None;
        if let Some(state) = self.request_state.load(&request_id).await? {
            if state.status.is_terminal() {
                info!(
                    request_id = %request_id,
                    status = %state.status,
                    "Request already terminal; skipping re-run"
                );
                return Ok(OrchestrationOutcome {
                    response_key: invocation.response_key.clone(),
                    group_count: state.group_count.unwrap_or(0),
                });
            }
            if state.status == crate::state::RequestStatus::Started {
                resume_group = state.current_group;
            }
        }

        let raw_xml = match self.load_request_xml(&invocation.xml_key).await {
            Ok(raw_xml) => raw_xml,
            Err(e) => {
                self.fail_request(
                    &request_id,
                    serde_json::json!({"error": e.to_string(), "stage": "load_xml"}),
                )
                .await;
                return Err(e);
            }
        };

        let document = match parse_document(&raw_xml).and_then(|document| {
            ProjectPlan::parse(&document).map(|plan| (document, plan))
        }) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.fail_request(
                    &request_id,
                    serde_json::json!({"error": e.to_string(), "stage": "parse"}),
                )
                .await;
                return Err(e);
            }
        };
        let (document, plan) = document;
        let group_count = plan.group_count();

        info!(
            request_id = %request_id,
            groups = group_count,
            execution_token = %invocation.execution_token,
            resume_group = ?resume_group,
            "Processing valuation request"
        );

        self.request_state
            .mark_started(&request_id, group_count)
            .await?;
        self.publish_lifecycle(
            LifecycleEvent::new(&request_id, LifecycleStatus::Started)
                .with_detail("groupCount", group_count),
        )
        .await?;

        let mut engine = HydrationEngine::for_root(&self.config.hydration_root);
        let mut prior_results: Vec<(String, String)> = Vec::new();
        let mut response_groups: Vec<ResponseGroup> = Vec::new();

        // Replay finished groups from their stored results. A group whose
        // results are incomplete becomes the resume point instead.
        let mut start_group = 0;
        if let Some(checkpoint) = resume_group {
            for group_idx in 0..checkpoint.min(group_count) {
                let descriptors = self.plan_group(&mut engine, &plan, &document, &request_id, group_idx)?;
                match self.replay_group(&request_id, group_idx, &descriptors).await? {
                    Some(tasks) => {
                        for task in &tasks {
                            if let Some(stored) = &task.stored {
                                prior_results.push((task.task_id.clone(), stored.clone()));
                            }
                        }
                        response_groups.push(ResponseGroup {
                            index: group_idx,
                            tasks,
                        });
                        start_group = group_idx + 1;
                    }
                    None => break,
                }
            }
            info!(
                request_id = %request_id,
                start_group = start_group,
                "Resuming from checkpoint"
            );
        }

        for group_idx in start_group..group_count {
            let outcome = self
                .run_group(
                    &mut engine,
                    &plan,
                    &document,
                    &request_id,
                    group_idx,
                    &prior_results,
                )
                .await;

            let tasks = match outcome {
                Ok(tasks) => tasks,
                Err(e @ ValuationError::RetryBudgetExhausted { .. })
                | Err(e @ ValuationError::Timeout(_)) => {
                    // Failure detail already recorded by the completion loop.
                    return Err(e);
                }
                Err(e) => {
                    self.fail_request(
                        &request_id,
                        serde_json::json!({
                            "error": e.to_string(),
                            "stage": "group_processing",
                            "group": group_idx,
                        }),
                    )
                    .await;
                    return Err(e);
                }
            };

            for task in &tasks {
                if let Some(stored) = &task.stored {
                    prior_results.push((task.task_id.clone(), stored.clone()));
                }
            }
            response_groups.push(ResponseGroup {
                index: group_idx,
                tasks,
            });
        }

        let response_xml = build_response_document(&request_id, &response_groups)?;
        self.store
            .set(&invocation.response_key, &response_xml)
            .await?;
        self.request_state.mark_succeeded(&request_id).await?;
        self.publish_lifecycle(
            LifecycleEvent::new(&request_id, LifecycleStatus::Succeeded)
                .with_detail("responseKey", &invocation.response_key),
        )
        .await?;
        self.apply_terminal_ttls(&request_id).await;

        info!(request_id = %request_id, groups = group_count, "Request succeeded");
        Ok(OrchestrationOutcome {
            response_key: invocation.response_key,
            group_count,
        })
    }

    /// The payload key may lag the ingress envelope behind a replica; retry
    /// briefly before treating absence as terminal.
    async fn load_request_xml(&self, xml_key: &str) -> Result<String> {
        for attempt in 1..=XML_LOAD_ATTEMPTS {
            match self.store.get(xml_key).await {
                Ok(Some(raw_xml)) => return Ok(raw_xml),
                Ok(None) => {
                    if attempt < XML_LOAD_ATTEMPTS {
                        tokio::time::sleep(XML_LOAD_BACKOFF).await;
                    }
                }
                Err(e) => {
                    warn!(xml_key = xml_key, error = %e, "Transient fault loading request XML");
                    tokio::time::sleep(FAULT_BACKOFF).await;
                }
            }
        }
        Err(ValuationError::NotFound(format!(
            "request XML not found for key {xml_key}"
        )))
    }

    /// Hydrate and enumerate one group's tasks. Expansion may multiply a
    /// valuation into several tasks; positions stay stable because hydration
    /// is deterministic for a given document and resource set.
    fn plan_group(
        &self,
        engine: &mut HydrationEngine,
        plan: &ProjectPlan,
        document: &Element,
        request_id: &str,
        group_idx: usize,
    ) -> Result<Vec<TaskDescriptor>> {
        let group = &plan.groups[group_idx];
        let mut descriptors = Vec::new();

        for valuation in &group.valuations {
            let items = engine.hydrate_element(&valuation.element, document, None)?;
            for item in items {
                let position = descriptors.len();
                let id = task_id(group_idx, position, &valuation.name);
                descriptors.push(TaskDescriptor {
                    payload_key: keys::task_xml(request_id, group_idx, &id),
                    result_key: keys::task_result(request_id, group_idx, &id),
                    task_id: id,
                    valuation_name: valuation.name.clone(),
                    element: item.element,
                });
            }
        }
        Ok(descriptors)
    }

    /// Gather a finished group's stored results, or `None` when any are
    /// missing and the group has to be re-run.
    async fn replay_group(
        &self,
        request_id: &str,
        group_idx: usize,
        descriptors: &[TaskDescriptor],
    ) -> Result<Option<Vec<ResponseTask>>> {
        let mut tasks = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match self.store.get(&descriptor.result_key).await? {
                Some(stored) => {
                    let attempt = self
                        .promoted_attempt(request_id, group_idx, &descriptor.task_id)
                        .await?;
                    tasks.push(ResponseTask {
                        task_id: descriptor.task_id.clone(),
                        result_key: descriptor.result_key.clone(),
                        attempt,
                        stored: Some(stored),
                    });
                }
                None => return Ok(None),
            }
        }
        Ok(Some(tasks))
    }

    async fn promoted_attempt(
        &self,
        request_id: &str,
        group_idx: usize,
        task: &str,
    ) -> Result<u32> {
        Ok(self
            .store
            .get(&keys::task_result_attempt(request_id, group_idx, task))
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(1))
    }

    async fn run_group(
        &self,
        engine: &mut HydrationEngine,
        plan: &ProjectPlan,
        document: &Element,
        request_id: &str,
        group_idx: usize,
        prior_results: &[(String, String)],
    ) -> Result<Vec<ResponseTask>> {
        let group_name = plan.groups[group_idx].name.clone();
        let descriptors = self.plan_group(engine, plan, document, request_id, group_idx)?;
        let expected = descriptors.len();

        // Materialize payloads before anything is observable on the streams.
        for descriptor in &descriptors {
            let task_document =
                compose_task_document(&plan.context, prior_results, &descriptor.element);
            let task_xml = element_to_string(&task_document)?;
            self.store.set(&descriptor.payload_key, &task_xml).await?;
        }

        // A resumed group keeps its completed work; a fresh group starts at
        // zero. Either way the counters in the store are authoritative.
        let mut pre_completed: Vec<&TaskDescriptor> = Vec::new();
        let resumed = self.group_state.load(request_id, group_idx).await?.is_some();
        if resumed {
            for descriptor in &descriptors {
                if self.store.get(&descriptor.result_key).await?.is_some() {
                    pre_completed.push(descriptor);
                }
            }
        }

        self.group_state
            .initialize(request_id, group_idx, expected)
            .await?;
        for _ in &pre_completed {
            self.group_state
                .increment_completed(request_id, group_idx)
                .await?;
        }

        self.request_state
            .set_current_group(request_id, group_idx)
            .await?;
        self.publish_lifecycle(
            LifecycleEvent::new(request_id, LifecycleStatus::GroupStarted)
                .with_detail("group", group_idx),
        )
        .await?;

        // The request-scoped group must exist before the first dispatch so
        // every update lands behind its cursor.
        let updates_group = groups::request_updates(request_id);
        self.store
            .ensure_group(streams::TASK_UPDATES, &updates_group, "$")
            .await?;

        let mut completed_attempts: HashMap<String, u32> = HashMap::new();
        for descriptor in &pre_completed {
            let attempt = self
                .promoted_attempt(request_id, group_idx, &descriptor.task_id)
                .await?;
            completed_attempts.insert(descriptor.task_id.clone(), attempt);
        }

        for descriptor in &descriptors {
            if completed_attempts.contains_key(&descriptor.task_id) {
                continue;
            }
            let dispatch = TaskDispatch {
                request_id: request_id.to_string(),
                group_idx,
                group_name: group_name.clone(),
                task_id: descriptor.task_id.clone(),
                valuation_name: descriptor.valuation_name.clone(),
                payload_key: descriptor.payload_key.clone(),
                result_key: descriptor.result_key.clone(),
                attempt: 1,
            };
            self.store
                .stream_add(streams::TASK_DISPATCH, &dispatch.to_fields())
                .await?;
        }

        info!(
            request_id = %request_id,
            group = group_idx,
            group_name = %group_name,
            expected = expected,
            resumed = !pre_completed.is_empty(),
            "Group dispatched"
        );

        self.await_group_completion(
            request_id,
            group_idx,
            &group_name,
            &descriptors,
            completed_attempts,
        )
        .await?;

        self.group_state
            .mark_status(request_id, group_idx, GroupStatus::Completed)
            .await?;
        self.publish_lifecycle(
            LifecycleEvent::new(request_id, LifecycleStatus::GroupCompleted)
                .with_detail("group", group_idx),
        )
        .await?;

        let mut tasks = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            let stored = self.store.get(&descriptor.result_key).await?;
            let attempt = self
                .promoted_attempt(request_id, group_idx, &descriptor.task_id)
                .await?;
            tasks.push(ResponseTask {
                task_id: descriptor.task_id.clone(),
                result_key: descriptor.result_key.clone(),
                attempt,
                stored,
            });
        }
        Ok(tasks)
    }

    /// Blocking read loop over the request-scoped consumer group until the
    /// group satisfies, fails, or hits its wall-clock deadline. Every
    /// delivered record is acknowledged; unrelated records are no-ops.
    async fn await_group_completion(
        &self,
        request_id: &str,
        group_idx: usize,
        group_name: &str,
        descriptors: &[TaskDescriptor],
        mut completed_attempts: HashMap<String, u32>,
    ) -> Result<()> {
        let expected = descriptors.len();
        let updates_group = groups::request_updates(request_id);
        let consumer = format!("orchestrator-{}", Uuid::new_v4().simple());
        let descriptor_by_task: HashMap<&str, &TaskDescriptor> = descriptors
            .iter()
            .map(|descriptor| (descriptor.task_id.as_str(), descriptor))
            .collect();

        let deadline = Instant::now() + Duration::from_millis(self.config.task_wait_timeout_ms);
        let mut conn = self.store.dedicated_connection().await?;
        let mut failures: Vec<TaskUpdate> = Vec::new();
        let mut pending_retries: u32 = 0;

        while completed_attempts.len() < expected {
            if !failures.is_empty() {
                break;
            }
            if Instant::now() > deadline {
                let detail = serde_json::json!({
                    "group": group_idx,
                    "reason": format!(
                        "timed out waiting for group {group_idx} after {}ms",
                        self.config.task_wait_timeout_ms
                    ),
                });
                self.fail_request(request_id, detail).await;
                return Err(ValuationError::Timeout(format!(
                    "group {group_idx} of request {request_id}"
                )));
            }

            let entries = match self
                .store
                .read_group(
                    &mut conn,
                    streams::TASK_UPDATES,
                    &updates_group,
                    &consumer,
                    expected.max(1),
                    self.config.request_stream_block_ms,
                )
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Update read failed; backing off");
                    tokio::time::sleep(FAULT_BACKOFF).await;
                    continue;
                }
            };

            for entry in entries {
                match TaskUpdate::from_entry(&entry) {
                    Ok(update) => {
                        // Records for other requests or stale groups must not
                        // block progress; they are acknowledged as no-ops.
                        let relevant = update.request_id == request_id
                            && update.group_idx == group_idx
                            && descriptor_by_task.contains_key(update.task_id.as_str());
                        if relevant {
                            if let Err(e) = self
                                .handle_update(
                                    request_id,
                                    group_idx,
                                    group_name,
                                    &descriptor_by_task,
                                    update,
                                    &mut completed_attempts,
                                    &mut failures,
                                    &mut pending_retries,
                                )
                                .await
                            {
                                if e.is_retryable() {
                                    // Leave unacknowledged for redelivery; a
                                    // transient datastore fault must not fail
                                    // the request.
                                    warn!(
                                        request_id = %request_id,
                                        entry_id = %entry.id,
                                        error = %e,
                                        "Datastore fault handling task update; backing off"
                                    );
                                    tokio::time::sleep(FAULT_BACKOFF).await;
                                    continue;
                                }
                                return Err(e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(entry_id = %entry.id, error = %e, "Malformed task update");
                    }
                }
                if let Err(e) = self
                    .store
                    .ack(streams::TASK_UPDATES, &updates_group, &entry.id)
                    .await
                {
                    warn!(
                        request_id = %request_id,
                        entry_id = %entry.id,
                        error = %e,
                        "Ack failed; record stays pending"
                    );
                    tokio::time::sleep(FAULT_BACKOFF).await;
                }
            }
        }

        if !failures.is_empty() {
            self.group_state
                .mark_status(request_id, group_idx, GroupStatus::Failed)
                .await?;
            let detail = serde_json::json!({
                "group": group_idx,
                "failures": failures
                    .iter()
                    .map(|f| serde_json::json!({
                        "taskId": f.task_id,
                        "attempt": f.attempt,
                        "error": f.error,
                    }))
                    .collect::<Vec<_>>(),
            });
            self.fail_request(request_id, detail).await;
            let first = &failures[0];
            return Err(ValuationError::RetryBudgetExhausted {
                task_id: first.task_id.clone(),
                attempts: first.attempt,
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_update(
        &self,
        request_id: &str,
        group_idx: usize,
        group_name: &str,
        descriptor_by_task: &HashMap<&str, &TaskDescriptor>,
        update: TaskUpdate,
        completed_attempts: &mut HashMap<String, u32>,
        failures: &mut Vec<TaskUpdate>,
        pending_retries: &mut u32,
    ) -> Result<()> {
        match update.status {
            TaskUpdateStatus::Completed => {
                let newly_completed = !completed_attempts.contains_key(&update.task_id);
                let stale = completed_attempts
                    .get(&update.task_id)
                    .is_some_and(|&recorded| update.attempt <= recorded);
                if !stale {
                    completed_attempts.insert(update.task_id.clone(), update.attempt);
                    if newly_completed {
                        self.group_state
                            .increment_completed(request_id, group_idx)
                            .await?;
                    }
                }
            }
            TaskUpdateStatus::Failed => {
                if update.attempt < self.config.max_task_retries {
                    if let Some(descriptor) = descriptor_by_task.get(update.task_id.as_str()) {
                        let retry = TaskDispatch {
                            request_id: request_id.to_string(),
                            group_idx,
                            group_name: group_name.to_string(),
                            task_id: descriptor.task_id.clone(),
                            valuation_name: descriptor.valuation_name.clone(),
                            payload_key: descriptor.payload_key.clone(),
                            result_key: descriptor.result_key.clone(),
                            attempt: update.attempt + 1,
                        };
                        self.store
                            .stream_add(streams::TASK_DISPATCH, &retry.to_fields())
                            .await?;
                        *pending_retries += 1;
                        self.store
                            .hash_incr(&keys::request_state(request_id), "retryCount", 1)
                            .await?;
                        info!(
                            request_id = %request_id,
                            task_id = %update.task_id,
                            attempt = update.attempt + 1,
                            pending_retries = *pending_retries,
                            "Task re-dispatched"
                        );
                    }
                } else {
                    self.group_state
                        .increment_failed(request_id, group_idx)
                        .await?;
                    failures.push(update);
                }
            }
        }
        Ok(())
    }

    /// Terminal failure: persist detail, flip state, broadcast, expire keys.
    /// Best-effort throughout; a datastore fault here must not mask the
    /// original error.
    async fn fail_request(&self, request_id: &str, detail: serde_json::Value) {
        let failure_key = keys::request_failure(request_id);
        if let Err(e) = self.store.set(&failure_key, &detail.to_string()).await {
            warn!(request_id = %request_id, error = %e, "Unable to persist failure detail");
        }
        if let Err(e) = self.request_state.mark_failed(request_id).await {
            warn!(request_id = %request_id, error = %e, "Unable to mark request failed");
        }
        let event = LifecycleEvent::new(request_id, LifecycleStatus::Failed)
            .with_detail("detail", detail.to_string());
        if let Err(e) = self.publish_lifecycle(event).await {
            warn!(request_id = %request_id, error = %e, "Unable to publish failure lifecycle");
        }
        self.apply_terminal_ttls(request_id).await;
    }

    /// Every key family the request owns expires together after a terminal
    /// transition.
    async fn apply_terminal_ttls(&self, request_id: &str) {
        let ttl = self.config.request_ttl_seconds;
        for pattern in [
            keys::request_cache_pattern(request_id),
            keys::task_cache_pattern(request_id),
            keys::request_state_pattern(request_id),
        ] {
            if let Err(e) = self.store.expire_pattern(&pattern, ttl).await {
                warn!(request_id = %request_id, pattern = %pattern, error = %e, "TTL sweep failed");
            }
        }
    }

    async fn publish_lifecycle(&self, event: LifecycleEvent) -> Result<()> {
        self.store
            .stream_add(streams::REQUEST_LIFECYCLE, &event.to_fields())
            .await?;
        Ok(())
    }
}
