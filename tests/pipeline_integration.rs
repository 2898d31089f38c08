//! End-to-end pipeline tests against a live Redis instance.
//!
//! All tests here are ignored by default; run them with a datastore
//! available:
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379 cargo test -- --ignored
//! ```
//!
//! Each test runs the full in-process pipeline: submission service, ingress
//! consumer, orchestrator (via the local invoker), and a task worker with a
//! scripted valuation engine. Requests are isolated by their IDs even though
//! the streams are shared.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use valuation_core::constants::{keys, streams};
use valuation_core::error::{Result, ValuationError};
use valuation_core::front::{
    IngressConsumer, ResultsOutcome, SubmissionMode, SubmissionOutcome, SubmissionService,
};
use valuation_core::messaging::{LifecycleEvent, RedisStore, TaskDispatch};
use valuation_core::orchestrator::{LocalInvoker, OrchestratorInvoker};
use valuation_core::worker::{TaskProcessor, TaskWorker, ValuationEngine};
use valuation_core::Config;

const TWO_GROUP_XML: &str = r#"<vnml><project>
  <market name="LIBOR"/>
  <group name="G0"><valuation name="a"/><valuation name="b"/><valuation name="c"/></group>
  <group name="G1"><valuation name="d"/><valuation name="e"/><valuation name="f"/></group>
</project></vnml>"#;

const SINGLE_GROUP_XML: &str =
    r#"<vnml><project><group name="G0"><t id="a"/></group></project></vnml>"#;

/// Engine scripted per task: fail the named task a fixed number of times,
/// optionally stall every task, echo the payload back as the result.
struct ScriptedEngine {
    failures: Mutex<HashMap<String, u32>>,
    invocations: AtomicU32,
    delay: Option<Duration>,
}

impl ScriptedEngine {
    fn echo() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            invocations: AtomicU32::new(0),
            delay: None,
        }
    }

    fn failing(task_marker: &str, times: u32) -> Self {
        let mut failures = HashMap::new();
        failures.insert(task_marker.to_string(), times);
        Self {
            failures: Mutex::new(failures),
            invocations: AtomicU32::new(0),
            delay: None,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            invocations: AtomicU32::new(0),
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl ValuationEngine for ScriptedEngine {
    async fn evaluate(&self, task_xml: &str) -> Result<String> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut failures = self.failures.lock().unwrap();
        for (marker, remaining) in failures.iter_mut() {
            if task_xml.contains(marker.as_str()) && *remaining > 0 {
                *remaining -= 1;
                return Err(ValuationError::Internal(format!(
                    "scripted failure for {marker}"
                )));
            }
        }
        Ok(task_xml.to_string())
    }
}

struct Pipeline {
    store: RedisStore,
    submission: SubmissionService,
    shutdown: watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    async fn start(mut config: Config, engine: Arc<dyn ValuationEngine>) -> Pipeline {
        config.redis_url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let config = Arc::new(config);
        let store = RedisStore::connect(&config.redis_url)
            .await
            .expect("Redis must be running for integration tests");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let invoker: Arc<dyn OrchestratorInvoker> =
            Arc::new(LocalInvoker::new(store.clone(), config.clone()));
        let consumer =
            IngressConsumer::new(store.clone(), config.clone(), invoker, shutdown_rx.clone());
        handles.push(tokio::spawn(async move {
            let _ = consumer.run().await;
        }));

        let processor = Arc::new(TaskProcessor::new(store.clone(), engine));
        let worker = TaskWorker::new(store.clone(), config.clone(), processor, shutdown_rx);
        handles.push(tokio::spawn(async move {
            let _ = worker.run().await;
        }));

        let submission = SubmissionService::new(store.clone(), config.clone());
        Pipeline {
            store,
            submission,
            shutdown,
            handles,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    /// All lifecycle statuses observed for one request, in stream order.
    async fn lifecycle_statuses(&self, request_id: &str) -> Vec<String> {
        let mut conn = self.store.dedicated_connection().await.unwrap();
        let mut statuses = Vec::new();
        let mut last_id = "0-0".to_string();
        loop {
            let entries = self
                .store
                .read_tail(&mut conn, streams::REQUEST_LIFECYCLE, &last_id, 50)
                .await
                .unwrap();
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                last_id = entry.id.clone();
                if let Ok(event) = LifecycleEvent::from_entry(&entry) {
                    if event.request_id == request_id {
                        statuses.push(event.status.as_str().to_string());
                    }
                }
            }
        }
        statuses
    }

    /// All dispatch attempts observed for one task, in stream order.
    async fn dispatch_attempts(&self, request_id: &str, task_marker: &str) -> Vec<u32> {
        let mut conn = self.store.dedicated_connection().await.unwrap();
        let mut attempts = Vec::new();
        let mut last_id = "0-0".to_string();
        loop {
            let entries = self
                .store
                .read_tail(&mut conn, streams::TASK_DISPATCH, &last_id, 50)
                .await
                .unwrap();
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                last_id = entry.id.clone();
                if let Ok(dispatch) = TaskDispatch::from_entry(&entry) {
                    if dispatch.request_id == request_id && dispatch.task_id.contains(task_marker) {
                        attempts.push(dispatch.attempt);
                    }
                }
            }
        }
        attempts
    }

    async fn await_terminal_status(&self, request_id: &str) -> String {
        for _ in 0..100 {
            if let Ok(view) = self.submission.status(request_id).await {
                if view.status == "succeeded" || view.status == "failed" {
                    return view.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("request {request_id} never reached a terminal status");
    }
}

fn request_id_of(outcome: &SubmissionOutcome) -> String {
    match outcome {
        SubmissionOutcome::Accepted { request_id }
        | SubmissionOutcome::Pending { request_id }
        | SubmissionOutcome::Completed { request_id, .. }
        | SubmissionOutcome::Failed { request_id, .. } => request_id.clone(),
    }
}

#[tokio::test]
#[ignore]
async fn single_group_sync_submission_succeeds_in_order() {
    let pipeline = Pipeline::start(Config::default(), Arc::new(ScriptedEngine::echo())).await;

    let outcome = pipeline
        .submission
        .submit(SINGLE_GROUP_XML, SubmissionMode::Sync, vec![], None)
        .await
        .unwrap();

    let request_id = request_id_of(&outcome);
    let SubmissionOutcome::Completed { response_xml, .. } = outcome else {
        panic!("expected sync completion, got {outcome:?}");
    };
    assert!(!response_xml.is_empty());
    assert!(response_xml.contains(&request_id));

    let statuses = pipeline.lifecycle_statuses(&request_id).await;
    assert_eq!(
        statuses,
        vec![
            "received",
            "started",
            "group_started",
            "group_completed",
            "succeeded"
        ]
    );

    // The sync response is the exact payload stored under the response key.
    let stored = pipeline
        .store
        .get(&keys::request_response(&request_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, response_xml);

    pipeline.stop().await;
}

#[tokio::test]
#[ignore]
async fn groups_run_strictly_in_sequence() {
    let pipeline = Pipeline::start(Config::default(), Arc::new(ScriptedEngine::echo())).await;

    let outcome = pipeline
        .submission
        .submit(TWO_GROUP_XML, SubmissionMode::Sync, vec![], None)
        .await
        .unwrap();
    let request_id = request_id_of(&outcome);
    assert!(matches!(outcome, SubmissionOutcome::Completed { .. }));

    let statuses = pipeline.lifecycle_statuses(&request_id).await;
    let group_events: Vec<&str> = statuses
        .iter()
        .map(String::as_str)
        .filter(|status| status.starts_with("group_"))
        .collect();
    assert_eq!(
        group_events,
        vec![
            "group_started",
            "group_completed",
            "group_started",
            "group_completed"
        ]
    );

    pipeline.stop().await;
}

#[tokio::test]
#[ignore]
async fn failing_task_is_retried_to_success() {
    // Task `d` (group 1) fails twice, then succeeds on attempt 3. The engine
    // matches on payload content, so the marker is the valuation element.
    let pipeline = Pipeline::start(
        Config::default(),
        Arc::new(ScriptedEngine::failing("name=\"d\"", 2)),
    )
    .await;

    let outcome = pipeline
        .submission
        .submit(TWO_GROUP_XML, SubmissionMode::Sync, vec![], None)
        .await
        .unwrap();
    let request_id = request_id_of(&outcome);
    assert!(matches!(outcome, SubmissionOutcome::Completed { .. }));

    let attempts = pipeline.dispatch_attempts(&request_id, "g2-t1-d").await;
    assert_eq!(attempts, vec![1, 2, 3]);

    let promoted = pipeline
        .store
        .get(&keys::task_result_attempt(&request_id, 1, "g2-t1-d"))
        .await
        .unwrap();
    assert_eq!(promoted.as_deref(), Some("3"));

    pipeline.stop().await;
}

#[tokio::test]
#[ignore]
async fn exhausted_retry_budget_fails_the_request() {
    let pipeline = Pipeline::start(
        Config::default(),
        Arc::new(ScriptedEngine::failing("id=\"a\"", 99)),
    )
    .await;

    let outcome = pipeline
        .submission
        .submit(SINGLE_GROUP_XML, SubmissionMode::Sync, vec![], None)
        .await
        .unwrap();
    let request_id = request_id_of(&outcome);
    let SubmissionOutcome::Failed { detail, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(detail.is_some());

    // No attempt beyond the budget was ever dispatched.
    let attempts = pipeline.dispatch_attempts(&request_id, "g1-t1-a").await;
    assert_eq!(attempts, vec![1, 2, 3]);

    let failure = pipeline
        .store
        .get(&keys::request_failure(&request_id))
        .await
        .unwrap();
    assert!(failure.is_some());

    match pipeline.submission.results(&request_id).await.unwrap() {
        ResultsOutcome::Failed { detail } => assert!(detail.is_some()),
        other => panic!("expected failed results, got {other:?}"),
    }

    pipeline.stop().await;
}

#[tokio::test]
#[ignore]
async fn sync_timeout_returns_pending_then_completes() {
    let mut config = Config::default();
    config.sync_wait_timeout_ms = 500;
    let pipeline = Pipeline::start(
        config,
        Arc::new(ScriptedEngine::slow(Duration::from_secs(1))),
    )
    .await;

    let outcome = pipeline
        .submission
        .submit(SINGLE_GROUP_XML, SubmissionMode::Sync, vec![], None)
        .await
        .unwrap();
    let request_id = request_id_of(&outcome);
    assert!(matches!(outcome, SubmissionOutcome::Pending { .. }));

    // Processing continues past the sync deadline.
    let status = pipeline.await_terminal_status(&request_id).await;
    assert_eq!(status, "succeeded");

    pipeline.stop().await;
}

#[tokio::test]
#[ignore]
async fn idempotency_key_reuses_the_original_request() {
    let pipeline = Pipeline::start(Config::default(), Arc::new(ScriptedEngine::echo())).await;
    let key = format!("idem-{}", uuid::Uuid::new_v4());

    let first = pipeline
        .submission
        .submit(SINGLE_GROUP_XML, SubmissionMode::Async, vec![], Some(&key))
        .await
        .unwrap();
    let first_id = request_id_of(&first);

    let second = pipeline
        .submission
        .submit(SINGLE_GROUP_XML, SubmissionMode::Async, vec![], Some(&key))
        .await
        .unwrap();
    assert_eq!(request_id_of(&second), first_id);

    pipeline.await_terminal_status(&first_id).await;
    let received_events = pipeline
        .lifecycle_statuses(&first_id)
        .await
        .into_iter()
        .filter(|status| status == "received")
        .count();
    assert_eq!(received_events, 1);

    // A different payload under the same key is a conflict.
    let conflict = pipeline
        .submission
        .submit(TWO_GROUP_XML, SubmissionMode::Async, vec![], Some(&key))
        .await;
    assert!(matches!(
        conflict,
        Err(ValuationError::IdempotencyConflict(_))
    ));

    pipeline.stop().await;
}

#[tokio::test]
#[ignore]
async fn terminal_requests_expire_their_keys() {
    let pipeline = Pipeline::start(Config::default(), Arc::new(ScriptedEngine::echo())).await;

    let outcome = pipeline
        .submission
        .submit(SINGLE_GROUP_XML, SubmissionMode::Sync, vec![], None)
        .await
        .unwrap();
    let request_id = request_id_of(&outcome);
    assert!(matches!(outcome, SubmissionOutcome::Completed { .. }));

    for key in [
        keys::request_xml(&request_id),
        keys::request_response(&request_id),
        keys::request_state(&request_id),
        keys::task_result(&request_id, 0, "g1-t1-a"),
    ] {
        let ttl = pipeline.store.ttl(&key).await.unwrap();
        assert!(ttl > 0, "expected a TTL on {key}, got {ttl}");
    }

    // Once the response is gone, the results query reports expiry.
    pipeline
        .store
        .delete(&keys::request_response(&request_id))
        .await
        .unwrap();
    assert!(matches!(
        pipeline.submission.results(&request_id).await,
        Err(ValuationError::Gone(_))
    ));

    pipeline.stop().await;
}

#[tokio::test]
#[ignore]
async fn async_round_trip_matches_sync_submission() {
    let pipeline = Pipeline::start(Config::default(), Arc::new(ScriptedEngine::echo())).await;

    let async_outcome = pipeline
        .submission
        .submit(TWO_GROUP_XML, SubmissionMode::Async, vec![], None)
        .await
        .unwrap();
    let async_id = request_id_of(&async_outcome);
    assert!(matches!(async_outcome, SubmissionOutcome::Accepted { .. }));
    assert_eq!(pipeline.await_terminal_status(&async_id).await, "succeeded");

    let ResultsOutcome::Ready(async_xml) = pipeline.submission.results(&async_id).await.unwrap()
    else {
        panic!("async results not ready");
    };

    let sync_outcome = pipeline
        .submission
        .submit(TWO_GROUP_XML, SubmissionMode::Sync, vec![], None)
        .await
        .unwrap();
    let sync_id = request_id_of(&sync_outcome);
    let SubmissionOutcome::Completed {
        response_xml: sync_xml,
        ..
    } = sync_outcome
    else {
        panic!("sync submission did not complete");
    };

    // Identical up to the embedded request identifiers and per-request keys.
    let normalized_async = async_xml.replace(&async_id, "REQ");
    let normalized_sync = sync_xml.replace(&sync_id, "REQ");
    assert_eq!(normalized_async, normalized_sync);

    pipeline.stop().await;
}

#[tokio::test]
#[ignore]
async fn status_query_reports_progress_fields() {
    let pipeline = Pipeline::start(Config::default(), Arc::new(ScriptedEngine::echo())).await;

    let outcome = pipeline
        .submission
        .submit(TWO_GROUP_XML, SubmissionMode::Sync, vec![], None)
        .await
        .unwrap();
    let request_id = request_id_of(&outcome);

    let view = pipeline.submission.status(&request_id).await.unwrap();
    assert_eq!(view.status, "succeeded");
    assert_eq!(view.group_count, Some(2));
    assert_eq!(view.current_group, Some(1));
    assert!(view.completed_at.is_some());

    assert!(matches!(
        pipeline.submission.status("no-such-request").await,
        Err(ValuationError::NotFound(_))
    ));

    pipeline.stop().await;
}
