//! End-to-end engine scenarios against the in-memory store
//!
//! The worker loops are driven by hand (`run_*_once`) with a manual clock,
//! so wait deadlines, stuck-step recovery and idempotency expiry are all
//! deterministic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};

use flowstate_engine::clock::{Clock, ManualClock};
use flowstate_engine::service::{EngineError, ExecutionService, StartOutcome};
use flowstate_engine::store::{
    memory::InMemoryExecutionStore, ExecutionFilter, ExecutionStatus, ExecutionStore, StepStatus,
    StoreTx,
};
use flowstate_engine::task::{TaskContext, TaskHandler, TaskRegistry, TaskResult};
use flowstate_engine::worker::{run_dispatch_once, run_reap_once, run_wake_once};

// ============================================
// Harness
// ============================================

/// Handler that echoes its input with `processedAt: 1` added
struct StampHandler;

#[async_trait]
impl TaskHandler for StampHandler {
    async fn execute(&self, _ctx: TaskContext, input: Value) -> TaskResult {
        let mut output = input.as_object().cloned().unwrap_or_default();
        output.insert("processedAt".to_string(), json!(1));
        TaskResult::success(Value::Object(output))
    }
}

/// Handler that echoes its input unchanged
struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, _ctx: TaskContext, input: Value) -> TaskResult {
        TaskResult::success(input)
    }
}

struct Harness {
    store: Arc<InMemoryExecutionStore>,
    registry: Arc<TaskRegistry>,
    clock: ManualClock,
    service: ExecutionService,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryExecutionStore::new());
    let clock = ManualClock::new(start_time());

    let mut registry = TaskRegistry::new();
    registry.register("mock", Arc::new(StampHandler));
    registry.register("echo", Arc::new(EchoHandler));
    let registry = Arc::new(registry);

    let store_dyn: Arc<dyn ExecutionStore> = store.clone();
    let clock_dyn: Arc<dyn Clock> = Arc::new(clock.clone());
    let service = ExecutionService::new(store_dyn, clock_dyn);

    Harness {
        store,
        registry,
        clock,
        service,
    }
}

async fn register(h: &Harness, name: &str, version: &str, definition: Value) {
    h.service
        .register_workflow(name, version, None, definition)
        .await
        .expect("registration should succeed");
}

/// Run dispatch polls until a poll consumes nothing. The clock ticks one
/// millisecond per poll so rows created mid-drain get distinct timestamps.
async fn drain(h: &Harness, batch_size: i64) {
    for _ in 0..100 {
        let consumed = run_dispatch_once(
            h.store.as_ref(),
            &h.registry,
            &h.clock,
            batch_size,
        )
        .await
        .expect("dispatch poll should succeed");
        h.clock.advance(Duration::milliseconds(1));
        if consumed == 0 {
            return;
        }
    }
    panic!("drain did not quiesce");
}

async fn start(h: &Harness, workflow: &str, input: Value) -> String {
    match h
        .service
        .start_execution(workflow, None, input, None)
        .await
        .expect("start should succeed")
    {
        StartOutcome::Started(view) => view.execution_id,
        StartOutcome::Existing(_) => panic!("expected a fresh execution"),
    }
}

fn linear_definition() -> Value {
    json!({
        "startAt": "a",
        "states": {
            "a": {"type": "Task", "resource": "mock", "next": "b"},
            "b": {"type": "Task", "resource": "mock", "next": "c"},
            "c": {"type": "Success"}
        }
    })
}

fn choice_definition() -> Value {
    json!({
        "startAt": "a",
        "states": {
            "a": {"type": "Task", "resource": "echo", "next": "dec"},
            "dec": {
                "type": "Choice",
                "choices": [
                    {"condition": {"operator": "booleanEquals", "variable": "$.inStock", "value": true},
                     "next": "ok"}
                ],
                "defaultChoice": "bad"
            },
            "ok": {"type": "Success"},
            "bad": {"type": "Fail", "error": "OOS"}
        }
    })
}

fn wait_definition(seconds: i64) -> Value {
    json!({
        "startAt": "a",
        "states": {
            "a": {"type": "Task", "resource": "echo", "next": "w"},
            "w": {"type": "Wait", "seconds": seconds, "next": "done"},
            "done": {"type": "Success"}
        }
    })
}

// ============================================
// Scenario A: linear task chain
// ============================================

#[tokio::test]
async fn linear_chain_completes_with_merged_output() {
    let h = harness();
    register(&h, "linear", "1.0.0", linear_definition()).await;

    let execution_id = start(&h, "linear", json!({"orderId": "X"})).await;
    drain(&h, 10).await;

    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.output,
        Some(json!({"orderId": "X", "processedAt": 1}))
    );
    assert!(execution.completed_at.is_some());

    let steps = h.store.list_steps(execution.id).await.unwrap();
    let names: Vec<&str> = steps.iter().map(|s| s.step_name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

    let history = h.service.list_history(&execution_id).await.unwrap();
    let events: Vec<(&str, Option<&str>)> = history
        .iter()
        .map(|e| (e.event_type.as_str(), e.step_name.as_deref()))
        .collect();
    assert_eq!(
        events,
        vec![
            ("EXECUTION_STARTED", Some("a")),
            ("STEP_STARTED", Some("a")),
            ("STEP_COMPLETED", Some("a")),
            ("NEXT_STATE_QUEUED", Some("b")),
            ("STEP_STARTED", Some("b")),
            ("STEP_COMPLETED", Some("b")),
            ("NEXT_STATE_QUEUED", Some("c")),
            ("STEP_STARTED", Some("c")),
            ("STEP_COMPLETED", Some("c")),
            ("EXECUTION_COMPLETED", Some("c")),
        ]
    );

    // Terminal executions leave no queue rows behind.
    assert_eq!(h.store.queue_depth(), 0);
}

// ============================================
// Scenario B: choice branches
// ============================================

#[tokio::test]
async fn choice_routes_to_success_branch() {
    let h = harness();
    register(&h, "stock-check", "1.0.0", choice_definition()).await;

    let execution_id = start(&h, "stock-check", json!({"inStock": true})).await;
    drain(&h, 10).await;

    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(json!({"inStock": true})));
    assert_eq!(execution.current_state, "ok");
}

#[tokio::test]
async fn choice_default_routes_to_fail_state() {
    let h = harness();
    register(&h, "stock-check", "1.0.0", choice_definition()).await;

    let execution_id = start(&h, "stock-check", json!({"inStock": false})).await;
    drain(&h, 10).await;

    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_message.as_deref(), Some("OOS"));

    // The Fail state's step completed; it is the execution that failed.
    let steps = h.store.list_steps(execution.id).await.unwrap();
    let bad = steps.iter().find(|s| s.step_name == "bad").unwrap();
    assert_eq!(bad.status, StepStatus::Completed);

    let history = h.service.list_history(&execution_id).await.unwrap();
    assert_eq!(
        history.last().map(|e| e.event_type.as_str()),
        Some("EXECUTION_FAILED")
    );
}

// ============================================
// Scenario C: wait scheduling
// ============================================

#[tokio::test]
async fn wait_step_is_not_claimable_before_its_deadline() {
    let h = harness();
    register(&h, "waiting", "1.0.0", wait_definition(2)).await;

    let execution_id = start(&h, "waiting", json!({"orderId": "X"})).await;
    drain(&h, 1).await;

    // The wait step is parked WAITING with a time-gated queue row.
    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.current_state, "w");
    let steps = h.store.list_steps(execution.id).await.unwrap();
    let wait_step = steps.iter().find(|s| s.step_name == "w").unwrap();
    assert_eq!(wait_step.status, StepStatus::Waiting);
    assert!(wait_step.run_after_ts.is_some());

    // Neither dispatch nor wake touch it before the deadline.
    let consumed = run_dispatch_once(h.store.as_ref(), &h.registry, &h.clock, 1)
        .await
        .unwrap();
    assert_eq!(consumed, 0);
    let released = run_wake_once(h.store.as_ref(), &h.clock, 10).await.unwrap();
    assert_eq!(released, 0);

    // Past the deadline the wake loop releases it and dispatch finishes.
    h.clock.advance(Duration::seconds(2));
    let released = run_wake_once(h.store.as_ref(), &h.clock, 10).await.unwrap();
    assert_eq!(released, 1);
    drain(&h, 1).await;

    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    let output = execution.output.unwrap();
    assert_eq!(output["waitCompleted"], json!(true));
    assert_eq!(output["orderId"], json!("X"));

    let history = h.service.list_history(&execution_id).await.unwrap();
    assert!(history.iter().any(|e| e.event_type == "WAIT_COMPLETED"));
}

#[tokio::test]
async fn zero_second_wait_is_immediately_due() {
    let h = harness();
    register(&h, "no-wait", "1.0.0", wait_definition(0)).await;

    let execution_id = start(&h, "no-wait", json!({})).await;
    drain(&h, 10).await;
    let released = run_wake_once(h.store.as_ref(), &h.clock, 10).await.unwrap();
    assert_eq!(released, 1);
    drain(&h, 10).await;

    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn past_timestamp_wait_is_immediately_due() {
    let h = harness();
    register(
        &h,
        "past-wait",
        "1.0.0",
        json!({
            "startAt": "w",
            "states": {
                "w": {"type": "Wait", "timestamp": "2020-01-01T00:00:00Z", "next": "done"},
                "done": {"type": "Success"}
            }
        }),
    )
    .await;

    let execution_id = start(&h, "past-wait", json!({})).await;
    let released = run_wake_once(h.store.as_ref(), &h.clock, 10).await.unwrap();
    assert_eq!(released, 1);
    drain(&h, 10).await;

    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn unparseable_wait_timestamp_fails_the_execution() {
    let h = harness();
    register(
        &h,
        "bad-wait",
        "1.0.0",
        json!({
            "startAt": "a",
            "states": {
                "a": {"type": "Task", "resource": "echo", "next": "w"},
                "w": {"type": "Wait", "timestamp": "tomorrow-ish", "next": "done"},
                "done": {"type": "Success"}
            }
        }),
    )
    .await;

    let execution_id = start(&h, "bad-wait", json!({})).await;
    drain(&h, 10).await;

    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution
        .error_message
        .unwrap()
        .contains("invalid wait timestamp"));
}

// ============================================
// Scenario D: stuck-step recovery
// ============================================

#[tokio::test]
async fn reaper_requeues_a_step_whose_worker_died() {
    let h = harness();
    register(&h, "linear", "1.0.0", linear_definition()).await;
    let execution_id = start(&h, "linear", json!({"orderId": "X"})).await;

    // Run step `a`; step `b` is now the queued frontier.
    let consumed = run_dispatch_once(h.store.as_ref(), &h.registry, &h.clock, 10)
        .await
        .unwrap();
    assert_eq!(consumed, 1);

    // Simulate a worker that marked `b` RUNNING, consumed its queue row and
    // died before persisting any outcome.
    let execution = h
        .store
        .find_execution_by_execution_id(&execution_id)
        .await
        .unwrap()
        .unwrap();
    let mut tx = h.store.begin().await.unwrap();
    let mut step_b = tx.step_by_name(execution.id, "b").await.unwrap().unwrap();
    step_b.status = StepStatus::Running;
    step_b.started_at = Some(h.clock.now());
    tx.update_step(&step_b).await.unwrap();
    let row = tx
        .queue_item_for_execution(execution.id)
        .await
        .unwrap()
        .unwrap();
    tx.delete_queue_item(row.id).await.unwrap();
    tx.commit().await.unwrap();

    // Not yet stuck: nothing happens.
    let recovered = run_reap_once(h.store.as_ref(), &h.clock, Duration::minutes(30), 10)
        .await
        .unwrap();
    assert_eq!(recovered, 0);

    // Past the stuck threshold the step is reset and requeued.
    h.clock.advance(Duration::minutes(31));
    let recovered = run_reap_once(h.store.as_ref(), &h.clock, Duration::minutes(30), 10)
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let steps = h.store.list_steps(execution.id).await.unwrap();
    let step_b = steps.iter().find(|s| s.step_name == "b").unwrap();
    assert_eq!(step_b.status, StepStatus::Pending);
    assert!(step_b.started_at.is_none());
    assert_eq!(h.store.queue_depth(), 1);

    // The execution runs to completion after recovery.
    drain(&h, 10).await;
    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let history = h.service.list_history(&execution_id).await.unwrap();
    let b_events: Vec<&str> = history
        .iter()
        .filter(|e| e.step_name.as_deref() == Some("b"))
        .map(|e| e.event_type.as_str())
        .collect();
    assert_eq!(
        b_events,
        vec![
            "NEXT_STATE_QUEUED",
            "STEP_RECOVERED",
            "STEP_STARTED",
            "STEP_COMPLETED",
        ]
    );
}

// ============================================
// Scenario E: concurrent dispatchers
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatchers_drive_every_execution_exactly_once() {
    let h = harness();
    register(&h, "linear", "1.0.0", linear_definition()).await;

    let mut execution_ids = Vec::new();
    for i in 0..100 {
        execution_ids.push(start(&h, "linear", json!({"n": i})).await);
    }

    let mut loops = Vec::new();
    for _ in 0..8 {
        let store = h.store.clone();
        let registry = h.registry.clone();
        let clock = h.clock.clone();
        loops.push(tokio::spawn(async move {
            loop {
                run_dispatch_once(store.as_ref(), &registry, &clock, 5)
                    .await
                    .expect("dispatch poll should succeed");
                tokio::task::yield_now().await;
            }
        }));
    }

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(20);
    loop {
        let running = h
            .store
            .list_executions(&ExecutionFilter {
                statuses: Some(vec![ExecutionStatus::Running]),
                limit: 1000,
                ..Default::default()
            })
            .await
            .unwrap();
        if running.is_empty() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "{} executions still running",
            running.len()
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    for handle in &loops {
        handle.abort();
    }

    for execution_id in &execution_ids {
        let execution = h.service.get_execution(execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);

        // Exactly one STEP_STARTED per step; no duplicate processing.
        let history = h.service.list_history(execution_id).await.unwrap();
        for step_name in ["a", "b", "c"] {
            let starts = history
                .iter()
                .filter(|e| {
                    e.event_type == "STEP_STARTED" && e.step_name.as_deref() == Some(step_name)
                })
                .count();
            assert_eq!(starts, 1, "step {step_name} of {execution_id}");
        }
    }
}

// ============================================
// Scenario F: idempotent start
// ============================================

#[tokio::test]
async fn idempotency_key_returns_the_same_execution_until_it_expires() {
    let h = harness();
    register(&h, "linear", "1.0.0", linear_definition()).await;

    let first = h
        .service
        .start_execution("linear", None, json!({"orderId": "X"}), Some("k1"))
        .await
        .unwrap();
    let StartOutcome::Started(first_view) = first else {
        panic!("expected a fresh execution");
    };

    let second = h
        .service
        .start_execution("linear", None, json!({"orderId": "X"}), Some("k1"))
        .await
        .unwrap();
    let StartOutcome::Existing(second_view) = second else {
        panic!("expected the existing execution");
    };
    assert_eq!(second_view.execution_id, first_view.execution_id);

    let all = h
        .service
        .list_executions(&ExecutionFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    // Past the 24h TTL the key no longer matches.
    h.clock.advance(Duration::hours(25));
    let third = h
        .service
        .start_execution("linear", None, json!({"orderId": "X"}), Some("k1"))
        .await
        .unwrap();
    let StartOutcome::Started(third_view) = third else {
        panic!("expected a fresh execution after expiry");
    };
    assert_ne!(third_view.execution_id, first_view.execution_id);
}

// ============================================
// Cancellation
// ============================================

#[tokio::test]
async fn cancel_removes_queued_work_and_locks_the_execution() {
    let h = harness();
    register(&h, "waiting", "1.0.0", wait_definition(60)).await;

    let execution_id = start(&h, "waiting", json!({})).await;
    drain(&h, 10).await;

    let view = h.service.cancel_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, ExecutionStatus::Cancelled);
    assert_eq!(h.store.queue_depth(), 0);

    // The parked wait step is never released.
    h.clock.advance(Duration::seconds(61));
    let released = run_wake_once(h.store.as_ref(), &h.clock, 10).await.unwrap();
    assert_eq!(released, 0);

    let history = h.service.list_history(&execution_id).await.unwrap();
    assert_eq!(
        history.last().map(|e| e.event_type.as_str()),
        Some("EXECUTION_CANCELLED")
    );

    // Cancelling again is an InvalidState error with no state change.
    let err = h.service.cancel_execution(&execution_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
    let view = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(view.status, ExecutionStatus::Cancelled);
}

// ============================================
// Failure paths
// ============================================

#[tokio::test]
async fn unknown_resource_fails_the_execution() {
    let h = harness();
    register(
        &h,
        "ghostly",
        "1.0.0",
        json!({
            "startAt": "a",
            "states": {
                "a": {"type": "Task", "resource": "ghost.service", "next": "b"},
                "b": {"type": "Success"}
            }
        }),
    )
    .await;

    let execution_id = start(&h, "ghostly", json!({})).await;
    drain(&h, 10).await;

    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);

    let steps = h.store.list_steps(execution.id).await.unwrap();
    assert_eq!(steps[0].error_type.as_deref(), Some("UnknownHandler"));
    assert_eq!(steps[0].status, StepStatus::Failed);
}

#[tokio::test]
async fn choice_without_match_or_default_fails_with_choice_error() {
    let h = harness();
    register(
        &h,
        "no-default",
        "1.0.0",
        json!({
            "startAt": "dec",
            "states": {
                "dec": {
                    "type": "Choice",
                    "choices": [
                        {"condition": {"operator": "booleanEquals", "variable": "$.flag", "value": true},
                         "next": "done"}
                    ]
                },
                "done": {"type": "Success"}
            }
        }),
    )
    .await;

    let execution_id = start(&h, "no-default", json!({"flag": false})).await;
    drain(&h, 10).await;

    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);

    let steps = h.store.list_steps(execution.id).await.unwrap();
    assert_eq!(steps[0].error_type.as_deref(), Some("ChoiceError"));
}

#[tokio::test]
async fn missing_variable_routes_to_default() {
    let h = harness();
    register(&h, "stock-check", "1.0.0", choice_definition()).await;

    // No `inStock` key at all: the condition is false, the default wins.
    let execution_id = start(&h, "stock-check", json!({"somethingElse": 1})).await;
    drain(&h, 10).await;

    let execution = h.service.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_message.as_deref(), Some("OOS"));
}

// ============================================
// Start-time errors
// ============================================

#[tokio::test]
async fn start_errors_for_unknown_workflow_and_version() {
    let h = harness();
    register(&h, "linear", "1.0.0", linear_definition()).await;

    let err = h
        .service
        .start_execution("nope", None, json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WorkflowNotFound(_)));

    let err = h
        .service
        .start_execution("linear", Some("9.9.9"), json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::VersionNotFound { .. }));
}

#[tokio::test]
async fn latest_version_is_lexicographic_descending() {
    let h = harness();
    register(&h, "linear", "1.0.0", linear_definition()).await;
    register(&h, "linear", "1.10.0", linear_definition()).await;
    register(&h, "linear", "1.9.0", linear_definition()).await;

    let execution_id = start(&h, "linear", json!({})).await;
    let view = h.service.get_execution(&execution_id).await.unwrap();
    // Lexicographic, not semantic: "1.9.0" > "1.10.0".
    assert_eq!(view.version, "1.9.0");
}

#[tokio::test]
async fn duplicate_version_registration_is_rejected() {
    let h = harness();
    register(&h, "linear", "1.0.0", linear_definition()).await;

    let err = h
        .service
        .register_workflow("linear", "1.0.0", None, linear_definition())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateVersion { .. }));
}

#[tokio::test]
async fn invalid_definition_is_rejected_at_registration() {
    let h = harness();
    let err = h
        .service
        .register_workflow(
            "broken",
            "1.0.0",
            None,
            json!({"startAt": "ghost", "states": {"a": {"type": "Success"}}}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Definition(_)));
}

// ============================================
// Batch-size invariance
// ============================================

#[tokio::test]
async fn batch_size_does_not_change_final_states() {
    let mut outcomes = Vec::new();

    for batch_size in [1, 100] {
        let h = harness();
        register(&h, "linear", "1.0.0", linear_definition()).await;
        register(&h, "stock-check", "1.0.0", choice_definition()).await;

        let mut ids = Vec::new();
        ids.push(start(&h, "linear", json!({"orderId": "A"})).await);
        ids.push(start(&h, "stock-check", json!({"inStock": true})).await);
        ids.push(start(&h, "stock-check", json!({"inStock": false})).await);
        drain(&h, batch_size).await;

        let mut snapshot = Vec::new();
        for id in ids {
            let view = h.service.get_execution(&id).await.unwrap();
            snapshot.push((view.status, view.output, view.error_message));
        }
        outcomes.push(snapshot);
    }

    assert_eq!(outcomes[0], outcomes[1]);
}
