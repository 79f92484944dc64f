//! Dispatch loop: drain the execution queue
//!
//! One poll claims a batch of due queue rows and drives each row's execution
//! forward by exactly one state. The claim transaction keeps the rows locked
//! for the whole poll; a worker that dies mid-poll releases them on rollback
//! and another poller picks them up unchanged.
//!
//! Per row there are three phases: a preflight-and-mark transaction (loads
//! the execution and frontier step under row locks, marks the step RUNNING),
//! the interpreter call with no step/execution locks held, and an outcome
//! transaction that re-locks, re-checks for cancellation or recovery, and
//! persists the transition.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, instrument, warn};

use crate::clock::Clock;
use crate::definition::{StateDef, StateType, WorkflowDefinition};
use crate::interpreter::{interpret_state, resolve_next};
use crate::merge::shallow_merge;
use crate::store::{
    EventType, ExecutionRow, ExecutionStatus, ExecutionStore, NewStep, QueueItemRow, StepRow,
    StepStatus, StoreError, StoreTx,
};
use crate::task::{TaskRegistry, TaskResult};

/// What to do with a claimed queue row once its processing attempt finished
enum ItemOutcome {
    /// The row's work is done (or the row is stale); delete it
    Consumed,
    /// The row is not ours to consume (Wait rows, transient errors); put it
    /// back for a later poll
    Released,
}

/// Run one dispatch poll. Returns the number of queue rows consumed.
#[instrument(skip_all)]
pub async fn run_dispatch_once(
    store: &dyn ExecutionStore,
    registry: &TaskRegistry,
    clock: &dyn Clock,
    batch_size: i64,
) -> Result<usize, StoreError> {
    let now = clock.now();

    let mut claim_tx = store.begin().await?;
    let items = claim_tx.claim_batch(now, batch_size).await?;
    if items.is_empty() {
        claim_tx.rollback().await?;
        return Ok(0);
    }
    debug!(count = items.len(), "processing claimed queue items");

    let mut consumed = 0;
    for item in &items {
        match process_queue_item(store, registry, clock, item).await {
            Ok(ItemOutcome::Consumed) => {
                claim_tx.delete_queue_item(item.id).await?;
                consumed += 1;
            }
            Ok(ItemOutcome::Released) => {
                claim_tx.release_queue_item(item.id).await?;
            }
            Err(e) => {
                // Transient store failure on this row; release it so a later
                // poll retries, and keep going with the rest of the batch.
                error!(queue_item = %item.id, "error processing queue item: {e}");
                claim_tx.release_queue_item(item.id).await?;
            }
        }
    }

    claim_tx.commit().await?;
    Ok(consumed)
}

async fn process_queue_item(
    store: &dyn ExecutionStore,
    registry: &TaskRegistry,
    clock: &dyn Clock,
    item: &QueueItemRow,
) -> Result<ItemOutcome, StoreError> {
    let now = clock.now();
    let mut tx = store.begin().await?;

    // Lock-free preflight: Wait rows must be handed back without contending
    // for the execution row the wake loop may hold.
    let Some(execution) = tx.execution(item.execution_id).await? else {
        tx.rollback().await?;
        return Ok(ItemOutcome::Consumed);
    };
    if execution.status != ExecutionStatus::Running {
        debug!(execution_id = %execution.execution_id, status = %execution.status, "skipping non-running execution");
        tx.rollback().await?;
        return Ok(ItemOutcome::Consumed);
    }
    if let Some(probe) = tx.step_by_name(execution.id, &execution.current_state).await? {
        if probe.step_type == StateType::Wait {
            tx.rollback().await?;
            return Ok(ItemOutcome::Released);
        }
    }

    // Locked pass: everything below serializes against cancellation.
    let Some(mut execution) = tx.execution_for_update(execution.id).await? else {
        tx.rollback().await?;
        return Ok(ItemOutcome::Consumed);
    };
    if execution.status != ExecutionStatus::Running {
        tx.rollback().await?;
        return Ok(ItemOutcome::Consumed);
    }

    let Some(mut step) = tx
        .step_by_name_for_update(execution.id, &execution.current_state)
        .await?
    else {
        // An execution without its frontier step row is unrecoverable.
        let message = format!(
            "no step row for current state '{}'",
            execution.current_state
        );
        error!(execution_id = %execution.execution_id, "{message}");
        fail_execution(tx.as_mut(), &mut execution, &message, now).await?;
        tx.commit().await?;
        return Ok(ItemOutcome::Consumed);
    };

    if step.step_type == StateType::Wait {
        tx.rollback().await?;
        return Ok(ItemOutcome::Released);
    }
    if step.status.is_terminal() {
        // Stale row left by a crash after the outcome committed but before
        // the queue delete; consuming it restores the single-frontier shape.
        debug!(step = %step.step_name, status = %step.status, "dropping stale queue row");
        tx.rollback().await?;
        return Ok(ItemOutcome::Consumed);
    }

    let Some(version) = tx.version(execution.workflow_version_id).await? else {
        let message = format!(
            "workflow version {} not found",
            execution.workflow_version_id
        );
        fail_execution(tx.as_mut(), &mut execution, &message, now).await?;
        tx.commit().await?;
        return Ok(ItemOutcome::Consumed);
    };

    step.status = StepStatus::Running;
    step.started_at = Some(now);
    tx.update_step(&step).await?;
    tx.append_history(
        execution.id,
        Some(&step.step_name),
        EventType::StepStarted,
        json!({ "stepType": step.step_type.as_str() }),
        now,
    )
    .await?;
    tx.commit().await?;

    // Interpret with no step/execution locks held; a handler can take as
    // long as it likes without blocking cancellation or the other loops.
    let definition = match WorkflowDefinition::parse(&version.definition) {
        Ok(definition) => definition,
        Err(e) => {
            record_step_error(store, clock, execution.id, step.id, &e.to_string()).await?;
            return Ok(ItemOutcome::Consumed);
        }
    };
    let Some(state) = definition.state(&step.step_name) else {
        let message = format!("state '{}' is not present in the definition", step.step_name);
        record_step_error(store, clock, execution.id, step.id, &message).await?;
        return Ok(ItemOutcome::Consumed);
    };

    let result = interpret_state(state, &step, &execution.execution_id, registry, clock).await;

    apply_outcome(store, clock, &definition, state, execution.id, step.id, result).await?;
    Ok(ItemOutcome::Consumed)
}

/// Persist the result of one interpreted state.
async fn apply_outcome(
    store: &dyn ExecutionStore,
    clock: &dyn Clock,
    definition: &WorkflowDefinition,
    state: &StateDef,
    execution_id: uuid::Uuid,
    step_id: uuid::Uuid,
    result: TaskResult,
) -> Result<(), StoreError> {
    let now = clock.now();
    let mut tx = store.begin().await?;

    let Some(mut execution) = tx.execution_for_update(execution_id).await? else {
        tx.rollback().await?;
        return Ok(());
    };
    if execution.status != ExecutionStatus::Running {
        // Cancelled (or otherwise terminated) while the handler ran. The
        // in-flight result is dropped; nothing further may be scheduled.
        debug!(execution_id = %execution.execution_id, status = %execution.status, "dropping outcome of terminated execution");
        tx.rollback().await?;
        return Ok(());
    }

    let Some(mut step) = tx.step_for_update(step_id).await? else {
        tx.rollback().await?;
        return Ok(());
    };
    if step.status != StepStatus::Running {
        warn!(step = %step.step_name, status = %step.status, "step was recovered while its worker was busy; dropping outcome");
        tx.rollback().await?;
        return Ok(());
    }

    match result {
        TaskResult::Success { output } => {
            step.status = StepStatus::Completed;
            step.output = Some(output.clone());
            step.completed_at = Some(now);
            tx.update_step(&step).await?;
            tx.append_history(
                execution.id,
                Some(&step.step_name),
                EventType::StepCompleted,
                json!({ "output": output }),
                now,
            )
            .await?;

            // A Choice's output is routing data, not payload; the successor
            // receives the Choice's input untouched.
            let carry = if step.step_type == StateType::Choice {
                Value::Null
            } else {
                output.clone()
            };
            match resolve_next(state, &output) {
                Some(next_name) if definition.state(&next_name).is_some() => {
                    schedule_next(
                        tx.as_mut(),
                        &mut execution,
                        &step,
                        definition,
                        &next_name,
                        &carry,
                        now,
                    )
                    .await?;
                }
                _ => {
                    execution.status = ExecutionStatus::Completed;
                    execution.output = Some(output.clone());
                    execution.completed_at = Some(now);
                    tx.update_execution(&execution).await?;
                    tx.append_history(
                        execution.id,
                        Some(&step.step_name),
                        EventType::ExecutionCompleted,
                        json!({ "finalOutput": output }),
                        now,
                    )
                    .await?;
                }
            }
        }
        TaskResult::Failure {
            error_type,
            error_message,
        } => {
            if step.step_type == StateType::Fail {
                // A Fail state did its job; the step completed, the
                // execution is what failed.
                step.status = StepStatus::Completed;
                step.completed_at = Some(now);
                tx.update_step(&step).await?;
                tx.append_history(
                    execution.id,
                    Some(&step.step_name),
                    EventType::StepCompleted,
                    json!({ "error": error_message }),
                    now,
                )
                .await?;
            } else {
                step.status = StepStatus::Failed;
                step.error_type = Some(error_type.clone());
                step.error_message = Some(error_message.clone());
                step.completed_at = Some(now);
                tx.update_step(&step).await?;
                tx.append_history(
                    execution.id,
                    Some(&step.step_name),
                    EventType::StepFailed,
                    json!({ "errorType": error_type, "errorMessage": error_message }),
                    now,
                )
                .await?;
            }

            execution.status = ExecutionStatus::Failed;
            execution.error_message = Some(error_message.clone());
            execution.completed_at = Some(now);
            tx.update_execution(&execution).await?;
            tx.append_history(
                execution.id,
                Some(&step.step_name),
                EventType::ExecutionFailed,
                json!({ "errorMessage": error_message }),
                now,
            )
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Create the successor step and queue row and advance the frontier pointer.
///
/// The successor's input is `shallow_merge(current step input, output)`. Wait
/// successors are created WAITING with their deadline on both the step and
/// the queue row, so they are not claimable until due.
pub(crate) async fn schedule_next(
    tx: &mut dyn StoreTx,
    execution: &mut ExecutionRow,
    step: &StepRow,
    definition: &WorkflowDefinition,
    next_name: &str,
    output: &Value,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let next_state = definition
        .state(next_name)
        .expect("caller verified the successor exists");

    let (status, run_after_ts) = match next_state {
        StateDef::Wait(wait) => match wait.deadline(next_name, now) {
            Ok(deadline) => (StepStatus::Waiting, Some(deadline)),
            Err(e) => {
                // Unparseable wait deadline; the execution dies here.
                fail_execution(tx, execution, &e.to_string(), now).await?;
                return Ok(());
            }
        },
        _ => (StepStatus::Pending, None),
    };

    let retry = next_state.retry_params();
    tx.insert_step(NewStep {
        execution_id: execution.id,
        step_name: next_name.to_string(),
        step_type: next_state.state_type(),
        status,
        input: shallow_merge(&step.input, output),
        run_after_ts,
        timeout_seconds: next_state.timeout_seconds(),
        max_retries: retry.max_attempts,
        backoff_multiplier: retry.backoff_multiplier,
        initial_interval_ms: retry.initial_interval_ms,
        now,
    })
    .await?;
    tx.insert_queue_item(execution.id, 0, run_after_ts.unwrap_or(now), run_after_ts)
        .await?;

    execution.current_state = next_name.to_string();
    tx.update_execution(execution).await?;
    tx.append_history(
        execution.id,
        Some(next_name),
        EventType::NextStateQueued,
        json!({ "previousState": step.step_name }),
        now,
    )
    .await?;
    Ok(())
}

/// Terminate an execution as FAILED inside the caller's transaction.
pub(crate) async fn fail_execution(
    tx: &mut dyn StoreTx,
    execution: &mut ExecutionRow,
    message: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    execution.status = ExecutionStatus::Failed;
    execution.error_message = Some(message.to_string());
    execution.completed_at = Some(now);
    tx.update_execution(execution).await?;
    tx.append_history(
        execution.id,
        Some(&execution.current_state),
        EventType::ExecutionFailed,
        json!({ "errorMessage": message }),
        now,
    )
    .await?;
    Ok(())
}

/// Interpreter-level error (bad definition, impossible state): fail the step
/// with a `STEP_ERROR` event and terminate the execution.
async fn record_step_error(
    store: &dyn ExecutionStore,
    clock: &dyn Clock,
    execution_id: uuid::Uuid,
    step_id: uuid::Uuid,
    message: &str,
) -> Result<(), StoreError> {
    let now = clock.now();
    let mut tx = store.begin().await?;

    let Some(mut execution) = tx.execution_for_update(execution_id).await? else {
        tx.rollback().await?;
        return Ok(());
    };
    if execution.status != ExecutionStatus::Running {
        tx.rollback().await?;
        return Ok(());
    }
    let Some(mut step) = tx.step_for_update(step_id).await? else {
        tx.rollback().await?;
        return Ok(());
    };
    if step.status != StepStatus::Running {
        tx.rollback().await?;
        return Ok(());
    }

    step.status = StepStatus::Failed;
    step.error_message = Some(message.to_string());
    step.completed_at = Some(now);
    tx.update_step(&step).await?;
    tx.append_history(
        execution.id,
        Some(&step.step_name),
        EventType::StepError,
        json!({ "errorMessage": message }),
        now,
    )
    .await?;
    fail_execution(tx.as_mut(), &mut execution, message, now).await?;
    tx.commit().await?;
    Ok(())
}
