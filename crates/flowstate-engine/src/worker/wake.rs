//! Wake loop: release due Wait steps
//!
//! Wait steps are created WAITING with `run_after_ts` set; their queue rows
//! carry the same deadline, so dispatchers never claim them early. This loop
//! finds the due ones, completes them with `{"waitCompleted": true}` and
//! schedules the Wait's `next` state exactly like a Task completion would.

use serde_json::json;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::definition::{StateDef, WorkflowDefinition};
use crate::store::{EventType, ExecutionStatus, ExecutionStore, StepStatus, StoreError};

use super::dispatch::{fail_execution, schedule_next};

/// Run one wake poll. Returns the number of Wait steps released.
#[instrument(skip_all)]
pub async fn run_wake_once(
    store: &dyn ExecutionStore,
    clock: &dyn Clock,
    limit: i64,
) -> Result<usize, StoreError> {
    let now = clock.now();
    let mut tx = store.begin().await?;

    let due = tx.find_due_wait_steps(now, limit).await?;
    if due.is_empty() {
        tx.rollback().await?;
        return Ok(0);
    }
    info!(count = due.len(), "releasing due wait steps");

    let mut released = 0;
    for mut step in due {
        let Some(mut execution) = tx.execution_for_update(step.execution_id).await? else {
            continue;
        };
        if execution.status != ExecutionStatus::Running {
            debug!(execution_id = %execution.execution_id, status = %execution.status, "skipping wait step of non-running execution");
            continue;
        }
        let Some(version) = tx.version(execution.workflow_version_id).await? else {
            continue;
        };

        let (definition, next_name) = match WorkflowDefinition::parse(&version.definition) {
            Ok(definition) => match definition.state(&step.step_name) {
                Some(StateDef::Wait(wait)) => {
                    let next = wait.next.clone();
                    (definition, next)
                }
                _ => {
                    let message =
                        format!("waiting step '{}' is not a Wait state", step.step_name);
                    fail_execution(tx.as_mut(), &mut execution, &message, now).await?;
                    continue;
                }
            },
            Err(e) => {
                fail_execution(tx.as_mut(), &mut execution, &e.to_string(), now).await?;
                continue;
            }
        };

        let output = json!({ "waitCompleted": true });
        step.status = StepStatus::Completed;
        step.output = Some(output.clone());
        step.completed_at = Some(now);
        tx.update_step(&step).await?;
        tx.append_history(
            execution.id,
            Some(&step.step_name),
            EventType::WaitCompleted,
            json!({ "completedAt": now }),
            now,
        )
        .await?;

        // Consume the time-gated queue row that carried this Wait step.
        if let Some(queue_item) = tx.queue_item_for_execution(execution.id).await? {
            tx.delete_queue_item(queue_item.id).await?;
        }

        schedule_next(
            tx.as_mut(),
            &mut execution,
            &step,
            &definition,
            &next_name,
            &output,
            now,
        )
        .await?;

        debug!(step = %step.step_name, execution_id = %execution.execution_id, "wait step completed");
        released += 1;
    }

    tx.commit().await?;
    Ok(released)
}
