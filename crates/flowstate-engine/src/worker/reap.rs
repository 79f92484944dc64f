//! Reap loop: rescue stuck steps
//!
//! A step left RUNNING past the stuck threshold has lost its worker (process
//! crash between marking RUNNING and persisting the outcome, or a handler
//! that never returned). Recovery resets the step to PENDING and puts its
//! execution back on the queue; `STEP_RECOVERED` marks the restart in the
//! audit log. Recovery is not a failure.

use chrono::Duration;
use serde_json::json;
use tracing::{info, instrument};

use crate::clock::Clock;
use crate::store::{EventType, ExecutionStatus, ExecutionStore, StepStatus, StoreError};

/// Run one reap poll. Returns the number of steps recovered.
#[instrument(skip_all)]
pub async fn run_reap_once(
    store: &dyn ExecutionStore,
    clock: &dyn Clock,
    stuck_timeout: Duration,
    limit: i64,
) -> Result<usize, StoreError> {
    let now = clock.now();
    let threshold = now - stuck_timeout;
    let mut tx = store.begin().await?;

    let stuck = tx.find_stuck_steps(threshold, limit).await?;
    if stuck.is_empty() {
        tx.rollback().await?;
        return Ok(0);
    }
    info!(count = stuck.len(), "recovering stuck steps");

    let mut recovered = 0;
    for mut step in stuck {
        let Some(execution) = tx.execution_for_update(step.execution_id).await? else {
            continue;
        };
        if execution.status != ExecutionStatus::Running {
            continue;
        }

        step.status = StepStatus::Pending;
        step.started_at = None;
        step.completed_at = None;
        tx.update_step(&step).await?;

        // Reuse the execution's surviving queue row when the crash left one
        // behind; otherwise enqueue a fresh one. Either way the execution
        // ends up with exactly one claimable row.
        match tx.queue_item_for_execution(execution.id).await? {
            Some(item) => tx.requeue_item(item.id, now).await?,
            None => {
                tx.insert_queue_item(execution.id, 0, now, None).await?;
            }
        }

        tx.append_history(
            execution.id,
            Some(&step.step_name),
            EventType::StepRecovered,
            json!({ "reason": "stuck step recovery" }),
            now,
        )
        .await?;

        info!(step = %step.step_name, execution_id = %execution.execution_id, "recovered stuck step");
        recovered += 1;
    }

    tx.commit().await?;
    Ok(recovered)
}
