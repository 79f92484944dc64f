//! In-memory implementation of the execution store for tests
//!
//! Mirrors the Postgres implementation's observable semantics closely enough
//! to drive the worker loops deterministically. One deliberate simplification:
//! writes inside a transaction apply immediately, and rollback restores only
//! the claim state of queue rows (enough to simulate a dispatcher crashing
//! between claim and commit, which is what tests exercise).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use super::*;

#[derive(Default)]
struct MemoryState {
    workflows: HashMap<Uuid, WorkflowRow>,
    versions: HashMap<Uuid, WorkflowVersionRow>,
    executions: HashMap<Uuid, ExecutionRow>,
    steps: HashMap<Uuid, StepRow>,
    queue: HashMap<Uuid, QueueItemRow>,
    history: Vec<HistoryRow>,
    idempotency_keys: HashMap<String, IdempotencyKeyRow>,
    history_seq: i64,
}

/// In-memory [`ExecutionStore`] for tests
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently in the queue (any status)
    pub fn queue_depth(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of step rows across all executions
    pub fn step_count(&self) -> usize {
        self.inner.lock().steps.len()
    }

    /// Drop all data (for test reuse)
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        *state = MemoryState::default();
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            claimed: Vec::new(),
            finished: false,
        }))
    }

    async fn create_workflow(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<WorkflowRow, StoreError> {
        let mut state = self.inner.lock();
        let now = Utc::now();
        let row = WorkflowRow {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        state.workflows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowRow>, StoreError> {
        let state = self.inner.lock();
        Ok(state.workflows.values().find(|w| w.name == name).cloned())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRow>, StoreError> {
        Ok(self.inner.lock().workflows.get(&id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, StoreError> {
        let state = self.inner.lock();
        let mut rows: Vec<_> = state.workflows.values().cloned().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn create_version(
        &self,
        workflow_id: Uuid,
        name: &str,
        version: &str,
        definition: &Value,
    ) -> Result<WorkflowVersionRow, StoreError> {
        let mut state = self.inner.lock();
        if state
            .versions
            .values()
            .any(|v| v.workflow_id == workflow_id && v.version == version)
        {
            return Err(StoreError::DuplicateVersion {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        let now = Utc::now();
        let row = WorkflowVersionRow {
            id: Uuid::now_v7(),
            workflow_id,
            version: version.to_string(),
            definition: definition.clone(),
            is_active: false,
            created_at: now,
            updated_at: now,
        };
        state.versions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_version(
        &self,
        workflow_id: Uuid,
        version: &str,
    ) -> Result<Option<WorkflowVersionRow>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .versions
            .values()
            .find(|v| v.workflow_id == workflow_id && v.version == version)
            .cloned())
    }

    async fn latest_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersionRow>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned())
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<WorkflowVersionRow>, StoreError> {
        Ok(self.inner.lock().versions.get(&id).cloned())
    }

    async fn list_versions(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowVersionRow>, StoreError> {
        let state = self.inner.lock();
        let mut rows: Vec<_> = state
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(rows)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, StoreError> {
        Ok(self.inner.lock().executions.get(&id).cloned())
    }

    async fn find_execution_by_execution_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRow>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .executions
            .values()
            .find(|e| e.execution_id == execution_id)
            .cloned())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRow>, StoreError> {
        let state = self.inner.lock();

        let workflow_version_ids: Option<Vec<Uuid>> = filter.workflow_name.as_deref().map(|name| {
            let workflow_id = state
                .workflows
                .values()
                .find(|w| w.name == name)
                .map(|w| w.id);
            state
                .versions
                .values()
                .filter(|v| Some(v.workflow_id) == workflow_id)
                .map(|v| v.id)
                .collect()
        });

        let mut rows: Vec<_> = state
            .executions
            .values()
            .filter(|e| {
                if let Some(statuses) = &filter.statuses {
                    if !statuses.contains(&e.status) {
                        return false;
                    }
                }
                if let Some(ids) = &workflow_version_ids {
                    if !ids.contains(&e.workflow_version_id) {
                        return false;
                    }
                }
                if let Some(after) = filter.started_after {
                    if e.started_at < after {
                        return false;
                    }
                }
                if let Some(before) = filter.started_before {
                    if e.started_at > before {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<StepRow>, StoreError> {
        Ok(self.inner.lock().steps.get(&id).cloned())
    }

    async fn list_steps(&self, execution_id: Uuid) -> Result<Vec<StepRow>, StoreError> {
        let state = self.inner.lock();
        let mut rows: Vec<_> = state
            .steps
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn list_history(&self, execution_id: Uuid) -> Result<Vec<HistoryRow>, StoreError> {
        let state = self.inner.lock();
        let mut rows: Vec<_> = state
            .history
            .iter()
            .filter(|h| h.execution_id == execution_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn find_idempotency_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<IdempotencyKeyRow>, StoreError> {
        Ok(self.inner.lock().idempotency_keys.get(key_hash).cloned())
    }

    async fn purge_expired_idempotency_keys(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.inner.lock();
        let before = state.idempotency_keys.len();
        state.idempotency_keys.retain(|_, key| key.expires_at > now);
        Ok((before - state.idempotency_keys.len()) as u64)
    }
}

struct MemoryTx {
    inner: Arc<Mutex<MemoryState>>,
    claimed: Vec<Uuid>,
    finished: bool,
}

impl MemoryTx {
    fn restore_claims(&mut self) {
        let mut state = self.inner.lock();
        for id in self.claimed.drain(..) {
            if let Some(item) = state.queue.get_mut(&id) {
                if item.status == QueueStatus::Processing {
                    item.status = QueueStatus::Queued;
                }
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.restore_claims();
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn claim_batch(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueueItemRow>, StoreError> {
        let mut state = self.inner.lock();

        let mut eligible: Vec<Uuid> = state
            .queue
            .values()
            .filter(|item| {
                item.status == QueueStatus::Queued
                    && item.scheduled_at <= now
                    && item.run_after_ts.map_or(true, |ts| ts <= now)
            })
            .map(|item| item.id)
            .collect();

        eligible.sort_by(|a, b| {
            let ia = &state.queue[a];
            let ib = &state.queue[b];
            ib.priority
                .cmp(&ia.priority)
                .then(ia.scheduled_at.cmp(&ib.scheduled_at))
                .then(ia.id.cmp(&ib.id))
        });
        eligible.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let item = state.queue.get_mut(&id).expect("eligible row exists");
            item.status = QueueStatus::Processing;
            item.updated_at = now;
            self.claimed.push(id);
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    async fn release_queue_item(&mut self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        if let Some(item) = state.queue.get_mut(&id) {
            item.status = QueueStatus::Queued;
        }
        self.claimed.retain(|claimed| *claimed != id);
        Ok(())
    }

    async fn requeue_item(
        &mut self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        if let Some(item) = state.queue.get_mut(&id) {
            item.status = QueueStatus::Queued;
            item.scheduled_at = scheduled_at;
            item.run_after_ts = None;
            item.updated_at = scheduled_at;
        }
        Ok(())
    }

    async fn delete_queue_item(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.inner.lock().queue.remove(&id);
        self.claimed.retain(|claimed| *claimed != id);
        Ok(())
    }

    async fn delete_queue_items_for_execution(
        &mut self,
        execution_id: Uuid,
    ) -> Result<u64, StoreError> {
        let mut state = self.inner.lock();
        let before = state.queue.len();
        state.queue.retain(|_, item| item.execution_id != execution_id);
        Ok((before - state.queue.len()) as u64)
    }

    async fn queue_item_for_execution(
        &mut self,
        execution_id: Uuid,
    ) -> Result<Option<QueueItemRow>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .queue
            .values()
            .find(|item| item.execution_id == execution_id)
            .cloned())
    }

    async fn insert_queue_item(
        &mut self,
        execution_id: Uuid,
        priority: i32,
        scheduled_at: DateTime<Utc>,
        run_after_ts: Option<DateTime<Utc>>,
    ) -> Result<QueueItemRow, StoreError> {
        let mut state = self.inner.lock();
        let row = QueueItemRow {
            id: Uuid::now_v7(),
            execution_id,
            priority,
            scheduled_at,
            status: QueueStatus::Queued,
            retry_count: 0,
            run_after_ts,
            created_at: scheduled_at,
            updated_at: scheduled_at,
        };
        state.queue.insert(row.id, row.clone());
        Ok(row)
    }

    async fn create_execution(&mut self, new: NewExecution) -> Result<ExecutionRow, StoreError> {
        let mut state = self.inner.lock();

        let execution = ExecutionRow {
            id: Uuid::now_v7(),
            workflow_version_id: new.workflow_version_id,
            execution_id: new.execution_id.clone(),
            status: ExecutionStatus::Running,
            current_state: new.start_state.clone(),
            input: new.input.clone(),
            output: None,
            error_message: None,
            started_at: new.now,
            completed_at: None,
            created_at: new.now,
            updated_at: new.now,
        };

        let step = StepRow {
            id: Uuid::now_v7(),
            execution_id: execution.id,
            step_name: new.start_state,
            step_type: new.start_state_type,
            status: new.step_status,
            input: new.input,
            output: None,
            error_type: None,
            error_message: None,
            retry_count: 0,
            max_retries: new.max_retries,
            backoff_multiplier: new.backoff_multiplier,
            initial_interval_ms: new.initial_interval_ms,
            timeout_seconds: new.timeout_seconds,
            run_after_ts: new.run_after_ts,
            started_at: None,
            completed_at: None,
            created_at: new.now,
            updated_at: new.now,
        };

        let queue_item = QueueItemRow {
            id: Uuid::now_v7(),
            execution_id: execution.id,
            priority: 0,
            scheduled_at: new.run_after_ts.unwrap_or(new.now),
            status: QueueStatus::Queued,
            retry_count: 0,
            run_after_ts: new.run_after_ts,
            created_at: new.now,
            updated_at: new.now,
        };

        state.executions.insert(execution.id, execution.clone());
        state.steps.insert(step.id, step);
        state.queue.insert(queue_item.id, queue_item);
        Ok(execution)
    }

    async fn execution(&mut self, id: Uuid) -> Result<Option<ExecutionRow>, StoreError> {
        Ok(self.inner.lock().executions.get(&id).cloned())
    }

    async fn execution_for_update(
        &mut self,
        id: Uuid,
    ) -> Result<Option<ExecutionRow>, StoreError> {
        Ok(self.inner.lock().executions.get(&id).cloned())
    }

    async fn execution_by_execution_id_for_update(
        &mut self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRow>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .executions
            .values()
            .find(|e| e.execution_id == execution_id)
            .cloned())
    }

    async fn update_execution(&mut self, execution: &ExecutionRow) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn step_by_name(
        &mut self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepRow>, StoreError> {
        let state = self.inner.lock();
        // Newest row wins when a graph revisits a state name.
        Ok(state
            .steps
            .values()
            .filter(|s| s.execution_id == execution_id && s.step_name == step_name)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn step_by_name_for_update(
        &mut self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepRow>, StoreError> {
        self.step_by_name(execution_id, step_name).await
    }

    async fn step_for_update(&mut self, id: Uuid) -> Result<Option<StepRow>, StoreError> {
        Ok(self.inner.lock().steps.get(&id).cloned())
    }

    async fn insert_step(&mut self, new: NewStep) -> Result<StepRow, StoreError> {
        let mut state = self.inner.lock();
        let row = StepRow {
            id: Uuid::now_v7(),
            execution_id: new.execution_id,
            step_name: new.step_name,
            step_type: new.step_type,
            status: new.status,
            input: new.input,
            output: None,
            error_type: None,
            error_message: None,
            retry_count: 0,
            max_retries: new.max_retries,
            backoff_multiplier: new.backoff_multiplier,
            initial_interval_ms: new.initial_interval_ms,
            timeout_seconds: new.timeout_seconds,
            run_after_ts: new.run_after_ts,
            started_at: None,
            completed_at: None,
            created_at: new.now,
            updated_at: new.now,
        };
        state.steps.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_step(&mut self, step: &StepRow) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        state.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn find_stuck_steps(
        &mut self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StepRow>, StoreError> {
        let state = self.inner.lock();
        let mut rows: Vec<_> = state
            .steps
            .values()
            .filter(|s| {
                s.status == StepStatus::Running
                    && s.started_at.map_or(false, |started| started < threshold)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn find_due_wait_steps(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StepRow>, StoreError> {
        let state = self.inner.lock();
        let mut rows: Vec<_> = state
            .steps
            .values()
            .filter(|s| {
                s.status == StepStatus::Waiting
                    && s.run_after_ts.map_or(false, |ts| ts <= now)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.run_after_ts.cmp(&b.run_after_ts));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn version(&mut self, id: Uuid) -> Result<Option<WorkflowVersionRow>, StoreError> {
        Ok(self.inner.lock().versions.get(&id).cloned())
    }

    async fn append_history(
        &mut self,
        execution_id: Uuid,
        step_name: Option<&str>,
        event_type: EventType,
        event_data: Value,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        state.history_seq += 1;
        let row = HistoryRow {
            id: state.history_seq,
            execution_id,
            step_name: step_name.map(str::to_string),
            event_type: event_type.as_str().to_string(),
            event_data,
            timestamp: at,
        };
        state.history.push(row);
        Ok(())
    }

    async fn insert_idempotency_key(
        &mut self,
        key_hash: &str,
        resource_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        // An unexpired record wins over a racing insert; expired ones are
        // replaced.
        if let Some(existing) = state.idempotency_keys.get(key_hash) {
            if existing.expires_at > now {
                return Ok(());
            }
        }
        let row = IdempotencyKeyRow {
            id: Uuid::now_v7(),
            key_hash: key_hash.to_string(),
            resource_type: "workflow_execution".to_string(),
            resource_id: resource_id.to_string(),
            expires_at,
            created_at: now,
        };
        state.idempotency_keys.insert(row.key_hash.clone(), row);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finished = true;
        self.claimed.clear();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.restore_claims();
        self.finished = true;
        Ok(())
    }
}
