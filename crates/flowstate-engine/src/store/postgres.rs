//! PostgreSQL implementation of the execution store
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so any number of dispatcher
//! processes can poll the same queue without blocking each other; a claimed
//! row stays locked (and marked `PROCESSING`) until the claiming transaction
//! commits or rolls back, so a crashed worker releases its rows to the next
//! poller with no cleanup step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::*;

/// Embedded schema migrations (`crates/flowstate-engine/migrations/`)
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

const WORKFLOW_COLUMNS: &str = "id, name, description, created_at, updated_at";

const VERSION_COLUMNS: &str =
    "id, workflow_id, version, definition_json, is_active, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, workflow_version_id, execution_id, status, current_state, \
     input_data, output_data, error_message, started_at, completed_at, created_at, updated_at";

const STEP_COLUMNS: &str = "id, execution_id, step_name, step_type, status, input_data, \
     output_data, error_type, error_message, retry_count, max_retries, backoff_multiplier, \
     initial_interval_ms, timeout_seconds, run_after_ts, started_at, completed_at, created_at, \
     updated_at";

const QUEUE_COLUMNS: &str =
    "id, execution_id, priority, scheduled_at, status, retry_count, run_after_ts, created_at, \
     updated_at";

/// PostgreSQL-backed [`ExecutionStore`]
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    #[instrument(skip(self))]
    async fn create_workflow(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<WorkflowRow, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO workflows (id, name, description) VALUES ($1, $2, $3) \
             RETURNING {WORKFLOW_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(name, "created workflow");
        Ok(map_workflow(&row))
    }

    async fn find_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.as_ref().map(map_workflow))
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.as_ref().map(map_workflow))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(map_workflow).collect())
    }

    #[instrument(skip(self, definition))]
    async fn create_version(
        &self,
        workflow_id: Uuid,
        name: &str,
        version: &str,
        definition: &Value,
    ) -> Result<WorkflowVersionRow, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO workflow_versions (id, workflow_id, version, definition_json) \
             VALUES ($1, $2, $3, $4) RETURNING {VERSION_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(version)
        .bind(definition)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateVersion {
                    name: name.to_string(),
                    version: version.to_string(),
                }
            }
            _ => db_err(e),
        })?;

        debug!(name, version, "created workflow version");
        map_version(&row)
    }

    async fn find_version(
        &self,
        workflow_id: Uuid,
        version: &str,
    ) -> Result<Option<WorkflowVersionRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions \
             WHERE workflow_id = $1 AND version = $2"
        ))
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_version).transpose()
    }

    async fn latest_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersionRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions \
             WHERE workflow_id = $1 ORDER BY version DESC LIMIT 1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_version).transpose()
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<WorkflowVersionRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_version).transpose()
    }

    async fn list_versions(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowVersionRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions \
             WHERE workflow_id = $1 ORDER BY version DESC"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_version).collect()
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_execution).transpose()
    }

    async fn find_execution_by_execution_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE execution_id = $1"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_execution).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRow>, StoreError> {
        let statuses: Option<Vec<String>> = filter
            .statuses
            .as_ref()
            .map(|s| s.iter().map(|status| status.as_str().to_string()).collect());

        let rows = sqlx::query(&format!(
            "SELECT e.{} FROM workflow_executions e \
             JOIN workflow_versions v ON v.id = e.workflow_version_id \
             JOIN workflows w ON w.id = v.workflow_id \
             WHERE ($1::text[] IS NULL OR e.status = ANY($1)) \
               AND ($2::text IS NULL OR w.name = $2) \
               AND ($3::timestamptz IS NULL OR e.started_at >= $3) \
               AND ($4::timestamptz IS NULL OR e.started_at <= $4) \
             ORDER BY e.created_at DESC \
             LIMIT $5 OFFSET $6",
            EXECUTION_COLUMNS.replace(", ", ", e.")
        ))
        .bind(statuses)
        .bind(filter.workflow_name.as_deref())
        .bind(filter.started_after)
        .bind(filter.started_before)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_execution).collect()
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<StepRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM execution_steps WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_step).transpose()
    }

    async fn list_steps(&self, execution_id: Uuid) -> Result<Vec<StepRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM execution_steps \
             WHERE execution_id = $1 ORDER BY created_at, id"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_step).collect()
    }

    async fn list_history(&self, execution_id: Uuid) -> Result<Vec<HistoryRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, execution_id, step_name, event_type, event_data, timestamp \
             FROM execution_history WHERE execution_id = $1 ORDER BY timestamp, id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(map_history).collect())
    }

    async fn find_idempotency_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<IdempotencyKeyRow>, StoreError> {
        let row = sqlx::query(
            "SELECT id, key_hash, resource_type, resource_id, expires_at, created_at \
             FROM idempotency_keys WHERE key_hash = $1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.as_ref().map(map_idempotency_key))
    }

    #[instrument(skip(self))]
    async fn purge_expired_idempotency_keys(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        let purged = result.rows_affected();
        if purged > 0 {
            debug!(purged, "purged expired idempotency keys");
        }
        Ok(purged)
    }
}

/// Transaction token over a live Postgres transaction
struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    #[instrument(skip(self))]
    async fn claim_batch(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueueItemRow>, StoreError> {
        // The CTE takes the row locks (skipping rows other claimers hold);
        // the UPDATE marks them while the locks stay with this transaction.
        let rows = sqlx::query(&format!(
            "WITH claimable AS ( \
                 SELECT id FROM execution_queue \
                 WHERE status = 'QUEUED' \
                   AND scheduled_at <= $1 \
                   AND (run_after_ts IS NULL OR run_after_ts <= $1) \
                 ORDER BY priority DESC, scheduled_at ASC \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE execution_queue q \
             SET status = 'PROCESSING', updated_at = $1 \
             FROM claimable c WHERE q.id = c.id \
             RETURNING q.{}",
            QUEUE_COLUMNS.replace(", ", ", q.")
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| {
            error!("failed to claim queue batch: {e}");
            db_err(e)
        })?;

        if !rows.is_empty() {
            debug!(count = rows.len(), "claimed queue items");
        }
        rows.iter().map(map_queue_item).collect()
    }

    async fn release_queue_item(&mut self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE execution_queue SET status = 'QUEUED' WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn requeue_item(
        &mut self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE execution_queue \
             SET status = 'QUEUED', scheduled_at = $2, run_after_ts = NULL, updated_at = $2 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(scheduled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_queue_item(&mut self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM execution_queue WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_queue_items_for_execution(
        &mut self,
        execution_id: Uuid,
    ) -> Result<u64, StoreError> {
        // Skip rows a dispatcher currently holds: that worker discovers the
        // cancellation at persistence time and consumes its row itself.
        // Blocking here instead would deadlock against the claim transaction.
        let result = sqlx::query(
            "DELETE FROM execution_queue q \
             USING (SELECT id FROM execution_queue WHERE execution_id = $1 \
                    FOR UPDATE SKIP LOCKED) c \
             WHERE q.id = c.id",
        )
        .bind(execution_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn queue_item_for_execution(
        &mut self,
        execution_id: Uuid,
    ) -> Result<Option<QueueItemRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM execution_queue \
             WHERE execution_id = $1 ORDER BY created_at LIMIT 1"
        ))
        .bind(execution_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_queue_item).transpose()
    }

    async fn insert_queue_item(
        &mut self,
        execution_id: Uuid,
        priority: i32,
        scheduled_at: DateTime<Utc>,
        run_after_ts: Option<DateTime<Utc>>,
    ) -> Result<QueueItemRow, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO execution_queue \
                 (id, execution_id, priority, scheduled_at, status, run_after_ts) \
             VALUES ($1, $2, $3, $4, 'QUEUED', $5) \
             RETURNING {QUEUE_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(execution_id)
        .bind(priority)
        .bind(scheduled_at)
        .bind(run_after_ts)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;

        map_queue_item(&row)
    }

    #[instrument(skip(self, new), fields(execution_id = %new.execution_id))]
    async fn create_execution(&mut self, new: NewExecution) -> Result<ExecutionRow, StoreError> {
        let execution_row = sqlx::query(&format!(
            "INSERT INTO workflow_executions \
                 (id, workflow_version_id, execution_id, status, current_state, input_data, \
                  started_at, created_at, updated_at) \
             VALUES ($1, $2, $3, 'RUNNING', $4, $5, $6, $6, $6) \
             RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(new.workflow_version_id)
        .bind(&new.execution_id)
        .bind(&new.start_state)
        .bind(&new.input)
        .bind(new.now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        let execution = map_execution(&execution_row)?;

        sqlx::query(
            "INSERT INTO execution_steps \
                 (id, execution_id, step_name, step_type, status, input_data, max_retries, \
                  backoff_multiplier, initial_interval_ms, timeout_seconds, run_after_ts, \
                  created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)",
        )
        .bind(Uuid::now_v7())
        .bind(execution.id)
        .bind(&new.start_state)
        .bind(new.start_state_type.as_str())
        .bind(new.step_status.as_str())
        .bind(&new.input)
        .bind(new.max_retries)
        .bind(new.backoff_multiplier)
        .bind(new.initial_interval_ms)
        .bind(new.timeout_seconds)
        .bind(new.run_after_ts)
        .bind(new.now)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO execution_queue \
                 (id, execution_id, priority, scheduled_at, status, run_after_ts) \
             VALUES ($1, $2, 0, $3, 'QUEUED', $4)",
        )
        .bind(Uuid::now_v7())
        .bind(execution.id)
        .bind(new.run_after_ts.unwrap_or(new.now))
        .bind(new.run_after_ts)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(execution)
    }

    async fn execution(&mut self, id: Uuid) -> Result<Option<ExecutionRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_execution).transpose()
    }

    async fn execution_for_update(
        &mut self,
        id: Uuid,
    ) -> Result<Option<ExecutionRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_execution).transpose()
    }

    async fn execution_by_execution_id_for_update(
        &mut self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE execution_id = $1 FOR UPDATE"
        ))
        .bind(execution_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_execution).transpose()
    }

    async fn update_execution(&mut self, execution: &ExecutionRow) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_executions \
             SET status = $2, current_state = $3, output_data = $4, error_message = $5, \
                 completed_at = $6, updated_at = now() \
             WHERE id = $1",
        )
        .bind(execution.id)
        .bind(execution.status.as_str())
        .bind(&execution.current_state)
        .bind(&execution.output)
        .bind(&execution.error_message)
        .bind(execution.completed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn step_by_name(
        &mut self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM execution_steps \
             WHERE execution_id = $1 AND step_name = $2 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(execution_id)
        .bind(step_name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_step).transpose()
    }

    async fn step_by_name_for_update(
        &mut self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM execution_steps \
             WHERE execution_id = $1 AND step_name = $2 \
             ORDER BY created_at DESC LIMIT 1 FOR UPDATE"
        ))
        .bind(execution_id)
        .bind(step_name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_step).transpose()
    }

    async fn step_for_update(&mut self, id: Uuid) -> Result<Option<StepRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM execution_steps WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_step).transpose()
    }

    async fn insert_step(&mut self, new: NewStep) -> Result<StepRow, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO execution_steps \
                 (id, execution_id, step_name, step_type, status, input_data, max_retries, \
                  backoff_multiplier, initial_interval_ms, timeout_seconds, run_after_ts, \
                  created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12) \
             RETURNING {STEP_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(new.execution_id)
        .bind(&new.step_name)
        .bind(new.step_type.as_str())
        .bind(new.status.as_str())
        .bind(&new.input)
        .bind(new.max_retries)
        .bind(new.backoff_multiplier)
        .bind(new.initial_interval_ms)
        .bind(new.timeout_seconds)
        .bind(new.run_after_ts)
        .bind(new.now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;

        map_step(&row)
    }

    async fn update_step(&mut self, step: &StepRow) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE execution_steps \
             SET status = $2, output_data = $3, error_type = $4, error_message = $5, \
                 retry_count = $6, run_after_ts = $7, started_at = $8, completed_at = $9, \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(step.id)
        .bind(step.status.as_str())
        .bind(&step.output)
        .bind(&step.error_type)
        .bind(&step.error_message)
        .bind(step.retry_count)
        .bind(step.run_after_ts)
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_stuck_steps(
        &mut self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StepRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM execution_steps \
             WHERE status = 'RUNNING' AND started_at < $1 \
             ORDER BY started_at ASC LIMIT $2 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(threshold)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_step).collect()
    }

    async fn find_due_wait_steps(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StepRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM execution_steps \
             WHERE status = 'WAITING' AND run_after_ts <= $1 \
             ORDER BY run_after_ts ASC LIMIT $2 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_step).collect()
    }

    async fn version(&mut self, id: Uuid) -> Result<Option<WorkflowVersionRow>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_version).transpose()
    }

    async fn append_history(
        &mut self,
        execution_id: Uuid,
        step_name: Option<&str>,
        event_type: EventType,
        event_data: Value,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO execution_history \
                 (execution_id, step_name, event_type, event_data, timestamp) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(execution_id)
        .bind(step_name)
        .bind(event_type.as_str())
        .bind(&event_data)
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_idempotency_key(
        &mut self,
        key_hash: &str,
        resource_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // Two racing starts with the same key both insert; the loser keeps
        // the winner's mapping. An expired record is replaced.
        sqlx::query(
            "INSERT INTO idempotency_keys \
                 (id, key_hash, resource_type, resource_id, expires_at, created_at) \
             VALUES ($1, $2, 'workflow_execution', $3, $4, $5) \
             ON CONFLICT (key_hash) DO UPDATE \
                 SET resource_id = EXCLUDED.resource_id, \
                     expires_at = EXCLUDED.expires_at, \
                     created_at = EXCLUDED.created_at \
                 WHERE idempotency_keys.expires_at <= EXCLUDED.created_at",
        )
        .bind(Uuid::now_v7())
        .bind(key_hash)
        .bind(resource_id)
        .bind(expires_at)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(db_err)
    }
}

// Row mapping helpers

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_err(what: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(format!("invalid {what} in row: {e}"))
}

fn map_workflow(row: &PgRow) -> WorkflowRow {
    WorkflowRow {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn map_version(row: &PgRow) -> Result<WorkflowVersionRow, StoreError> {
    Ok(WorkflowVersionRow {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version: row.get("version"),
        definition: row.get("definition_json"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_execution(row: &PgRow) -> Result<ExecutionRow, StoreError> {
    let status: String = row.get("status");
    Ok(ExecutionRow {
        id: row.get("id"),
        workflow_version_id: row.get("workflow_version_id"),
        execution_id: row.get("execution_id"),
        status: status
            .parse()
            .map_err(|e| parse_err("execution status", e))?,
        current_state: row.get("current_state"),
        input: row.get("input_data"),
        output: row.get("output_data"),
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_step(row: &PgRow) -> Result<StepRow, StoreError> {
    let status: String = row.get("status");
    let step_type: String = row.get("step_type");
    Ok(StepRow {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        step_name: row.get("step_name"),
        step_type: step_type.parse().map_err(|e| parse_err("step type", e))?,
        status: status.parse().map_err(|e| parse_err("step status", e))?,
        input: row.get("input_data"),
        output: row.get("output_data"),
        error_type: row.get("error_type"),
        error_message: row.get("error_message"),
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        backoff_multiplier: row.get("backoff_multiplier"),
        initial_interval_ms: row.get("initial_interval_ms"),
        timeout_seconds: row.get("timeout_seconds"),
        run_after_ts: row.get("run_after_ts"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_queue_item(row: &PgRow) -> Result<QueueItemRow, StoreError> {
    let status: String = row.get("status");
    Ok(QueueItemRow {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        priority: row.get("priority"),
        scheduled_at: row.get("scheduled_at"),
        status: status.parse().map_err(|e| parse_err("queue status", e))?,
        retry_count: row.get("retry_count"),
        run_after_ts: row.get("run_after_ts"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_history(row: &PgRow) -> HistoryRow {
    HistoryRow {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        step_name: row.get("step_name"),
        event_type: row.get("event_type"),
        event_data: row.get("event_data"),
        timestamp: row.get("timestamp"),
    }
}

fn map_idempotency_key(row: &PgRow) -> IdempotencyKeyRow {
    IdempotencyKeyRow {
        id: row.get("id"),
        key_hash: row.get("key_hash"),
        resource_type: row.get("resource_type"),
        resource_id: row.get("resource_id"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}
