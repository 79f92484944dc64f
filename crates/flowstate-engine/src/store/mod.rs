//! Persistence layer
//!
//! Two traits split the store:
//!
//! - [`ExecutionStore`] — read-only projections plus registration writes and
//!   [`ExecutionStore::begin`], which opens a transaction.
//! - [`StoreTx`] — the transaction token every engine mutation flows through.
//!   Claimed queue rows stay locked for the lifetime of the transaction that
//!   claimed them; a crash before commit releases them untouched.
//!
//! [`postgres::PostgresExecutionStore`] is the production implementation;
//! [`memory::InMemoryExecutionStore`] backs tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::StateType;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A `(workflow, version)` pair that already exists was registered again
    #[error("workflow version already exists: {name} {version}")]
    DuplicateVersion { name: String, version: String },

    /// Underlying database failure; the enclosing transaction is rolled back
    /// and the loop retries on its next tick
    #[error("database error: {0}")]
    Database(String),

    /// JSON (de)serialization failure at the storage boundary
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Lifecycle status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Terminal statuses admit no further state changes.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Lifecycle status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "WAITING" => Ok(Self::Waiting),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// Status of a queue row
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Queued,
    Processing,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "PROCESSING" => Ok(Self::Processing),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// Audit log event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ExecutionStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepError,
    NextStateQueued,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    StepRecovered,
    WaitCompleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStarted => "EXECUTION_STARTED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::StepFailed => "STEP_FAILED",
            Self::StepError => "STEP_ERROR",
            Self::NextStateQueued => "NEXT_STATE_QUEUED",
            Self::ExecutionCompleted => "EXECUTION_COMPLETED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::ExecutionCancelled => "EXECUTION_CANCELLED",
            Self::StepRecovered => "STEP_RECOVERED",
            Self::WaitCompleted => "WAIT_COMPLETED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered workflow name
#[derive(Debug, Clone)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable version of a workflow definition
#[derive(Debug, Clone)]
pub struct WorkflowVersionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: String,
    pub definition: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One live run of a workflow version
#[derive(Debug, Clone)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_version_id: Uuid,
    /// User-visible execution id (`exec-…`), globally unique
    pub execution_id: String,
    pub status: ExecutionStatus,
    /// Name of the frontier state; the queue row is authoritative for what
    /// runs next, this pointer just avoids a scan
    pub current_state: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One state visit within an execution
#[derive(Debug, Clone)]
pub struct StepRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_name: String,
    pub step_type: StateType,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub backoff_multiplier: f64,
    pub initial_interval_ms: i64,
    pub timeout_seconds: Option<i64>,
    pub run_after_ts: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The unit of work claimed by dispatchers
#[derive(Debug, Clone)]
pub struct QueueItemRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub retry_count: i32,
    pub run_after_ts: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit record
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub id: i64,
    pub execution_id: Uuid,
    pub step_name: Option<String>,
    pub event_type: String,
    pub event_data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Start-request deduplication record
#[derive(Debug, Clone)]
pub struct IdempotencyKeyRow {
    pub id: Uuid,
    pub key_hash: String,
    pub resource_type: String,
    pub resource_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating an execution with its first step and queue row
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_version_id: Uuid,
    pub execution_id: String,
    pub start_state: String,
    pub start_state_type: StateType,
    pub input: Value,
    /// `Pending` normally; `Waiting` when the start state is a Wait
    pub step_status: StepStatus,
    pub run_after_ts: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<i64>,
    pub max_retries: i32,
    pub backoff_multiplier: f64,
    pub initial_interval_ms: i64,
    pub now: DateTime<Utc>,
}

/// Parameters for scheduling a successor step
#[derive(Debug, Clone)]
pub struct NewStep {
    pub execution_id: Uuid,
    pub step_name: String,
    pub step_type: StateType,
    pub status: StepStatus,
    pub input: Value,
    pub run_after_ts: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<i64>,
    pub max_retries: i32,
    pub backoff_multiplier: f64,
    pub initial_interval_ms: i64,
    pub now: DateTime<Utc>,
}

/// Filter for listing executions
#[derive(Debug, Clone)]
pub struct ExecutionFilter {
    pub statuses: Option<Vec<ExecutionStatus>>,
    pub workflow_name: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ExecutionFilter {
    fn default() -> Self {
        Self {
            statuses: None,
            workflow_name: None,
            started_after: None,
            started_before: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Store for workflow definitions, executions and the work queue.
///
/// Implementations must be thread-safe; any number of worker processes may
/// operate on the same store concurrently with no coordination beyond the
/// store's own row locks.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    /// Open a transaction. All engine mutations go through the returned
    /// token; dropping it without [`StoreTx::commit`] rolls everything back.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    // =========================================================================
    // Definition registry
    // =========================================================================

    async fn create_workflow(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<WorkflowRow, StoreError>;

    async fn find_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowRow>, StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRow>, StoreError>;

    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, StoreError>;

    /// Insert a new definition version. Fails with
    /// [`StoreError::DuplicateVersion`] when `(workflow, version)` exists.
    /// `name` is only used to label that error.
    async fn create_version(
        &self,
        workflow_id: Uuid,
        name: &str,
        version: &str,
        definition: &Value,
    ) -> Result<WorkflowVersionRow, StoreError>;

    async fn find_version(
        &self,
        workflow_id: Uuid,
        version: &str,
    ) -> Result<Option<WorkflowVersionRow>, StoreError>;

    /// Most recent version by lexicographic-descending version string.
    async fn latest_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersionRow>, StoreError>;

    async fn get_version(&self, id: Uuid) -> Result<Option<WorkflowVersionRow>, StoreError>;

    async fn list_versions(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowVersionRow>, StoreError>;

    // =========================================================================
    // Execution projections
    // =========================================================================

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, StoreError>;

    async fn find_execution_by_execution_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRow>, StoreError>;

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRow>, StoreError>;

    async fn get_step(&self, id: Uuid) -> Result<Option<StepRow>, StoreError>;

    async fn list_steps(&self, execution_id: Uuid) -> Result<Vec<StepRow>, StoreError>;

    /// History ordered by `(timestamp, id)`; a linearizable view of one
    /// execution's progress.
    async fn list_history(&self, execution_id: Uuid) -> Result<Vec<HistoryRow>, StoreError>;

    // =========================================================================
    // Idempotency keys
    // =========================================================================

    async fn find_idempotency_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<IdempotencyKeyRow>, StoreError>;

    /// Drop keys whose TTL has elapsed. Returns the number removed.
    async fn purge_expired_idempotency_keys(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Transaction token for engine mutations.
///
/// Row-lock discipline: [`StoreTx::claim_batch`] locks the claimed queue rows
/// (skip-locked, so concurrent claimers never block on each other) and keeps
/// them locked until this transaction commits or rolls back. `*_for_update`
/// reads take row locks used to serialize workers against cancellation.
#[async_trait]
pub trait StoreTx: Send {
    // =========================================================================
    // Queue
    // =========================================================================

    /// Claim up to `limit` due queue rows.
    ///
    /// Selects rows with `status = QUEUED`, `scheduled_at <= now` and
    /// `run_after_ts` null or elapsed, ordered by `priority DESC,
    /// scheduled_at ASC`, skipping rows locked by other claimers. Claimed
    /// rows are marked `PROCESSING` within this transaction.
    async fn claim_batch(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueueItemRow>, StoreError>;

    /// Put a claimed row back to `QUEUED` without consuming it.
    async fn release_queue_item(&mut self, id: Uuid) -> Result<(), StoreError>;

    /// Reset a row to `QUEUED` and reschedule it for `scheduled_at`.
    async fn requeue_item(
        &mut self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn delete_queue_item(&mut self, id: Uuid) -> Result<(), StoreError>;

    async fn delete_queue_items_for_execution(
        &mut self,
        execution_id: Uuid,
    ) -> Result<u64, StoreError>;

    async fn queue_item_for_execution(
        &mut self,
        execution_id: Uuid,
    ) -> Result<Option<QueueItemRow>, StoreError>;

    async fn insert_queue_item(
        &mut self,
        execution_id: Uuid,
        priority: i32,
        scheduled_at: DateTime<Utc>,
        run_after_ts: Option<DateTime<Utc>>,
    ) -> Result<QueueItemRow, StoreError>;

    // =========================================================================
    // Executions and steps
    // =========================================================================

    /// Insert the execution, its first step and its first queue row.
    async fn create_execution(&mut self, new: NewExecution) -> Result<ExecutionRow, StoreError>;

    /// Plain read, no lock taken.
    async fn execution(&mut self, id: Uuid) -> Result<Option<ExecutionRow>, StoreError>;

    /// Read with a row lock, serializing against cancellation and other
    /// workers.
    async fn execution_for_update(&mut self, id: Uuid)
        -> Result<Option<ExecutionRow>, StoreError>;

    async fn execution_by_execution_id_for_update(
        &mut self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRow>, StoreError>;

    /// Persist status / current_state / output / error / completion fields.
    async fn update_execution(&mut self, execution: &ExecutionRow) -> Result<(), StoreError>;

    /// Plain read by `(execution, step_name)`, no lock taken.
    async fn step_by_name(
        &mut self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepRow>, StoreError>;

    async fn step_by_name_for_update(
        &mut self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepRow>, StoreError>;

    async fn step_for_update(&mut self, id: Uuid) -> Result<Option<StepRow>, StoreError>;

    async fn insert_step(&mut self, new: NewStep) -> Result<StepRow, StoreError>;

    /// Persist status / output / error / timestamp fields of a step.
    async fn update_step(&mut self, step: &StepRow) -> Result<(), StoreError>;

    /// RUNNING steps whose `started_at` predates `threshold` (stuck-step
    /// candidates). Skip-locked so live pollers never collide.
    async fn find_stuck_steps(
        &mut self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StepRow>, StoreError>;

    /// WAITING steps whose `run_after_ts` has elapsed.
    async fn find_due_wait_steps(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StepRow>, StoreError>;

    // =========================================================================
    // Definitions and bookkeeping
    // =========================================================================

    async fn version(&mut self, id: Uuid) -> Result<Option<WorkflowVersionRow>, StoreError>;

    async fn append_history(
        &mut self,
        execution_id: Uuid,
        step_name: Option<&str>,
        event_type: EventType,
        event_data: Value,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_idempotency_key(
        &mut self,
        key_hash: &str,
        resource_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
