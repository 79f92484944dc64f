//! Core execution API
//!
//! [`ExecutionService`] is the programmatic surface consumed by the HTTP
//! layer: definition registration, execution start (with idempotency-key
//! deduplication), read projections, and cancellation. Everything that
//! mutates engine state runs in a single store transaction.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::clock::Clock;
use crate::definition::{DefinitionError, StateDef, WorkflowDefinition};
use crate::store::{
    EventType, ExecutionFilter, ExecutionRow, ExecutionStatus, ExecutionStore, NewExecution,
    StepRow, StepStatus, StoreError, WorkflowRow, WorkflowVersionRow,
};

/// Errors surfaced to API callers
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow version not found: {workflow} {version}")]
    VersionNotFound { workflow: String, version: String },

    #[error("workflow version already exists: {workflow} {version}")]
    DuplicateVersion { workflow: String, version: String },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    /// API misuse, e.g. cancelling an already-terminal execution
    #[error("execution {execution_id} is {status}, not RUNNING")]
    InvalidState {
        execution_id: String,
        status: ExecutionStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read projection of an execution
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionView {
    pub id: Uuid,
    pub execution_id: String,
    pub workflow_name: String,
    pub version: String,
    pub status: ExecutionStatus,
    pub current_state: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Read projection of a step, with its slice of the audit log
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub id: Uuid,
    pub step_name: String,
    pub step_type: String,
    pub status: crate::store::StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub history: Vec<HistoryView>,
}

/// One audit log event
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryView {
    pub id: i64,
    pub step_name: Option<String>,
    pub event_type: String,
    pub event_data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Read projection of a registered workflow with its versions
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowView {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub versions: Vec<WorkflowVersionView>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersionView {
    pub id: Uuid,
    pub version: String,
    pub definition: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a start request
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// A new execution was created
    Started(ExecutionView),
    /// An unexpired idempotency key mapped to this earlier execution
    Existing(ExecutionView),
}

impl StartOutcome {
    pub fn view(&self) -> &ExecutionView {
        match self {
            Self::Started(view) | Self::Existing(view) => view,
        }
    }

    pub fn into_view(self) -> ExecutionView {
        match self {
            Self::Started(view) | Self::Existing(view) => view,
        }
    }
}

/// The core API over a store and a clock
pub struct ExecutionService {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    idempotency_ttl: Duration,
}

impl ExecutionService {
    pub fn new(store: Arc<dyn ExecutionStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            idempotency_ttl: Duration::hours(24),
        }
    }

    /// Override the idempotency-key TTL (default 24 hours).
    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    // =========================================================================
    // Definition registry
    // =========================================================================

    /// Register a definition version under a workflow name, creating the
    /// workflow on first use. The definition is validated up front so broken
    /// graphs are rejected at registration rather than at execution.
    #[instrument(skip(self, definition))]
    pub async fn register_workflow(
        &self,
        name: &str,
        version: &str,
        description: Option<&str>,
        definition: Value,
    ) -> Result<WorkflowVersionView, EngineError> {
        WorkflowDefinition::parse(&definition)?;

        let workflow = match self.store.find_workflow_by_name(name).await? {
            Some(existing) => existing,
            None => self.store.create_workflow(name, description).await?,
        };

        let row = self
            .store
            .create_version(workflow.id, name, version, &definition)
            .await
            .map_err(|e| match e {
                StoreError::DuplicateVersion { name, version } => EngineError::DuplicateVersion {
                    workflow: name,
                    version,
                },
                other => EngineError::Store(other),
            })?;

        info!(name, version, "registered workflow version");
        Ok(version_view(row))
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowView>, EngineError> {
        let mut views = Vec::new();
        for workflow in self.store.list_workflows().await? {
            views.push(self.workflow_view(workflow).await?);
        }
        Ok(views)
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<WorkflowView, EngineError> {
        let workflow = self
            .store
            .get_workflow(id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))?;
        self.workflow_view(workflow).await
    }

    // =========================================================================
    // Execution lifecycle
    // =========================================================================

    /// Start an execution of `workflow_name` against `input`.
    ///
    /// When `version` is absent, the most recent version (lexicographic
    /// descending version string) is used. A provided idempotency key that
    /// maps to an unexpired earlier start returns that execution instead of
    /// creating a new one.
    #[instrument(skip(self, input))]
    pub async fn start_execution(
        &self,
        workflow_name: &str,
        version: Option<&str>,
        input: Value,
        idempotency_key: Option<&str>,
    ) -> Result<StartOutcome, EngineError> {
        let now = self.clock.now();

        if let Some(key) = non_blank(idempotency_key) {
            if let Some(existing) = self.find_existing_execution(key, now).await? {
                info!(key, execution_id = %existing.execution_id, "idempotency key matched existing execution");
                return Ok(StartOutcome::Existing(self.execution_view(existing).await?));
            }
        }

        let workflow = self
            .store
            .find_workflow_by_name(workflow_name)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_name.to_string()))?;

        let version_row = match version {
            Some(version) => self
                .store
                .find_version(workflow.id, version)
                .await?
                .ok_or_else(|| EngineError::VersionNotFound {
                    workflow: workflow_name.to_string(),
                    version: version.to_string(),
                })?,
            None => self.store.latest_version(workflow.id).await?.ok_or_else(|| {
                EngineError::VersionNotFound {
                    workflow: workflow_name.to_string(),
                    version: "latest".to_string(),
                }
            })?,
        };

        let definition = WorkflowDefinition::parse(&version_row.definition)?;
        let start_state = definition
            .state(&definition.start_at)
            .expect("validated definition has a start state");

        // A Wait start state is scheduled time-gated from the outset; every
        // other start state is immediately eligible.
        let (step_status, run_after_ts) = match start_state {
            StateDef::Wait(wait) => (
                StepStatus::Waiting,
                Some(wait.deadline(&definition.start_at, now)?),
            ),
            _ => (StepStatus::Pending, None),
        };
        let retry = start_state.retry_params();

        let execution_id = generate_execution_id(now);
        let new = NewExecution {
            workflow_version_id: version_row.id,
            execution_id: execution_id.clone(),
            start_state: definition.start_at.clone(),
            start_state_type: start_state.state_type(),
            input,
            step_status,
            run_after_ts,
            timeout_seconds: start_state.timeout_seconds(),
            max_retries: retry.max_attempts,
            backoff_multiplier: retry.backoff_multiplier,
            initial_interval_ms: retry.initial_interval_ms,
            now,
        };

        let mut tx = self.store.begin().await?;
        let execution = tx.create_execution(new).await?;
        if let Some(key) = non_blank(idempotency_key) {
            tx.insert_idempotency_key(key, &execution_id, now + self.idempotency_ttl, now)
                .await?;
        }
        tx.append_history(
            execution.id,
            Some(&definition.start_at),
            EventType::ExecutionStarted,
            json!({ "workflowName": workflow_name, "version": version_row.version }),
            now,
        )
        .await?;
        tx.commit().await?;

        info!(%execution_id, workflow = workflow_name, "started workflow execution");
        Ok(StartOutcome::Started(self.execution_view(execution).await?))
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionView, EngineError> {
        let execution = self
            .store
            .find_execution_by_execution_id(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
        self.execution_view(execution).await
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionView>, EngineError> {
        let mut views = Vec::new();
        for execution in self.store.list_executions(filter).await? {
            views.push(self.execution_view(execution).await?);
        }
        Ok(views)
    }

    /// Fetch one step of an execution with its slice of the audit log.
    pub async fn get_step(
        &self,
        execution_id: &str,
        step_id: Uuid,
    ) -> Result<StepView, EngineError> {
        let execution = self
            .store
            .find_execution_by_execution_id(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        let step = self
            .store
            .get_step(step_id)
            .await?
            .filter(|step| step.execution_id == execution.id)
            .ok_or(EngineError::StepNotFound(step_id))?;

        let history = self
            .store
            .list_history(execution.id)
            .await?
            .into_iter()
            .filter(|event| event.step_name.as_deref() == Some(step.step_name.as_str()))
            .map(history_view)
            .collect();

        Ok(step_view(step, history))
    }

    pub async fn list_history(
        &self,
        execution_id: &str,
    ) -> Result<Vec<HistoryView>, EngineError> {
        let execution = self
            .store
            .find_execution_by_execution_id(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
        Ok(self
            .store
            .list_history(execution.id)
            .await?
            .into_iter()
            .map(history_view)
            .collect())
    }

    /// Cancel a RUNNING execution.
    ///
    /// Queued work is removed immediately; a step currently running in some
    /// worker finishes its handler and then discovers the cancellation at
    /// persistence time, scheduling nothing further. Cancelling a terminal
    /// execution is an [`EngineError::InvalidState`] with no state change.
    #[instrument(skip(self))]
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<ExecutionView, EngineError> {
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let Some(mut execution) = tx.execution_by_execution_id_for_update(execution_id).await?
        else {
            tx.rollback().await?;
            return Err(EngineError::ExecutionNotFound(execution_id.to_string()));
        };

        if execution.status != ExecutionStatus::Running {
            let status = execution.status;
            tx.rollback().await?;
            return Err(EngineError::InvalidState {
                execution_id: execution_id.to_string(),
                status,
            });
        }

        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(now);
        tx.update_execution(&execution).await?;
        tx.delete_queue_items_for_execution(execution.id).await?;
        tx.append_history(
            execution.id,
            None,
            EventType::ExecutionCancelled,
            json!({ "cancelledAt": now }),
            now,
        )
        .await?;
        tx.commit().await?;

        info!(execution_id, "cancelled workflow execution");
        self.execution_view(execution).await
    }

    // =========================================================================
    // View assembly
    // =========================================================================

    async fn find_existing_execution(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionRow>, EngineError> {
        let Some(record) = self.store.find_idempotency_key(key).await? else {
            return Ok(None);
        };
        if record.expires_at <= now {
            return Ok(None);
        }
        Ok(self
            .store
            .find_execution_by_execution_id(&record.resource_id)
            .await?)
    }

    async fn execution_view(&self, execution: ExecutionRow) -> Result<ExecutionView, EngineError> {
        let (workflow_name, version) = self.version_names(execution.workflow_version_id).await?;
        Ok(ExecutionView {
            id: execution.id,
            execution_id: execution.execution_id,
            workflow_name,
            version,
            status: execution.status,
            current_state: execution.current_state,
            input: execution.input,
            output: execution.output,
            error_message: execution.error_message,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            created_at: execution.created_at,
        })
    }

    async fn version_names(
        &self,
        workflow_version_id: Uuid,
    ) -> Result<(String, String), EngineError> {
        let Some(version) = self.store.get_version(workflow_version_id).await? else {
            return Ok((String::new(), String::new()));
        };
        let name = self
            .store
            .get_workflow(version.workflow_id)
            .await?
            .map(|w| w.name)
            .unwrap_or_default();
        Ok((name, version.version))
    }

    async fn workflow_view(&self, workflow: WorkflowRow) -> Result<WorkflowView, EngineError> {
        let versions = self
            .store
            .list_versions(workflow.id)
            .await?
            .into_iter()
            .map(version_view)
            .collect();
        Ok(WorkflowView {
            id: workflow.id,
            name: workflow.name,
            description: workflow.description,
            created_at: workflow.created_at,
            updated_at: workflow.updated_at,
            versions,
        })
    }
}

fn non_blank(key: Option<&str>) -> Option<&str> {
    key.map(str::trim).filter(|k| !k.is_empty())
}

/// User-visible execution ids: `exec-<millis>-<8 uuid chars>`
fn generate_execution_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::now_v7().simple().to_string();
    format!("exec-{}-{}", now.timestamp_millis(), &suffix[..8])
}

fn version_view(row: WorkflowVersionRow) -> WorkflowVersionView {
    WorkflowVersionView {
        id: row.id,
        version: row.version,
        definition: row.definition,
        is_active: row.is_active,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

fn step_view(step: StepRow, history: Vec<HistoryView>) -> StepView {
    StepView {
        id: step.id,
        step_name: step.step_name,
        step_type: step.step_type.as_str().to_string(),
        status: step.status,
        input: step.input,
        output: step.output,
        error_type: step.error_type,
        error_message: step.error_message,
        retry_count: step.retry_count,
        max_retries: step.max_retries,
        started_at: step.started_at,
        completed_at: step.completed_at,
        created_at: step.created_at,
        history,
    }
}

fn history_view(row: crate::store::HistoryRow) -> HistoryView {
    HistoryView {
        id: row.id,
        step_name: row.step_name,
        event_type: row.event_type,
        event_data: row.event_data,
        timestamp: row.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_ids_are_unique_and_prefixed() {
        let now = Utc::now();
        let a = generate_execution_id(now);
        let b = generate_execution_id(now);
        assert!(a.starts_with("exec-"));
        assert_ne!(a, b);
    }

    #[test]
    fn blank_idempotency_keys_are_ignored() {
        assert_eq!(non_blank(None), None);
        assert_eq!(non_blank(Some("")), None);
        assert_eq!(non_blank(Some("   ")), None);
        assert_eq!(non_blank(Some(" k1 ")), Some("k1"));
    }
}
