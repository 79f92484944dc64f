//! Task handlers and the resource registry
//!
//! Task states name a `resource` (e.g. `"orderService.validate"`); the
//! registry maps those names to [`TaskHandler`] implementations supplied by
//! the host at startup. The registry is effectively immutable once workers
//! are running. Handlers run on worker tasks and must tolerate concurrent
//! invocation with different inputs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

/// Outcome of one task handler invocation
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Success {
        output: Value,
    },
    Failure {
        error_type: String,
        error_message: String,
    },
}

impl TaskResult {
    pub fn success(output: Value) -> Self {
        Self::Success { output }
    }

    pub fn failure(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self::Failure {
            error_type: error_type.into(),
            error_message: error_message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Context handed to a handler for one step invocation.
///
/// The deadline is advisory, derived from the state's `timeout` seconds.
/// Handlers SHOULD stop work past it, but the engine never force-aborts a
/// running handler; a handler that ignores its deadline and never returns is
/// eventually rescued by stuck-step recovery.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// User-visible execution id
    pub execution_id: String,
    /// Name of the state being executed
    pub step_name: String,
    /// Advisory completion deadline
    pub deadline: Option<DateTime<Utc>>,
}

/// A unit of host-provided work invoked by Task states
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn execute(&self, ctx: TaskContext, input: Value) -> TaskResult;
}

/// Maps resource names to task handlers.
///
/// Populated at startup; lookups of unknown resources surface to the
/// interpreter as an `UnknownHandler` step failure rather than an error here.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a resource name, replacing any previous one.
    pub fn register(&mut self, resource: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let resource = resource.into();
        debug!(%resource, "registered task handler");
        self.handlers.insert(resource, handler);
    }

    pub fn get(&self, resource: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(resource).cloned()
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.handlers.contains_key(resource)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// All registered resource names
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("resources", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Configurable pass-through handler for demos and tests.
///
/// Interprets a few well-known input keys:
/// - `sleepMs`: sleep that long before responding
/// - `simulateError` (+ optional `errorType`/`errorMessage`): return a failure
/// - `shouldFail: true`: return a failure
///
/// Otherwise echoes the input with a `processedAt` millisecond timestamp
/// added.
#[derive(Debug, Default)]
pub struct MockTaskHandler;

#[async_trait]
impl TaskHandler for MockTaskHandler {
    async fn execute(&self, ctx: TaskContext, input: Value) -> TaskResult {
        debug!(execution_id = %ctx.execution_id, step = %ctx.step_name, "executing mock task");

        if let Some(sleep_ms) = input.get("sleepMs").and_then(Value::as_u64) {
            tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
        }

        if input.get("simulateError").is_some() {
            let error_type = input
                .get("errorType")
                .and_then(Value::as_str)
                .unwrap_or("MockError");
            let error_message = input
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("Simulated error occurred");
            return TaskResult::failure(error_type, error_message);
        }

        if input.get("shouldFail").and_then(Value::as_bool) == Some(true) {
            return TaskResult::failure("ConditionalFailure", "Task failed due to shouldFail flag");
        }

        let mut output = match input {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        output.insert(
            "processedAt".to_string(),
            Value::from(Utc::now().timestamp_millis()),
        );

        TaskResult::success(Value::Object(output))
    }
}
