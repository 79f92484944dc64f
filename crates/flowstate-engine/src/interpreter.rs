//! Single-state interpretation
//!
//! The interpreter runs exactly one state of one execution and reports the
//! outcome as a [`TaskResult`]; all persistence happens in the worker around
//! it. Wait states are never interpreted here — the wake loop owns them.

use std::sync::Arc;

use chrono::Duration;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::definition::{StateDef, StateType};
use crate::store::StepRow;
use crate::task::{TaskContext, TaskRegistry, TaskResult};

/// Run the interpreter for one state.
pub async fn interpret_state(
    state: &StateDef,
    step: &StepRow,
    execution_id: &str,
    registry: &TaskRegistry,
    clock: &dyn Clock,
) -> TaskResult {
    match state {
        StateDef::Task(task) => {
            let Some(handler) = registry.get(&task.resource) else {
                warn!(resource = %task.resource, "no task handler registered");
                return TaskResult::failure(
                    "UnknownHandler",
                    format!("no handler registered for resource '{}'", task.resource),
                );
            };
            let ctx = TaskContext {
                execution_id: execution_id.to_string(),
                step_name: step.step_name.clone(),
                deadline: task.timeout.map(|secs| clock.now() + Duration::seconds(secs)),
            };
            run_handler(handler, ctx, step.input.clone()).await
        }
        StateDef::Choice(choice) => {
            evaluate_choice(&choice.choices, choice.default_choice.as_deref(), &step.input)
        }
        StateDef::Wait(_) => {
            // Dispatch skips Wait steps before interpreting; reaching this is
            // the safety net for a mistimed claim.
            TaskResult::failure("StillWaiting", "wait step is not due yet")
        }
        StateDef::Success {} => TaskResult::success(step.input.clone()),
        StateDef::Fail(fail) => {
            let message = fail
                .error
                .clone()
                .or_else(|| {
                    step.input
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "Workflow failed".to_string());
            TaskResult::failure("WorkflowFail", message)
        }
    }
}

/// Execute a handler on its own task so a panicking handler is contained as a
/// step failure instead of taking the dispatcher down.
async fn run_handler(
    handler: Arc<dyn crate::task::TaskHandler>,
    ctx: TaskContext,
    input: Value,
) -> TaskResult {
    let join = tokio::spawn(async move { handler.execute(ctx, input).await });
    match join.await {
        Ok(result) => result,
        Err(e) => TaskResult::failure("HandlerPanic", format!("task handler panicked: {e}")),
    }
}

/// Evaluate a Choice state: first matching rule wins, otherwise the default.
fn evaluate_choice(
    choices: &[crate::definition::ChoiceRule],
    default_choice: Option<&str>,
    input: &Value,
) -> TaskResult {
    for rule in choices {
        if rule.condition.evaluate(input) {
            debug!(next = %rule.next, "choice condition matched");
            return TaskResult::success(json!({ "nextState": rule.next }));
        }
    }

    match default_choice {
        Some(default) => {
            debug!(next = default, "no choice matched, using default");
            TaskResult::success(json!({ "nextState": default }))
        }
        None => TaskResult::failure(
            "ChoiceError",
            "No matching choice found and no default specified",
        ),
    }
}

/// Resolve the successor state name after a successful step.
///
/// Choice states carry their decision in the step output (`nextState`); every
/// other state type uses the static `next` from its definition.
pub fn resolve_next(state: &StateDef, output: &Value) -> Option<String> {
    if state.state_type() == StateType::Choice {
        output
            .get("nextState")
            .and_then(Value::as_str)
            .map(str::to_string)
    } else {
        state.next_state().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::condition::Condition;
    use crate::definition::{ChoiceRule, FailState, TaskState, WorkflowDefinition};
    use crate::store::{StepStatus, StepRow};
    use crate::task::{MockTaskHandler, TaskHandler};
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    fn step_with_input(input: Value) -> StepRow {
        let now = Utc::now();
        StepRow {
            id: Uuid::now_v7(),
            execution_id: Uuid::now_v7(),
            step_name: "state".to_string(),
            step_type: StateType::Task,
            status: StepStatus::Running,
            input,
            output: None,
            error_type: None,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_interval_ms: 1000,
            timeout_seconds: None,
            run_after_ts: None,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn condition(operator: &str, variable: &str, value: Value) -> Condition {
        Condition {
            operator: Some(operator.to_string()),
            variable: Some(variable.to_string()),
            value,
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl TaskHandler for PanickingHandler {
        async fn execute(&self, _ctx: TaskContext, _input: Value) -> TaskResult {
            panic!("handler blew up");
        }
    }

    #[tokio::test]
    async fn unknown_resource_fails_the_step() {
        let registry = TaskRegistry::new();
        let state = StateDef::Task(TaskState {
            resource: "ghost.service".to_string(),
            next: None,
            timeout: None,
            retry: None,
            catch: None,
        });
        let result = interpret_state(
            &state,
            &step_with_input(json!({})),
            "exec-1",
            &registry,
            &SystemClock,
        )
        .await;
        let TaskResult::Failure { error_type, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(error_type, "UnknownHandler");
    }

    #[tokio::test]
    async fn panicking_handler_becomes_a_step_failure() {
        let mut registry = TaskRegistry::new();
        registry.register("boom", Arc::new(PanickingHandler));
        let state = StateDef::Task(TaskState {
            resource: "boom".to_string(),
            next: None,
            timeout: None,
            retry: None,
            catch: None,
        });
        let result = interpret_state(
            &state,
            &step_with_input(json!({})),
            "exec-1",
            &registry,
            &SystemClock,
        )
        .await;
        let TaskResult::Failure { error_type, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(error_type, "HandlerPanic");
    }

    #[tokio::test]
    async fn task_handler_output_is_propagated() {
        let mut registry = TaskRegistry::new();
        registry.register("mock", Arc::new(MockTaskHandler));
        let state = StateDef::Task(TaskState {
            resource: "mock".to_string(),
            next: Some("done".to_string()),
            timeout: Some(5),
            retry: None,
            catch: None,
        });
        let result = interpret_state(
            &state,
            &step_with_input(json!({"orderId": "X"})),
            "exec-1",
            &registry,
            &SystemClock,
        )
        .await;
        let TaskResult::Success { output } = result else {
            panic!("expected success");
        };
        assert_eq!(output["orderId"], "X");
    }

    #[tokio::test]
    async fn choice_picks_first_matching_rule() {
        let registry = TaskRegistry::new();
        let state = StateDef::Choice(crate::definition::ChoiceState {
            choices: vec![
                ChoiceRule {
                    condition: condition("numericGreaterThan", "$.total", json!(100)),
                    next: "review".to_string(),
                },
                ChoiceRule {
                    condition: condition("booleanEquals", "$.inStock", json!(true)),
                    next: "ship".to_string(),
                },
            ],
            default_choice: Some("reject".to_string()),
        });

        let result = interpret_state(
            &state,
            &step_with_input(json!({"total": 20, "inStock": true})),
            "exec-1",
            &registry,
            &SystemClock,
        )
        .await;
        let TaskResult::Success { output } = result else {
            panic!("expected success");
        };
        assert_eq!(output, json!({"nextState": "ship"}));
        assert_eq!(resolve_next(&state, &output), Some("ship".to_string()));
    }

    #[tokio::test]
    async fn choice_without_match_or_default_is_a_choice_error() {
        let registry = TaskRegistry::new();
        let state = StateDef::Choice(crate::definition::ChoiceState {
            choices: vec![ChoiceRule {
                condition: condition("booleanEquals", "$.flag", json!(true)),
                next: "yes".to_string(),
            }],
            default_choice: None,
        });
        let result = interpret_state(
            &state,
            &step_with_input(json!({"flag": false})),
            "exec-1",
            &registry,
            &SystemClock,
        )
        .await;
        let TaskResult::Failure { error_type, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(error_type, "ChoiceError");
    }

    #[tokio::test]
    async fn fail_state_prefers_definition_error_then_input() {
        let registry = TaskRegistry::new();

        let from_def = StateDef::Fail(FailState {
            error: Some("OOS".to_string()),
            cause: None,
        });
        let result = interpret_state(
            &from_def,
            &step_with_input(json!({"error": "ignored"})),
            "exec-1",
            &registry,
            &SystemClock,
        )
        .await;
        assert_eq!(result, TaskResult::failure("WorkflowFail", "OOS"));

        let from_input = StateDef::Fail(FailState {
            error: None,
            cause: None,
        });
        let result = interpret_state(
            &from_input,
            &step_with_input(json!({"error": "from input"})),
            "exec-1",
            &registry,
            &SystemClock,
        )
        .await;
        assert_eq!(result, TaskResult::failure("WorkflowFail", "from input"));

        let fallback = interpret_state(
            &from_input,
            &step_with_input(json!({})),
            "exec-1",
            &registry,
            &SystemClock,
        )
        .await;
        assert_eq!(fallback, TaskResult::failure("WorkflowFail", "Workflow failed"));
    }

    #[tokio::test]
    async fn success_state_echoes_its_input() {
        let registry = TaskRegistry::new();
        let def = WorkflowDefinition::parse(&json!({
            "startAt": "done",
            "states": {"done": {"type": "Success"}}
        }))
        .unwrap();
        let state = def.state("done").unwrap();
        let result = interpret_state(
            state,
            &step_with_input(json!({"orderId": "X", "processedAt": 1})),
            "exec-1",
            &registry,
            &SystemClock,
        )
        .await;
        assert_eq!(
            result,
            TaskResult::success(json!({"orderId": "X", "processedAt": 1}))
        );
    }
}
