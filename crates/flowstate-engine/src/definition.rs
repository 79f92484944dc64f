//! Workflow definition parsing and validation
//!
//! The stored `definition_json` of a workflow version is re-parsed into a
//! read-only state graph every time an execution is interpreted; nothing in
//! the engine caches parsed graphs. Parsing validates the structural rules
//! (reachable start state, resolvable transitions, well-formed Wait specs) so
//! an invalid definition fails an execution deterministically instead of
//! failing mid-graph.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Condition;

/// Errors raised while reading a stored workflow definition.
///
/// All variants are fatal to the execution that triggered the read.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DefinitionError {
    /// Definition JSON did not deserialize into a state graph
    #[error("invalid workflow definition: {0}")]
    Parse(String),

    /// `startAt` does not name a defined state
    #[error("start state '{0}' is not defined")]
    MissingStartState(String),

    /// A `next` or `defaultChoice` points at a state that does not exist
    #[error("state '{state}' references undefined state '{target}'")]
    DanglingTransition { state: String, target: String },

    /// Choice state with nothing to choose
    #[error("choice state '{0}' has no choices and no default")]
    EmptyChoice(String),

    /// Wait state must carry exactly one of `seconds` / `timestamp`
    #[error("wait state '{0}' must set exactly one of 'seconds' or 'timestamp'")]
    InvalidWait(String),

    /// Wait `timestamp` did not parse as an RFC 3339 instant
    #[error("invalid wait timestamp '{timestamp}' in state '{state}'")]
    InvalidTimestamp { state: String, timestamp: String },
}

/// Discriminator for the five supported state types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateType {
    Task,
    Choice,
    Wait,
    Success,
    Fail,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "Task",
            Self::Choice => "Choice",
            Self::Wait => "Wait",
            Self::Success => "Success",
            Self::Fail => "Fail",
        }
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Task" => Ok(Self::Task),
            "Choice" => Ok(Self::Choice),
            "Wait" => Ok(Self::Wait),
            "Success" => Ok(Self::Success),
            "Fail" => Ok(Self::Fail),
            other => Err(format!("unknown state type: {other}")),
        }
    }
}

/// Retry parameters recorded on steps.
///
/// Parsed from the optional `retry` block of a Task state and persisted on
/// each step row, but never consumed by the engine: step failures are
/// terminal. The fields are reserved for a future retry extension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryParams {
    pub max_attempts: i32,
    pub backoff_multiplier: f64,
    pub initial_interval_ms: i64,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_multiplier: 2.0,
            initial_interval_ms: 1000,
        }
    }
}

/// Task state: invoke a registered handler, then move to `next` (or finish)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// Resource identifier resolved through the task registry
    pub resource: String,
    #[serde(default)]
    pub next: Option<String>,
    /// Advisory handler timeout in seconds
    #[serde(default)]
    pub timeout: Option<i64>,
    /// Accepted and stored, not enforced
    #[serde(default)]
    pub retry: Option<Value>,
    /// Accepted and stored, not enforced
    #[serde(default)]
    pub catch: Option<Value>,
}

impl TaskState {
    /// Retry parameters from the `retry` block, falling back to defaults.
    pub fn retry_params(&self) -> RetryParams {
        let defaults = RetryParams::default();
        let Some(retry) = self.retry.as_ref().and_then(Value::as_object) else {
            return defaults;
        };
        RetryParams {
            max_attempts: retry
                .get("maxAttempts")
                .and_then(Value::as_i64)
                .map(|v| v as i32)
                .unwrap_or(defaults.max_attempts),
            backoff_multiplier: retry
                .get("backoffMultiplier")
                .and_then(Value::as_f64)
                .unwrap_or(defaults.backoff_multiplier),
            initial_interval_ms: retry
                .get("initialIntervalMs")
                .and_then(Value::as_i64)
                .unwrap_or(defaults.initial_interval_ms),
        }
    }
}

/// One branch of a Choice state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceRule {
    pub condition: Condition,
    pub next: String,
}

/// Choice state: first matching condition wins, else the default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceState {
    #[serde(default)]
    pub choices: Vec<ChoiceRule>,
    #[serde(default, rename = "defaultChoice")]
    pub default_choice: Option<String>,
}

/// Wait state: park the execution until a relative or absolute deadline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitState {
    #[serde(default)]
    pub seconds: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub next: String,
}

impl WaitState {
    /// Compute the instant this wait becomes due.
    pub fn deadline(&self, state_name: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, DefinitionError> {
        match (self.seconds, &self.timestamp) {
            (Some(seconds), None) => Ok(now + Duration::seconds(seconds)),
            (None, Some(timestamp)) => DateTime::parse_from_rfc3339(timestamp)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| DefinitionError::InvalidTimestamp {
                    state: state_name.to_string(),
                    timestamp: timestamp.clone(),
                }),
            _ => Err(DefinitionError::InvalidWait(state_name.to_string())),
        }
    }
}

/// Fail state: terminate the execution as failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailState {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
}

/// A single state in the graph, tagged by its `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateDef {
    Task(TaskState),
    Choice(ChoiceState),
    Wait(WaitState),
    Success {},
    Fail(FailState),
}

impl StateDef {
    pub fn state_type(&self) -> StateType {
        match self {
            Self::Task(_) => StateType::Task,
            Self::Choice(_) => StateType::Choice,
            Self::Wait(_) => StateType::Wait,
            Self::Success {} => StateType::Success,
            Self::Fail(_) => StateType::Fail,
        }
    }

    /// Static successor of this state, when it has one.
    ///
    /// Choice successors are dynamic (chosen by condition evaluation) and
    /// Success/Fail are terminal, so only Task and Wait return a name here.
    pub fn next_state(&self) -> Option<&str> {
        match self {
            Self::Task(task) => task.next.as_deref(),
            Self::Wait(wait) => Some(&wait.next),
            _ => None,
        }
    }

    /// Advisory handler timeout for Task states.
    pub fn timeout_seconds(&self) -> Option<i64> {
        match self {
            Self::Task(task) => task.timeout,
            _ => None,
        }
    }

    /// Retry parameters recorded on the step row for this state.
    pub fn retry_params(&self) -> RetryParams {
        match self {
            Self::Task(task) => task.retry_params(),
            _ => RetryParams::default(),
        }
    }
}

/// A parsed, validated workflow state graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(rename = "startAt")]
    pub start_at: String,
    pub states: BTreeMap<String, StateDef>,
}

impl WorkflowDefinition {
    /// Parse a stored definition and validate its structure.
    pub fn parse(definition: &Value) -> Result<Self, DefinitionError> {
        let parsed: Self = serde_json::from_value(definition.clone())
            .map_err(|e| DefinitionError::Parse(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Structural validation of the state graph.
    ///
    /// Checks: `startAt` exists; every `next`/`defaultChoice` resolves;
    /// Choice states have at least one choice or a default; Wait states set
    /// exactly one of `seconds`/`timestamp`.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if !self.states.contains_key(&self.start_at) {
            return Err(DefinitionError::MissingStartState(self.start_at.clone()));
        }

        for (name, state) in &self.states {
            let mut check_target = |target: &str| -> Result<(), DefinitionError> {
                if self.states.contains_key(target) {
                    Ok(())
                } else {
                    Err(DefinitionError::DanglingTransition {
                        state: name.clone(),
                        target: target.to_string(),
                    })
                }
            };

            match state {
                StateDef::Task(task) => {
                    if let Some(next) = &task.next {
                        check_target(next)?;
                    }
                }
                StateDef::Choice(choice) => {
                    if choice.choices.is_empty() && choice.default_choice.is_none() {
                        return Err(DefinitionError::EmptyChoice(name.clone()));
                    }
                    for rule in &choice.choices {
                        check_target(&rule.next)?;
                    }
                    if let Some(default) = &choice.default_choice {
                        check_target(default)?;
                    }
                }
                StateDef::Wait(wait) => {
                    check_target(&wait.next)?;
                    if wait.seconds.is_some() == wait.timestamp.is_some() {
                        return Err(DefinitionError::InvalidWait(name.clone()));
                    }
                }
                StateDef::Success {} | StateDef::Fail(_) => {}
            }
        }

        Ok(())
    }

    /// Look up a state by name.
    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_definition() -> Value {
        json!({
            "name": "orders",
            "version": "1.0.0",
            "startAt": "validate",
            "states": {
                "validate": {"type": "Task", "resource": "orderService.validate", "next": "done"},
                "done": {"type": "Success"}
            }
        })
    }

    #[test]
    fn parses_linear_definition() {
        let def = WorkflowDefinition::parse(&linear_definition()).unwrap();
        assert_eq!(def.start_at, "validate");
        assert_eq!(def.states.len(), 2);
        assert_eq!(
            def.state("validate").unwrap().state_type(),
            StateType::Task
        );
        assert_eq!(def.state("validate").unwrap().next_state(), Some("done"));
        assert_eq!(def.state("done").unwrap().next_state(), None);
    }

    #[test]
    fn parses_all_state_types() {
        let def = WorkflowDefinition::parse(&json!({
            "startAt": "t",
            "states": {
                "t": {"type": "Task", "resource": "mock", "timeout": 30, "next": "c",
                      "retry": {"maxAttempts": 5, "backoffMultiplier": 1.5, "initialIntervalMs": 250}},
                "c": {"type": "Choice",
                      "choices": [{"condition": {"operator": "booleanEquals", "variable": "$.ok", "value": true}, "next": "w"}],
                      "defaultChoice": "bad"},
                "w": {"type": "Wait", "seconds": 10, "next": "ok"},
                "ok": {"type": "Success"},
                "bad": {"type": "Fail", "error": "NotOk", "cause": "condition failed"}
            }
        }))
        .unwrap();

        let task = def.state("t").unwrap();
        assert_eq!(task.timeout_seconds(), Some(30));
        assert_eq!(
            task.retry_params(),
            RetryParams {
                max_attempts: 5,
                backoff_multiplier: 1.5,
                initial_interval_ms: 250
            }
        );
        assert_eq!(def.state("w").unwrap().state_type(), StateType::Wait);
        assert_eq!(def.state("bad").unwrap().state_type(), StateType::Fail);
    }

    #[test]
    fn missing_start_state_is_rejected() {
        let result = WorkflowDefinition::parse(&json!({
            "startAt": "nope",
            "states": {"a": {"type": "Success"}}
        }));
        assert!(matches!(result, Err(DefinitionError::MissingStartState(_))));
    }

    #[test]
    fn dangling_next_is_rejected() {
        let result = WorkflowDefinition::parse(&json!({
            "startAt": "a",
            "states": {"a": {"type": "Task", "resource": "mock", "next": "ghost"}}
        }));
        assert!(matches!(
            result,
            Err(DefinitionError::DanglingTransition { .. })
        ));
    }

    #[test]
    fn empty_choice_is_rejected() {
        let result = WorkflowDefinition::parse(&json!({
            "startAt": "c",
            "states": {"c": {"type": "Choice", "choices": []}}
        }));
        assert!(matches!(result, Err(DefinitionError::EmptyChoice(_))));
    }

    #[test]
    fn wait_needs_exactly_one_time_spec() {
        let neither = WorkflowDefinition::parse(&json!({
            "startAt": "w",
            "states": {"w": {"type": "Wait", "next": "done"}, "done": {"type": "Success"}}
        }));
        assert!(matches!(neither, Err(DefinitionError::InvalidWait(_))));

        let both = WorkflowDefinition::parse(&json!({
            "startAt": "w",
            "states": {
                "w": {"type": "Wait", "seconds": 5, "timestamp": "2030-01-01T00:00:00Z", "next": "done"},
                "done": {"type": "Success"}
            }
        }));
        assert!(matches!(both, Err(DefinitionError::InvalidWait(_))));
    }

    #[test]
    fn wait_deadline_from_seconds() {
        let wait = WaitState {
            seconds: Some(90),
            timestamp: None,
            next: "done".to_string(),
        };
        let now = Utc::now();
        assert_eq!(wait.deadline("w", now).unwrap(), now + Duration::seconds(90));
    }

    #[test]
    fn wait_deadline_from_timestamp() {
        let wait = WaitState {
            seconds: None,
            timestamp: Some("2030-06-01T12:00:00+02:00".to_string()),
            next: "done".to_string(),
        };
        let deadline = wait.deadline("w", Utc::now()).unwrap();
        assert_eq!(deadline.to_rfc3339(), "2030-06-01T10:00:00+00:00");
    }

    #[test]
    fn wait_deadline_rejects_bad_timestamp() {
        let wait = WaitState {
            seconds: None,
            timestamp: Some("tomorrow-ish".to_string()),
            next: "done".to_string(),
        };
        assert!(matches!(
            wait.deadline("w", Utc::now()),
            Err(DefinitionError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let result = WorkflowDefinition::parse(&json!({"startAt": 42}));
        assert!(matches!(result, Err(DefinitionError::Parse(_))));

        let missing_resource = WorkflowDefinition::parse(&json!({
            "startAt": "a",
            "states": {"a": {"type": "Task", "next": "a"}}
        }));
        assert!(matches!(missing_resource, Err(DefinitionError::Parse(_))));
    }

    #[test]
    fn unknown_top_level_fields_are_ignored() {
        // Stored definitions carry name/version alongside the graph.
        let def = WorkflowDefinition::parse(&linear_definition()).unwrap();
        assert_eq!(def.start_at, "validate");
    }
}
