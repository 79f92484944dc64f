//! Choice condition evaluation
//!
//! A condition is a single `{operator, variable, value}` triple evaluated
//! against the JSON context a Choice step received as input. Evaluation is
//! total: malformed conditions, missing variables, and unparseable numbers
//! all evaluate to `false` rather than erroring, so a bad condition can at
//! worst route an execution to the default choice.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Comparison tolerance for `numericEquals`
const NUMERIC_EPSILON: f64 = 1e-6;

/// A single Choice-state condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub variable: Option<String>,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    /// Evaluate this condition against a context object.
    ///
    /// Supported operators: `booleanEquals`, `stringEquals`, `numericEquals`,
    /// `numericGreaterThan`, `numericLessThan`. Anything else is `false`.
    pub fn evaluate(&self, context: &Value) -> bool {
        let (Some(operator), Some(variable)) = (&self.operator, &self.variable) else {
            debug!("condition missing operator or variable");
            return false;
        };

        let actual = extract_path(context, variable);

        let result = match operator.as_str() {
            "booleanEquals" => boolean_equals(actual, &self.value),
            "stringEquals" => string_equals(actual, &self.value),
            "numericEquals" => {
                numeric_compare(actual, &self.value, |a, b| (a - b).abs() < NUMERIC_EPSILON)
            }
            "numericGreaterThan" => numeric_compare(actual, &self.value, |a, b| a > b),
            "numericLessThan" => numeric_compare(actual, &self.value, |a, b| a < b),
            other => {
                debug!(operator = other, "unsupported condition operator");
                false
            }
        };

        debug!(%variable, %operator, result, "evaluated condition");
        result
    }
}

/// Extract a dotted path from a JSON object.
///
/// A leading `$.` prefix is stripped. Traversal is strictly through object
/// keys; hitting a non-object mid-path or a missing key yields `None`.
fn extract_path<'a>(context: &'a Value, variable: &str) -> Option<&'a Value> {
    let path = variable.strip_prefix("$.").unwrap_or(variable);

    let mut current = context;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn boolean_equals(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None, Value::Null) | (Some(Value::Null), Value::Null) => true,
        (None, _) | (Some(Value::Null), _) | (_, Value::Null) => false,
        (Some(actual), expected) => as_bool(actual) == as_bool(expected),
    }
}

fn string_equals(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None, Value::Null) | (Some(Value::Null), Value::Null) => true,
        (None, _) | (Some(Value::Null), _) | (_, Value::Null) => false,
        (Some(actual), expected) => as_string(actual) == as_string(expected),
    }
}

fn numeric_compare(actual: Option<&Value>, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(as_f64), as_f64(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
