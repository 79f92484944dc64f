//! Data flow between consecutive steps

use serde_json::Value;

/// Shallow merge of two JSON objects.
///
/// The successor step's input is the input the current step received with
/// every top-level key of the current step's output written over it. Nested
/// objects are replaced wholesale, not merged.
///
/// Non-object corner cases: a `null` overlay leaves the base untouched; any
/// other non-object operand makes the overlay win.
pub fn shallow_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (_, Value::Null) => base.clone(),
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overlay_wins_per_key() {
        let base = json!({"a": 1, "b": 2});
        let overlay = json!({"b": 3, "c": 4});
        assert_eq!(shallow_merge(&base, &overlay), json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn merge_is_idempotent() {
        let base = json!({"orderId": "X", "n": 1});
        let overlay = json!({"n": 2, "extra": true});
        let once = shallow_merge(&base, &overlay);
        let twice = shallow_merge(&once, &overlay);
        assert_eq!(once, twice);
    }

    #[test]
    fn nested_objects_are_replaced_not_merged() {
        let base = json!({"meta": {"a": 1, "b": 2}});
        let overlay = json!({"meta": {"c": 3}});
        assert_eq!(shallow_merge(&base, &overlay), json!({"meta": {"c": 3}}));
    }

    #[test]
    fn null_overlay_keeps_base() {
        let base = json!({"a": 1});
        assert_eq!(shallow_merge(&base, &Value::Null), base);
    }
}
