//! Branch condition evaluation.
//!
//! Predicates are evaluated against the output of one dependency. A path
//! that does not resolve makes every leaf predicate false.

use nuoc_types::condition::Predicate;
use serde_json::Value;

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        Some(value)
    } else if path.starts_with('/') {
        value.pointer(path)
    } else {
        value.pointer(&format!("/{path}"))
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Array(items), _) => items.contains(needle),
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

/// Evaluate `predicate` against `value`.
pub fn evaluate(predicate: &Predicate, value: &Value) -> bool {
    match predicate {
        Predicate::Equals { path, value: expected } => {
            lookup(value, path).is_some_and(|v| v == expected)
        }
        Predicate::Contains { path, value: needle } => {
            lookup(value, path).is_some_and(|v| contains(v, needle))
        }
        Predicate::Exists { path } => lookup(value, path).is_some_and(|v| !v.is_null()),
        Predicate::Truthy { path } => lookup(value, path).is_some_and(is_truthy),
        Predicate::Not { predicate } => !evaluate(predicate, value),
        Predicate::All { predicates } => predicates.iter().all(|p| evaluate(p, value)),
        Predicate::Any { predicates } => predicates.iter().any(|p| evaluate(p, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn triage_output() -> Value {
        json!({
            "route": ["phase-1", "phase-2"],
            "summary": "needs phase-2 rework",
            "labels": {"urgent": true},
            "count": 0,
            "owner": null
        })
    }

    #[test]
    fn test_equals() {
        let out = triage_output();
        let p = Predicate::Equals {
            path: "/count".into(),
            value: json!(0),
        };
        assert!(evaluate(&p, &out));
        let p = Predicate::Equals {
            path: "/missing".into(),
            value: Value::Null,
        };
        assert!(!evaluate(&p, &out));
    }

    #[test]
    fn test_contains_on_array_string_and_object() {
        let out = triage_output();
        let in_route = Predicate::Contains {
            path: "/route".into(),
            value: json!("phase-2"),
        };
        assert!(evaluate(&in_route, &out));

        let not_in_route = Predicate::Contains {
            path: "route".into(),
            value: json!("phase-3"),
        };
        assert!(!evaluate(&not_in_route, &out));

        let substring = Predicate::Contains {
            path: "/summary".into(),
            value: json!("rework"),
        };
        assert!(evaluate(&substring, &out));

        let key = Predicate::Contains {
            path: "/labels".into(),
            value: json!("urgent"),
        };
        assert!(evaluate(&key, &out));
    }

    #[test]
    fn test_exists_and_truthy() {
        let out = triage_output();
        assert!(evaluate(&Predicate::Exists { path: "/count".into() }, &out));
        assert!(!evaluate(&Predicate::Exists { path: "/owner".into() }, &out));
        assert!(!evaluate(&Predicate::Truthy { path: "/count".into() }, &out));
        assert!(evaluate(&Predicate::Truthy { path: "/labels/urgent".into() }, &out));
        assert!(evaluate(&Predicate::Truthy { path: String::new() }, &out));
    }

    #[test]
    fn test_combinators() {
        let out = triage_output();
        let urgent = Predicate::Truthy {
            path: "/labels/urgent".into(),
        };
        let zero = Predicate::Truthy {
            path: "/count".into(),
        };
        assert!(evaluate(
            &Predicate::Any {
                predicates: vec![urgent.clone(), zero.clone()]
            },
            &out
        ));
        assert!(!evaluate(
            &Predicate::All {
                predicates: vec![urgent.clone(), zero.clone()]
            },
            &out
        ));
        assert!(evaluate(&Predicate::Not { predicate: Box::new(zero) }, &out));
        assert!(evaluate(&Predicate::All { predicates: vec![] }, &out));
    }
}
