//! Branch conditions.
//!
//! A task with a condition only runs when the predicate holds for the output
//! of one of its declared dependencies. Paths are JSON pointers into that
//! output (`""` is the whole value, `/route/0` an array element).

use serde::{Deserialize, Serialize};

/// Condition attached to a task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCondition {
    /// Dependency whose output is inspected.
    pub task: String,
    #[serde(flatten)]
    pub predicate: Predicate,
}

/// Typed predicate over a JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Value at `path` equals `value`.
    Equals {
        #[serde(default)]
        path: String,
        value: serde_json::Value,
    },
    /// Array at `path` holds `value`, string at `path` contains the string
    /// `value`, or object at `path` has the key `value`.
    Contains {
        #[serde(default)]
        path: String,
        value: serde_json::Value,
    },
    Exists {
        #[serde(default)]
        path: String,
    },
    /// Value at `path` is present and not null, false, 0, "" or empty.
    Truthy {
        #[serde(default)]
        path: String,
    },
    Not { predicate: Box<Predicate> },
    All { predicates: Vec<Predicate> },
    Any { predicates: Vec<Predicate> },
}
