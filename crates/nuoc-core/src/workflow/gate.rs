//! Output gates.
//!
//! A gate is a named predicate over a task's serialized output that runs
//! after the handler succeeds. A rejected output counts as a failed attempt.
//! Submission rejects unknown gate names; at execution time an unknown name
//! passes.

use std::collections::HashMap;
use std::sync::Arc;

/// Result of a gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub pass: bool,
    pub reason: String,
}

impl GateVerdict {
    pub fn pass() -> Self {
        Self {
            pass: true,
            reason: String::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            pass: false,
            reason: reason.into(),
        }
    }
}

/// Validator for a task's output text.
pub trait Gate: Send + Sync {
    fn check(&self, output: &str, job_id: &str) -> GateVerdict;
}

impl<F> Gate for F
where
    F: Fn(&str, &str) -> GateVerdict + Send + Sync,
{
    fn check(&self, output: &str, job_id: &str) -> GateVerdict {
        self(output, job_id)
    }
}

/// Rejects empty output (`""`, `null`, `{}` and `[]` count as empty).
pub struct NonEmptyGate;

impl Gate for NonEmptyGate {
    fn check(&self, output: &str, _job_id: &str) -> GateVerdict {
        match output.trim() {
            "" | "null" | "\"\"" | "{}" | "[]" => GateVerdict::fail("output is empty"),
            _ => GateVerdict::pass(),
        }
    }
}

/// Requires the output to be valid JSON.
pub struct JsonGate;

impl Gate for JsonGate {
    fn check(&self, output: &str, _job_id: &str) -> GateVerdict {
        match serde_json::from_str::<serde_json::Value>(output) {
            Ok(_) => GateVerdict::pass(),
            Err(e) => GateVerdict::fail(format!("output is not JSON: {e}")),
        }
    }
}

/// Name → gate lookup.
#[derive(Clone, Default)]
pub struct GateRegistry {
    gates: HashMap<String, Arc<dyn Gate>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `non_empty` and `json` gates.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("non_empty", NonEmptyGate);
        registry.register("json", JsonGate);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, gate: impl Gate + 'static) {
        self.gates.insert(name.into(), Arc::new(gate));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gates.contains_key(name)
    }

    /// Run the named gate; unknown names pass.
    pub fn check(&self, name: &str, output: &str, job_id: &str) -> GateVerdict {
        match self.gates.get(name) {
            Some(gate) => gate.check(output, job_id),
            None => {
                tracing::warn!(gate = name, job_id, "unknown gate, passing output through");
                GateVerdict::pass()
            }
        }
    }
}

impl std::fmt::Debug for GateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.gates.keys().collect();
        names.sort();
        f.debug_struct("GateRegistry").field("gates", &names).finish()
    }
}
