//! Job definitions as submitted by callers (YAML or JSON).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::BranchCondition;
use crate::task::RetryPolicy;

/// A job submission: the task graph plus job-level scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Start no earlier than this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start_at: Option<DateTime<Utc>>,
    /// Jobs that must complete successfully first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whole-job retries after a failure (0 = fail immediately).
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_scaling: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_regressions: Option<u32>,
    pub tasks: Vec<TaskDefinition>,
}

/// One node of the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Registered handler; defaults to the task name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Output binding seen by downstream tasks; defaults to the task name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<BranchCondition>,
    /// Task to roll back to when this one exhausts its attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regress_to: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl TaskDefinition {
    /// Minimal definition: a task run by the handler of the same name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            handler: None,
            params: serde_json::Value::Null,
            var: None,
            gate: None,
            condition: None,
            regress_to: None,
            priority: 0,
            retry: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn regress_to(mut self, target: impl Into<String>) -> Self {
        self.regress_to = Some(target.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.name)
    }

    pub fn var_name(&self) -> &str {
        self.var.as_deref().unwrap_or(&self.name)
    }
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        Self {
            id: id.into(),
            position: 0,
            external_id: None,
            scheduled_start_at: None,
            depends_on: Vec::new(),
            max_retries: 0,
            retry_delay_ms: None,
            retry_scaling: None,
            max_regressions: None,
            tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_definition_from_json() {
        let def: JobDefinition = serde_json::from_str(
            r#"{"id": "pipeline", "tasks": [{"name": "a"}, {"name": "b", "depends_on": ["a"]}]}"#,
        )
        .unwrap();
        assert_eq!(def.id, "pipeline");
        assert_eq!(def.max_retries, 0);
        assert_eq!(def.tasks.len(), 2);
        assert_eq!(def.tasks[1].depends_on, vec!["a"]);
        assert_eq!(def.tasks[0].handler_name(), "a");
        assert_eq!(def.tasks[0].var_name(), "a");
        assert!(def.tasks[0].params.is_null());
    }

    #[test]
    fn test_builder_helpers() {
        let task = TaskDefinition::new("verify")
            .depends_on(["build"])
            .handler("shell")
            .regress_to("build");
        assert_eq!(task.handler_name(), "shell");
        assert_eq!(task.regress_to.as_deref(), Some("build"));
        assert_eq!(task.depends_on, vec!["build".to_string()]);
    }
}
