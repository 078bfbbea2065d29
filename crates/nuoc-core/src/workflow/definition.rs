//! Job definition parsing, validation and materialisation.
//!
//! Definitions arrive as YAML or JSON. Validation checks structural rules
//! (identifier format, unique task names, known dependencies, acyclicity)
//! and that every referenced handler and gate is registered. Only a valid
//! definition is turned into persisted `Job` and `Task` rows.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use nuoc_types::definition::JobDefinition;
use nuoc_types::is_valid_identifier;
use nuoc_types::job::{Job, JobStatus};
use nuoc_types::task::{RetryPolicy, Task, TaskStatus};
use thiserror::Error;

use super::dag::TaskGraph;
use super::gate::GateRegistry;
use super::handler::HandlerRegistry;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while reading or validating a job definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The task graph contains a cycle; holds the offending path.
    #[error("circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("task '{task}' uses unregistered handler '{handler}'")]
    UnknownHandler { task: String, handler: String },

    #[error("task '{task}' uses unregistered gate '{gate}'")]
    UnknownGate { task: String, gate: String },

    /// Two tasks bind their output to the same variable name.
    #[error("tasks '{first}' and '{second}' both bind output variable '{var}'")]
    DuplicateVar {
        var: String,
        first: String,
        second: String,
    },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn parse_job_yaml(yaml: &str) -> Result<JobDefinition, DefinitionError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))
}

pub fn parse_job_json(json: &str) -> Result<JobDefinition, DefinitionError> {
    serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Load a definition file; `.json` files are read as JSON, anything else as YAML.
pub fn load_job_file(path: &Path) -> Result<JobDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_job_json(&content),
        _ => parse_job_yaml(&content),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition before anything is persisted.
///
/// Checks:
/// - job id and task names are well-formed identifiers
/// - at least one task, task names and output variables unique
/// - dependencies name tasks of the same job and form no cycle
/// - handlers and gates are registered
/// - branch conditions inspect a declared dependency
/// - regression targets name the task itself or one of its upstream tasks
pub fn validate_definition(
    def: &JobDefinition,
    handlers: &HandlerRegistry,
    gates: &GateRegistry,
) -> Result<(), DefinitionError> {
    if !is_valid_identifier(&def.id) {
        return Err(DefinitionError::Validation(format!(
            "job id '{}' is not a valid identifier",
            def.id
        )));
    }
    if def.tasks.is_empty() {
        return Err(DefinitionError::Validation(format!(
            "job '{}' has no tasks",
            def.id
        )));
    }
    for dep in &def.depends_on {
        if !is_valid_identifier(dep) || *dep == def.id {
            return Err(DefinitionError::Validation(format!(
                "job '{}' has invalid job dependency '{dep}'",
                def.id
            )));
        }
    }

    let mut names = HashSet::new();
    let mut vars: HashMap<&str, &str> = HashMap::new();
    for task in &def.tasks {
        if !is_valid_identifier(&task.name) {
            return Err(DefinitionError::Validation(format!(
                "task name '{}' is not a valid identifier",
                task.name
            )));
        }
        if !names.insert(task.name.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "duplicate task name: '{}'",
                task.name
            )));
        }
        if let Some(first) = vars.insert(task.var_name(), &task.name) {
            return Err(DefinitionError::DuplicateVar {
                var: task.var_name().to_string(),
                first: first.to_string(),
                second: task.name.clone(),
            });
        }
    }

    let graph = TaskGraph::from_definitions(&def.tasks)?;
    if let Some(cycle) = graph.find_cycle() {
        return Err(DefinitionError::CircularDependency(cycle));
    }

    for task in &def.tasks {
        let handler = task.handler_name();
        if !handlers.contains(handler) {
            return Err(DefinitionError::UnknownHandler {
                task: task.name.clone(),
                handler: handler.to_string(),
            });
        }
        if let Some(gate) = &task.gate {
            if !gates.contains(gate) {
                return Err(DefinitionError::UnknownGate {
                    task: task.name.clone(),
                    gate: gate.clone(),
                });
            }
        }
        if let Some(condition) = &task.condition {
            if !task.depends_on.contains(&condition.task) {
                return Err(DefinitionError::Validation(format!(
                    "condition of task '{}' inspects '{}', which is not a dependency",
                    task.name, condition.task
                )));
            }
        }
        if let Some(target) = &task.regress_to {
            if *target != task.name && !graph.upstream(&task.name).contains(target) {
                return Err(DefinitionError::Validation(format!(
                    "task '{}' may only regress to itself or an upstream task, not '{target}'",
                    task.name
                )));
            }
        }
        if let Some(retry) = &task.retry {
            if retry.max_attempts == 0 {
                return Err(DefinitionError::Validation(format!(
                    "task '{}' must allow at least one attempt",
                    task.name
                )));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Materialisation
// ---------------------------------------------------------------------------

/// Defaults applied to fields a definition leaves open.
#[derive(Debug, Clone)]
pub struct DefinitionDefaults {
    pub retry: RetryPolicy,
    pub max_regressions: u32,
}

impl Default for DefinitionDefaults {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_regressions: 3,
        }
    }
}

/// Turn a validated definition into fresh `Job` and `Task` rows (status pending).
pub fn build_job(
    def: &JobDefinition,
    defaults: &DefinitionDefaults,
    now: DateTime<Utc>,
) -> (Job, Vec<Task>) {
    let job = Job {
        id: def.id.clone(),
        status: JobStatus::Pending,
        position: def.position,
        external_id: def.external_id.clone(),
        scheduled_start_at: def.scheduled_start_at,
        completion_result: None,
        completion_failure: None,
        retry_count: 0,
        max_retries: def.max_retries,
        retry_delay_ms: def.retry_delay_ms.unwrap_or(defaults.retry.delay_ms),
        retry_scaling: def.retry_scaling.unwrap_or(defaults.retry.scaling_factor),
        next_retry_at: None,
        last_failure: None,
        last_failure_code: None,
        regression_count: 0,
        max_regressions: def.max_regressions.unwrap_or(defaults.max_regressions),
        depends_on: def.depends_on.clone(),
        created_at: now,
        started_at: None,
        completed_at: None,
        updated_at: now,
    };

    let tasks = def
        .tasks
        .iter()
        .map(|t| {
            let retry = t.retry.clone().unwrap_or_else(|| defaults.retry.clone());
            Task {
                job_id: def.id.clone(),
                name: t.name.clone(),
                status: TaskStatus::Pending,
                depends_on: t.depends_on.clone(),
                handler: t.handler_name().to_string(),
                params: t.params.clone(),
                var: t.var_name().to_string(),
                gate: t.gate.clone(),
                condition: t.condition.clone(),
                regress_to: t.regress_to.clone(),
                priority: t.priority,
                attempt: 0,
                max_attempts: retry.max_attempts,
                retry_delay_ms: retry.delay_ms,
                retry_scaling: retry.scaling_factor,
                invocation: 0,
                replay: false,
                output: None,
                error: None,
                started_at: None,
                completed_at: None,
                updated_at: now,
            }
        })
        .collect();

    (job, tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{echo_registry, gates};
    use nuoc_types::condition::{BranchCondition, Predicate};
    use nuoc_types::definition::TaskDefinition;

    fn linear() -> JobDefinition {
        JobDefinition::new(
            "release",
            vec![
                TaskDefinition::new("build").handler("echo"),
                TaskDefinition::new("verify").handler("echo").depends_on(["build"]),
            ],
        )
    }

    fn validate(def: &JobDefinition) -> Result<(), DefinitionError> {
        validate_definition(def, &echo_registry(), &gates())
    }

    #[test]
    fn test_valid_definition_passes() {
        validate(&linear()).unwrap();
    }

    #[test]
    fn test_parse_yaml_definition() {
        let yaml = r#"
id: nightly
position: 2
max_retries: 1
tasks:
  - name: fetch
    handler: echo
    params:
      url: https://example.invalid
  - name: report
    handler: echo
    depends_on: [fetch]
    gate: non_empty
    condition:
      task: fetch
      op: exists
      path: /url
"#;
        let def = parse_job_yaml(yaml).unwrap();
        assert_eq!(def.position, 2);
        assert_eq!(def.max_retries, 1);
        assert_eq!(def.tasks[0].params["url"], "https://example.invalid");
        assert_eq!(def.tasks[1].gate.as_deref(), Some("non_empty"));
        validate(&def).unwrap();
    }

    #[test]
    fn test_parse_error_reported() {
        let err = parse_job_yaml("id: [unclosed").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
        let err = parse_job_json("{").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn test_load_job_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("job.json");
        std::fs::write(&json_path, r#"{"id":"j","tasks":[{"name":"a"}]}"#).unwrap();
        assert_eq!(load_job_file(&json_path).unwrap().id, "j");

        let yaml_path = dir.path().join("job.yaml");
        std::fs::write(&yaml_path, "id: k\ntasks:\n  - name: a\n").unwrap();
        assert_eq!(load_job_file(&yaml_path).unwrap().id, "k");
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        let mut def = linear();
        def.id = "bad id".to_string();
        assert!(matches!(validate(&def), Err(DefinitionError::Validation(_))));

        let mut def = linear();
        def.tasks[0].name = "9lives".to_string();
        assert!(matches!(validate(&def), Err(DefinitionError::Validation(_))));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut def = linear();
        def.tasks[1].name = "build".to_string();
        def.tasks[1].depends_on.clear();
        let err = validate(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_duplicate_output_var_rejected() {
        let mut def = linear();
        def.tasks[1].var = Some("build".to_string());
        let err = validate(&def).unwrap_err();
        assert!(matches!(
            err,
            DefinitionError::DuplicateVar { ref var, ref first, ref second }
                if var == "build" && first == "build" && second == "verify"
        ));

        let mut def = linear();
        def.tasks[0].var = Some("artifact".to_string());
        def.tasks[1].var = Some("artifact".to_string());
        assert!(matches!(validate(&def), Err(DefinitionError::DuplicateVar { .. })));

        let mut def = linear();
        def.tasks[0].var = Some("artifact".to_string());
        validate(&def).unwrap();
    }

    #[test]
    fn test_cycle_rejected() {
        let def = JobDefinition::new(
            "loop",
            vec![
                TaskDefinition::new("a").handler("echo").depends_on(["b"]),
                TaskDefinition::new("b").handler("echo").depends_on(["a"]),
            ],
        );
        let err = validate(&def).unwrap_err();
        assert!(matches!(err, DefinitionError::CircularDependency(_)));
    }

    #[test]
    fn test_unregistered_handler_and_gate_rejected() {
        let mut def = linear();
        def.tasks[0].handler = Some("missing".to_string());
        assert!(matches!(
            validate(&def),
            Err(DefinitionError::UnknownHandler { .. })
        ));

        let mut def = linear();
        def.tasks[0].gate = Some("nope".to_string());
        assert!(matches!(validate(&def), Err(DefinitionError::UnknownGate { .. })));
    }

    #[test]
    fn test_condition_must_reference_dependency() {
        let mut def = linear();
        def.tasks[0].condition = Some(BranchCondition {
            task: "verify".to_string(),
            predicate: Predicate::Exists {
                path: String::new(),
            },
        });
        assert!(matches!(validate(&def), Err(DefinitionError::Validation(_))));
    }

    #[test]
    fn test_regression_target_must_be_upstream() {
        let mut def = linear();
        def.tasks[1].regress_to = Some("build".to_string());
        validate(&def).unwrap();

        def.tasks[1].regress_to = Some("verify".to_string());
        validate(&def).unwrap();

        let mut def = linear();
        def.tasks[0].regress_to = Some("verify".to_string());
        assert!(matches!(validate(&def), Err(DefinitionError::Validation(_))));
    }

    #[test]
    fn test_build_job_applies_defaults() {
        let mut def = linear();
        def.tasks[1].retry = Some(RetryPolicy {
            max_attempts: 5,
            delay_ms: 10,
            scaling_factor: 1.5,
        });
        let defaults = DefinitionDefaults::default();
        let (job, tasks) = build_job(&def, &defaults, Utc::now());

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_regressions, 3);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].handler, "echo");
        assert_eq!(tasks[0].var, "build");
        assert_eq!(tasks[0].max_attempts, 3);
        assert_eq!(tasks[1].max_attempts, 5);
        assert_eq!(tasks[1].retry_delay_ms, 10);
        assert!(tasks.iter().all(|t| t.invocation == 0 && !t.replay));
    }
}
