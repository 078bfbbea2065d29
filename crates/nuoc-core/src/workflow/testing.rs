//! Shared fixtures for unit tests in this module tree.

use chrono::Utc;
use nuoc_types::definition::{JobDefinition, TaskDefinition};
use nuoc_types::event::{Event, EventType};
use nuoc_types::job::Job;
use nuoc_types::task::Task;
use serde_json::json;

use super::definition::{DefinitionDefaults, build_job};
use super::gate::GateRegistry;
use super::handler::{HandlerRegistry, TaskContext};
use crate::repository::{DurableStore, InMemoryStore};

/// Task definition run by the `echo` handler.
pub(crate) fn t(name: &str, deps: &[&str]) -> TaskDefinition {
    TaskDefinition::new(name)
        .depends_on(deps.iter().copied())
        .handler("echo")
}

/// A fresh pending task row.
pub(crate) fn task(job_id: &str, name: &str, deps: &[&str]) -> Task {
    let def = JobDefinition::new(job_id, vec![t(name, deps)]);
    let (_, mut tasks) = build_job(&def, &DefinitionDefaults::default(), Utc::now());
    tasks.remove(0)
}

/// Persist a pending job built from `tasks` without validation.
pub(crate) async fn seed_job(store: &InMemoryStore, id: &str, tasks: Vec<TaskDefinition>) -> Job {
    let def = JobDefinition::new(id, tasks);
    let (job, tasks) = build_job(&def, &DefinitionDefaults::default(), Utc::now());
    let event = Event::new(id, EventType::JobSubmitted);
    store.create_job(&job, &tasks, &event).await.unwrap();
    job
}

pub(crate) fn echo_registry() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("echo", |ctx: TaskContext| async move {
        Ok(json!({ "task": ctx.task_name() }))
    });
    handlers
}

pub(crate) fn gates() -> GateRegistry {
    GateRegistry::with_builtins()
}
