//! `nuoc submit`, `nuoc status` and `nuoc cancel`.

use std::path::Path;

use anyhow::Context;
use nuoc_core::repository::DurableStore;
use nuoc_core::workflow::definition::load_job_file;

use crate::state::AppState;

pub async fn submit(state: &AppState, file: &Path, wait: bool, json_out: bool) -> anyhow::Result<()> {
    let def = load_job_file(file).with_context(|| format!("failed to load {}", file.display()))?;
    let job = state.scheduler.submit(&def).await?;

    if !wait {
        if json_out {
            println!("{}", serde_json::to_string_pretty(&job)?);
        } else {
            println!("Submitted job '{}' ({} tasks)", job.id, def.tasks.len());
        }
        return Ok(());
    }

    let outcome = state.scheduler.run(&job.id).await?;
    if json_out {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("Job '{}': {outcome:?}", job.id);
    }
    Ok(())
}

pub async fn status(state: &AppState, job_id: &str, json_out: bool) -> anyhow::Result<()> {
    let job = state
        .store
        .get_job(job_id)
        .await?
        .with_context(|| format!("job '{job_id}' not found"))?;
    let tasks = state.store.list_tasks(job_id).await?;

    if json_out {
        let body = serde_json::json!({ "job": job, "tasks": tasks });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("Job '{}': {}", job.id, job.status);
    if let Some(reason) = &job.completion_failure {
        println!("  failure: {reason}");
    }
    for task in &tasks {
        let error = task.error.as_deref().unwrap_or("");
        println!(
            "  {:<24} {:<10} attempt {:<3} {error}",
            task.name,
            task.status.as_str(),
            task.attempt
        );
    }
    Ok(())
}

pub async fn cancel(state: &AppState, job_id: &str, json_out: bool) -> anyhow::Result<()> {
    let outcome = state.scheduler.cancel(job_id).await?;
    if json_out {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("Job '{job_id}': {outcome:?}");
    }
    Ok(())
}
