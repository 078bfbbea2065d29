//! Shell command task handler.
//!
//! Runs `params.command` with `params.args` as a child process. The outputs
//! of the task's dependencies are written to its stdin as one JSON object.
//! The whole execution is a single journaled effect, so a replayed
//! invocation that already finished the command does not spawn it again.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nuoc_core::workflow::handler::{TaskContext, TaskError, TaskHandler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

/// Registry name of [`CommandHandler`].
pub const COMMAND_HANDLER: &str = "command";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Deserialize)]
struct CommandParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// What a finished command produced. This is the task output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs an external program per task attempt.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    timeout: Duration,
}

impl CommandHandler {
    /// Upper bound for commands that set no `timeout_secs` of their own.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for CommandHandler {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }
}

impl TaskHandler for CommandHandler {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, TaskError> {
        let params: CommandParams = serde_json::from_value(ctx.params().clone())
            .map_err(|e| TaskError::failed(format!("invalid command params: {e}")))?;
        let stdin = serde_json::to_vec(ctx.inputs()).map_err(TaskError::failed)?;
        let timeout = params
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);
        let job_id = ctx.job_id().to_string();
        let task_name = ctx.task_name().to_string();
        let label = params.command.clone();

        let output = ctx
            .run(&label, move || async move {
                spawn_and_wait(&params, &job_id, &task_name, &stdin, timeout).await
            })
            .await?;
        serde_json::to_value(output).map_err(TaskError::failed)
    }
}

async fn spawn_and_wait(
    params: &CommandParams,
    job_id: &str,
    task_name: &str,
    stdin: &[u8],
    timeout: Duration,
) -> Result<CommandOutput, TaskError> {
    let mut command = tokio::process::Command::new(&params.command);
    command
        .args(&params.args)
        .env("NUOC_JOB_ID", job_id)
        .env("NUOC_TASK", task_name)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &params.cwd {
        command.current_dir(cwd);
    }

    let mut child = command
        .spawn()
        .map_err(|e| TaskError::failed(format!("failed to spawn '{}': {e}", params.command)))?;

    if let Some(mut pipe) = child.stdin.take() {
        // A command that never reads stdin closes the pipe early.
        if let Err(e) = pipe.write_all(stdin).await {
            tracing::debug!(command = %params.command, error = %e, "stdin not consumed");
        }
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            TaskError::failed(format!(
                "'{}' timed out after {}s",
                params.command,
                timeout.as_secs()
            ))
        })?
        .map_err(|e| TaskError::failed(format!("failed to wait for '{}': {e}", params.command)))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    };

    if !output.status.success() {
        tracing::debug!(
            job_id,
            task = task_name,
            exit_code = result.exit_code,
            "command failed"
        );
        return Err(TaskError::failed(format!(
            "'{}' exited with status {}: {}",
            params.command,
            result.exit_code,
            result.stderr.trim()
        )));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nuoc_core::event::EventBus;
    use nuoc_core::repository::{DurableStore, InMemoryStore};
    use nuoc_core::workflow::gate::GateRegistry;
    use nuoc_core::workflow::scheduler::{JobOutcome, Scheduler, SchedulerConfig};
    use nuoc_types::definition::{JobDefinition, TaskDefinition};
    use nuoc_types::task::{RetryPolicy, TaskStatus};
    use serde_json::json;

    use super::*;
    use crate::handler::builtin_handlers;

    fn scheduler(store: Arc<InMemoryStore>) -> Scheduler<InMemoryStore> {
        Scheduler::new(
            store,
            EventBus::default(),
            builtin_handlers(),
            GateRegistry::with_builtins(),
            SchedulerConfig::default(),
        )
    }

    fn shell(name: &str, script: &str) -> TaskDefinition {
        let mut def = TaskDefinition::new(name)
            .handler(COMMAND_HANDLER)
            .retry(RetryPolicy {
                max_attempts: 1,
                delay_ms: 1,
                scaling_factor: 1.0,
            });
        def.params = json!({ "command": "sh", "args": ["-c", script] });
        def
    }

    #[tokio::test]
    async fn test_command_output_becomes_task_output() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = scheduler(store.clone());
        let job = JobDefinition::new(
            "cmd",
            vec![
                shell("hello", "printf hello"),
                shell("upstream", "cat").depends_on(["hello"]),
            ],
        );
        scheduler.submit(&job).await.unwrap();
        assert_eq!(scheduler.run("cmd").await.unwrap(), JobOutcome::Completed);

        let hello = store.get_task("cmd", "hello").await.unwrap().unwrap();
        let output: CommandOutput = serde_json::from_value(hello.output.unwrap()).unwrap();
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.exit_code, 0);

        // Dependency outputs arrive on stdin keyed by var.
        let upstream = store.get_task("cmd", "upstream").await.unwrap().unwrap();
        let output: CommandOutput = serde_json::from_value(upstream.output.unwrap()).unwrap();
        let stdin: Value = serde_json::from_str(&output.stdout).unwrap();
        assert_eq!(stdin["hello"]["stdout"], "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_task() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = scheduler(store.clone());
        let job = JobDefinition::new("bad", vec![shell("boom", "echo nope >&2; exit 3")]);
        scheduler.submit(&job).await.unwrap();

        let outcome = scheduler.run("bad").await.unwrap();
        let JobOutcome::Failed { reason } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("status 3"), "{reason}");
        assert!(reason.contains("nope"), "{reason}");

        let task = store.get_task("bad", "boom").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalid_params_fail() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = scheduler(store.clone());
        let mut task = shell("broken", "true");
        task.params = json!({ "args": ["x"] });
        scheduler
            .submit(&JobDefinition::new("params", vec![task]))
            .await
            .unwrap();

        let outcome = scheduler.run("params").await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let store = Arc::new(InMemoryStore::new());
        let mut handlers = builtin_handlers();
        handlers.register(
            COMMAND_HANDLER,
            CommandHandler::with_timeout(Duration::from_millis(200)),
        );
        let scheduler = Scheduler::new(
            store.clone(),
            EventBus::default(),
            handlers,
            GateRegistry::with_builtins(),
            SchedulerConfig::default(),
        );
        scheduler
            .submit(&JobDefinition::new("slow", vec![shell("sleepy", "sleep 5")]))
            .await
            .unwrap();

        let outcome = scheduler.run("slow").await.unwrap();
        let JobOutcome::Failed { reason } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("timed out"), "{reason}");
    }
}
