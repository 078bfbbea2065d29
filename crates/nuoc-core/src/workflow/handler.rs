//! Task handlers and the context they run with.
//!
//! A handler is the body of a task. It receives a [`TaskContext`] that exposes
//! the task's params, the outputs of its dependencies, journaled side effects
//! and awakeables. Handlers use RPITIT; the registry stores them behind the
//! object-safe [`TaskHandlerDyn`] (blanket-implemented for every handler).

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use nuoc_types::awakeable::AwakeableId;
use nuoc_types::journal::{InvocationKey, OpType};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;

use super::awakeable::{AwaitOutcome, AwakeableError, AwakeableManager};
use super::journal::JournalError;
use crate::repository::DurableStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// How a task attempt ended, other than with an output.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The attempt failed and may be retried.
    #[error("{0}")]
    Failed(String),

    /// The task is parked on an awakeable. Not a failure.
    #[error("task suspended awaiting an awakeable")]
    Suspended,

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Awakeable(#[from] AwakeableError),
}

impl TaskError {
    pub fn failed(msg: impl Display) -> Self {
        TaskError::Failed(msg.to_string())
    }

    /// Divergence cannot be fixed by retrying the same code.
    pub fn is_fatal(&self) -> bool {
        match self {
            TaskError::Journal(e) => e.is_divergence(),
            TaskError::Awakeable(AwakeableError::Journal(e)) => e.is_divergence(),
            _ => false,
        }
    }

    /// Infrastructure failure underneath the handler.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            TaskError::Journal(e) => e.is_retryable(),
            TaskError::Awakeable(e) => e.is_retryable(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation runtime (type-erased journal + awakeables)
// ---------------------------------------------------------------------------

pub(crate) type EffectBody<'a> =
    Box<dyn FnOnce(u32) -> BoxFuture<'a, Result<Value, JournalError>> + Send + 'a>;

/// Object-safe view of the journal and awakeable manager, so `TaskContext`
/// does not carry the store type.
pub(crate) trait InvocationRuntime: Send + Sync {
    fn effect_boxed<'a>(
        &'a self,
        key: &'a InvocationKey,
        op_type: OpType,
        input: Value,
        body: EffectBody<'a>,
    ) -> BoxFuture<'a, Result<Value, JournalError>>;

    fn create_awakeable_boxed<'a>(
        &'a self,
        key: &'a InvocationKey,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<AwakeableId, AwakeableError>>;

    fn await_awakeable_boxed<'a>(
        &'a self,
        key: &'a InvocationKey,
        id: &'a AwakeableId,
    ) -> BoxFuture<'a, Result<AwaitOutcome, AwakeableError>>;
}

impl<S: DurableStore> InvocationRuntime for AwakeableManager<S> {
    fn effect_boxed<'a>(
        &'a self,
        key: &'a InvocationKey,
        op_type: OpType,
        input: Value,
        body: EffectBody<'a>,
    ) -> BoxFuture<'a, Result<Value, JournalError>> {
        Box::pin(self.journal().effect(key, op_type, input, body))
    }

    fn create_awakeable_boxed<'a>(
        &'a self,
        key: &'a InvocationKey,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<AwakeableId, AwakeableError>> {
        Box::pin(self.create(key, timeout))
    }

    fn await_awakeable_boxed<'a>(
        &'a self,
        key: &'a InvocationKey,
        id: &'a AwakeableId,
    ) -> BoxFuture<'a, Result<AwaitOutcome, AwakeableError>> {
        Box::pin(self.await_completion(key, id))
    }
}

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// Everything a handler may use during one attempt.
#[derive(Clone)]
pub struct TaskContext {
    key: InvocationKey,
    attempt: u32,
    params: Arc<Value>,
    inputs: Arc<HashMap<String, Value>>,
    runtime: Arc<dyn InvocationRuntime>,
}

impl TaskContext {
    pub(crate) fn new(
        key: InvocationKey,
        attempt: u32,
        params: Value,
        inputs: HashMap<String, Value>,
        runtime: Arc<dyn InvocationRuntime>,
    ) -> Self {
        Self {
            key,
            attempt,
            params: Arc::new(params),
            inputs: Arc::new(inputs),
            runtime,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.key.job_id
    }

    pub fn task_name(&self) -> &str {
        &self.key.task_name
    }

    /// Retry counter of the current run (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Lifetime invocation ordinal; the journal key.
    pub fn invocation(&self) -> u32 {
        self.key.attempt
    }

    pub fn key(&self) -> &InvocationKey {
        &self.key
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Output of a settled dependency by its binding name. Skipped
    /// dependencies have no output.
    pub fn input(&self, var: &str) -> Option<&Value> {
        self.inputs.get(var)
    }

    pub fn inputs(&self) -> &HashMap<String, Value> {
        &self.inputs
    }

    /// Run `f` at most once for this invocation and journal its result.
    ///
    /// `label` identifies the effect; a replay that reaches the same journal
    /// position with a different label is a divergence.
    pub async fn run<T, F, Fut>(&self, label: &str, f: F) -> Result<T, TaskError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, TaskError>> + Send,
    {
        let body: EffectBody<'_> = Box::new(move |_index| {
            Box::pin(async move {
                let value = f()
                    .await
                    .map_err(|e| JournalError::EffectFailed(e.to_string()))?;
                serde_json::to_value(value).map_err(|e| JournalError::Serialization(e.to_string()))
            }) as BoxFuture<'_, Result<Value, JournalError>>
        });
        let output = self
            .runtime
            .effect_boxed(&self.key, OpType::Run, json!({ "label": label }), body)
            .await
            .map_err(|e| match e {
                JournalError::EffectFailed(msg) => TaskError::Failed(msg),
                other => TaskError::Journal(other),
            })?;
        serde_json::from_value(output)
            .map_err(|e| TaskError::Journal(JournalError::Serialization(e.to_string())))
    }

    /// Create an awakeable without a deadline.
    pub async fn awakeable(&self) -> Result<AwakeableId, TaskError> {
        Ok(self.runtime.create_awakeable_boxed(&self.key, None).await?)
    }

    /// Create an awakeable that times out after `timeout`.
    pub async fn awakeable_with_timeout(&self, timeout: Duration) -> Result<AwakeableId, TaskError> {
        Ok(self
            .runtime
            .create_awakeable_boxed(&self.key, Some(timeout))
            .await?)
    }

    /// Wait for an awakeable.
    ///
    /// Returns the payload once resolved. While pending this returns
    /// `TaskError::Suspended`; propagate it with `?` so the handler unwinds.
    pub async fn await_awakeable(&self, id: &AwakeableId) -> Result<Value, TaskError> {
        match self.runtime.await_awakeable_boxed(&self.key, id).await? {
            AwaitOutcome::Resolved(payload) => Ok(payload),
            AwaitOutcome::Suspended => Err(TaskError::Suspended),
            AwaitOutcome::Rejected(reason) => {
                Err(TaskError::Failed(format!("awakeable {id} rejected: {reason}")))
            }
            AwaitOutcome::TimedOut => Err(TaskError::Failed(format!("awakeable {id} timed out"))),
            AwaitOutcome::Cancelled => Err(TaskError::Failed(format!("awakeable {id} cancelled"))),
        }
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("key", &self.key)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Body of a task.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TaskHandler: Send + Sync + 'static {
    fn execute(
        &self,
        ctx: &TaskContext,
    ) -> impl Future<Output = Result<Value, TaskError>> + Send;
}

/// Object-safe version of [`TaskHandler`] with boxed futures.
pub trait TaskHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<Value, TaskError>>;
}

impl<T: TaskHandler> TaskHandlerDyn for T {
    fn execute_boxed<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<Value, TaskError>> {
        Box::pin(self.execute(ctx))
    }
}

/// Adapts a closure taking an owned context into a [`TaskHandler`].
pub struct FnHandler<F>(pub F);

impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    fn execute(
        &self,
        ctx: &TaskContext,
    ) -> impl Future<Output = Result<Value, TaskError>> + Send {
        (self.0)(ctx.clone())
    }
}

/// Name → handler lookup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandlerDyn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl TaskHandler) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register(name, FnHandler(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandlerDyn>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
