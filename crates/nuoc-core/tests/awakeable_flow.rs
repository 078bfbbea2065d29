use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use nuoc_core::event::EventBus;
use nuoc_core::repository::{DurableStore, InMemoryStore};
use nuoc_core::workflow::awakeable::AwakeableError;
use nuoc_core::workflow::gate::GateRegistry;
use nuoc_core::workflow::handler::{HandlerRegistry, TaskContext};
use nuoc_core::workflow::scheduler::{JobOutcome, Scheduler, SchedulerConfig};
use nuoc_types::awakeable::{Awakeable, AwakeableStatus};
use nuoc_types::definition::{JobDefinition, TaskDefinition};
use nuoc_types::event::EventType;
use nuoc_types::job::JobStatus;
use nuoc_types::task::{RetryPolicy, TaskStatus};
use serde_json::json;

type TestResult = Result<(), Box<dyn Error>>;

/// A scheduler whose `approve` task waits for an external decision. The
/// counter tracks how often the code before the await runs live.
fn approval_scheduler(
    store: Arc<InMemoryStore>,
    timeout: Option<Duration>,
) -> (Scheduler<InMemoryStore>, Arc<AtomicU32>) {
    let requests = Arc::new(AtomicU32::new(0));
    let counter = requests.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("approve", move |ctx: TaskContext| {
        let counter = counter.clone();
        async move {
            let id = match timeout {
                Some(t) => ctx.awakeable_with_timeout(t).await?,
                None => ctx.awakeable().await?,
            };
            ctx.run("notify_reviewer", || async move {
                Ok(counter.fetch_add(1, Ordering::SeqCst))
            })
            .await?;
            let decision = ctx.await_awakeable(&id).await?;
            Ok(json!({ "decision": decision }))
        }
    });
    handlers.register_fn("deploy", |ctx: TaskContext| async move {
        Ok(ctx.input("approve").cloned().unwrap_or_default())
    });
    let scheduler = Scheduler::new(
        store,
        EventBus::default(),
        handlers,
        GateRegistry::new(),
        SchedulerConfig::default(),
    );
    (scheduler, requests)
}

fn approval_job(id: &str) -> JobDefinition {
    JobDefinition::new(
        id,
        vec![
            TaskDefinition::new("approve").retry(RetryPolicy {
                max_attempts: 1,
                delay_ms: 1,
                scaling_factor: 1.0,
            }),
            TaskDefinition::new("deploy").depends_on(["approve"]),
        ],
    )
}

async fn only_awakeable(store: &InMemoryStore, job_id: &str) -> Result<Awakeable, Box<dyn Error>> {
    let mut all = store.list_awakeables(Some(job_id), None).await?;
    assert_eq!(all.len(), 1, "exactly one awakeable row");
    Ok(all.remove(0))
}

#[tokio::test]
async fn suspend_resolve_and_complete() -> TestResult {
    let store = Arc::new(InMemoryStore::new());
    let (sched, requests) = approval_scheduler(store.clone(), None);
    sched.submit(&approval_job("release")).await?;
    let mut events = sched.bus().subscribe();

    assert_eq!(sched.run("release").await?, JobOutcome::Suspended);
    let job = store.get_job("release").await?.ok_or("missing job")?;
    assert_eq!(job.status, JobStatus::Suspended);
    let approve = store.get_task("release", "approve").await?.ok_or("missing task")?;
    assert_eq!(approve.status, TaskStatus::Suspended);

    let awakeable = only_awakeable(&store, "release").await?;
    assert_eq!(awakeable.status, AwakeableStatus::Pending);
    assert_eq!(awakeable.task_name, "approve");
    assert_eq!(awakeable.attempt, approve.invocation);
    let (owner, index) = awakeable.id.decode()?;
    assert_eq!(owner.to_string(), "release/approve/1");
    assert_eq!(index, awakeable.entry_index);

    let resolved = sched
        .awakeables()
        .resolve(&awakeable.id, json!({"approved": true}))
        .await?;
    assert_eq!(resolved.status, AwakeableStatus::Resolved);
    let approve = store.get_task("release", "approve").await?.ok_or("missing task")?;
    assert_eq!(approve.status, TaskStatus::Pending);
    assert!(approve.replay);

    assert_eq!(sched.run("release").await?, JobOutcome::Completed);
    assert_eq!(requests.load(Ordering::SeqCst), 1, "pre-await effect replayed, not re-run");
    let _ = only_awakeable(&store, "release").await?;
    let deploy = store.get_task("release", "deploy").await?.ok_or("missing task")?;
    assert_eq!(deploy.output, Some(json!({"decision": {"approved": true}})));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    assert!(seen.contains(&EventType::AwakeableCreated));
    assert!(seen.contains(&EventType::AwakeableCompleted));
    Ok(())
}

#[tokio::test]
async fn second_resolution_is_refused_and_payload_kept() -> TestResult {
    let store = Arc::new(InMemoryStore::new());
    let (sched, _) = approval_scheduler(store.clone(), None);
    sched.submit(&approval_job("j")).await?;
    sched.run("j").await?;
    let awakeable = only_awakeable(&store, "j").await?;

    sched.awakeables().resolve(&awakeable.id, json!("first")).await?;
    let err = sched
        .awakeables()
        .reject(&awakeable.id, "too late")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AwakeableError::AlreadyResolved { status: AwakeableStatus::Resolved, .. }
    ));
    let stored = only_awakeable(&store, "j").await?;
    assert_eq!(stored.payload, Some(json!("first")));
    Ok(())
}

#[tokio::test]
async fn rejection_fails_the_waiting_task() -> TestResult {
    let store = Arc::new(InMemoryStore::new());
    let (sched, _) = approval_scheduler(store.clone(), None);
    sched.submit(&approval_job("j")).await?;
    sched.run("j").await?;
    let awakeable = only_awakeable(&store, "j").await?;

    sched.awakeables().reject(&awakeable.id, "change too risky").await?;
    let outcome = sched.run("j").await?;

    match outcome {
        JobOutcome::Failed { reason } => assert!(reason.contains("change too risky")),
        other => panic!("expected failure, got {other:?}"),
    }
    let deploy = store.get_task("j", "deploy").await?.ok_or("missing task")?;
    assert_eq!(deploy.status, TaskStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn timeout_sweep_wakes_and_fails_the_task() -> TestResult {
    let store = Arc::new(InMemoryStore::new());
    let (sched, _) = approval_scheduler(store.clone(), Some(Duration::from_secs(30)));
    sched.submit(&approval_job("j")).await?;
    sched.run("j").await?;

    let early = sched.awakeables().timeout_sweep(Utc::now()).await?;
    assert!(early.is_empty());

    let late = Utc::now() + chrono::Duration::seconds(60);
    let expired = sched.awakeables().timeout_sweep(late).await?;
    assert_eq!(expired.len(), 1);
    let approve = store.get_task("j", "approve").await?.ok_or("missing task")?;
    assert_eq!(approve.status, TaskStatus::Pending);

    let outcome = sched.run("j").await?;
    assert!(matches!(outcome, JobOutcome::Failed { ref reason } if reason.contains("timed out")));
    Ok(())
}

#[tokio::test]
async fn cancel_retires_pending_awakeables() -> TestResult {
    let store = Arc::new(InMemoryStore::new());
    let (sched, _) = approval_scheduler(store.clone(), None);
    sched.submit(&approval_job("j")).await?;
    sched.run("j").await?;

    assert_eq!(sched.cancel("j").await?, JobOutcome::Cancelled);
    assert_eq!(sched.cancel("j").await?, JobOutcome::Cancelled);

    let job = store.get_job("j").await?.ok_or("missing job")?;
    assert!(job.is_cancelled());
    for task in store.list_tasks("j").await? {
        assert_eq!(task.status, TaskStatus::Cancelled, "task {}", task.name);
    }
    let awakeable = only_awakeable(&store, "j").await?;
    assert_eq!(awakeable.status, AwakeableStatus::Cancelled);

    let err = sched
        .awakeables()
        .resolve(&awakeable.id, json!(true))
        .await
        .unwrap_err();
    assert!(matches!(err, AwakeableError::AlreadyResolved { .. }));
    Ok(())
}

#[tokio::test]
async fn resolve_unknown_id_is_not_found() -> TestResult {
    let store = Arc::new(InMemoryStore::new());
    let (sched, _) = approval_scheduler(store, None);
    let key = nuoc_types::journal::InvocationKey::new("ghost", "task", 1);
    let id = nuoc_types::awakeable::AwakeableId::encode(&key, 0);

    let err = sched.awakeables().resolve(&id, json!(1)).await.unwrap_err();
    assert!(matches!(err, AwakeableError::NotFound(_)));
    Ok(())
}
