//! Background driver: runs the time-based sweeps and hands runnable jobs to
//! the scheduler.
//!
//! Each tick:
//! 1. `scheduler_sweep` moves due scheduled jobs to ready.
//! 2. `retry_sweep` moves due backing-off jobs to running.
//! 3. `timeout_sweep` times out expired awakeables and wakes their tasks.
//! 4. Every job that can make progress and is not already in flight is
//!    spawned: pending/ready jobs are run, running jobs are resumed (covers
//!    both retries and jobs orphaned by a crash), suspended jobs are run
//!    once a woken task is ready again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use nuoc_types::job::{Job, JobStatus};
use tokio_util::sync::CancellationToken;

use super::dag::ready_set;
use super::scheduler::{JobOutcome, Scheduler, SchedulerError};
use crate::repository::DurableStore;

pub struct EngineDriver<S: DurableStore> {
    scheduler: Arc<Scheduler<S>>,
    interval: Duration,
    in_flight: Arc<DashMap<String, ()>>,
}

impl<S: DurableStore> EngineDriver<S> {
    pub fn new(scheduler: Arc<Scheduler<S>>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<S>> {
        &self.scheduler
    }

    /// Jobs currently being driven by this process.
    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight.iter().map(|e| e.key().clone()).collect()
    }

    /// Run one round of sweeps and spawn runnable jobs.
    ///
    /// Returns the ids of the jobs spawned.
    pub async fn tick(&self) -> Result<Vec<String>, SchedulerError> {
        let now = Utc::now();
        let states = self.scheduler.states();
        let due = states.scheduler_sweep(now).await?;
        let retried = states.retry_sweep(now).await?;
        let expired = self.scheduler.awakeables().timeout_sweep(now).await?;
        if !due.is_empty() || !retried.is_empty() || !expired.is_empty() {
            tracing::debug!(
                due = due.len(),
                retried = retried.len(),
                expired = expired.len(),
                "sweeps moved work"
            );
        }

        let mut spawned = Vec::new();
        for job in self.scheduler.store().list_jobs(None).await? {
            if self.in_flight.contains_key(&job.id) || !self.runnable(&job).await? {
                continue;
            }
            self.spawn(job.id.clone(), job.status == JobStatus::Running);
            spawned.push(job.id);
        }
        Ok(spawned)
    }

    async fn runnable(&self, job: &Job) -> Result<bool, SchedulerError> {
        let store = self.scheduler.store();
        let candidate = match job.status {
            JobStatus::Pending | JobStatus::Ready | JobStatus::Running => true,
            JobStatus::Suspended => !ready_set(&store.list_tasks(&job.id).await?).is_empty(),
            JobStatus::Scheduled
            | JobStatus::BackingOff
            | JobStatus::Paused
            | JobStatus::Completed => false,
        };
        if !candidate {
            return Ok(false);
        }
        for dep in &job.depends_on {
            if !store.get_job(dep).await?.is_some_and(|j| j.succeeded()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn spawn(&self, job_id: String, resume: bool) {
        self.in_flight.insert(job_id.clone(), ());
        let scheduler = self.scheduler.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let result = if resume {
                scheduler.resume(&job_id).await
            } else {
                scheduler.run(&job_id).await
            };
            match result {
                Ok(JobOutcome::Completed) => tracing::info!(job_id = %job_id, "job completed"),
                Ok(outcome) => tracing::info!(job_id = %job_id, outcome = ?outcome, "job run finished"),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(job_id = %job_id, error = %e, "job run interrupted, will resume")
                }
                Err(e) => tracing::error!(job_id = %job_id, error = %e, "job run failed"),
            }
            in_flight.remove(&job_id);
        });
    }

    /// Tick every `interval` until `shutdown` fires.
    ///
    /// Jobs still in flight at shutdown are left running in the store and
    /// picked up by the next process through `resume`.
    pub async fn run_until_cancelled(&self, shutdown: CancellationToken) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "engine driver started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, retryable = e.is_retryable(), "driver tick failed");
                    }
                }
            }
        }
        tracing::info!(in_flight = self.in_flight.len(), "engine driver stopped");
    }
}
