//! Hooks observing job firings.
//!
//! Each hook runs once per transition, after the transition is recorded in
//! the job store and before the scheduler moves the job on. Hooks are
//! synchronous and cannot influence scheduling.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::job::{FireOutcome, JobContext, MisfireError};
use crate::store::ScheduledJob;

pub trait JobListener: Send + Sync {
    fn on_fire_start(&self, _job: &ScheduledJob, _ctx: &JobContext) {}

    fn on_fire_complete(&self, _job: &ScheduledJob, _outcome: &FireOutcome) {}

    fn on_misfire(&self, _job: &ScheduledJob, _misfire: &MisfireError) {}
}

/// Logs every transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl JobListener for TracingListener {
    fn on_fire_start(&self, job: &ScheduledJob, ctx: &JobContext) {
        tracing::info!(
            job_id = %job.job_id,
            scheduled_fire_at = %ctx.scheduled_fire_at,
            period_start = %ctx.period.start,
            period_end = %ctx.period.end,
            recovering = ctx.recovering,
            "Job firing"
        );
    }

    fn on_fire_complete(&self, job: &ScheduledJob, outcome: &FireOutcome) {
        match outcome {
            FireOutcome::Completed => tracing::info!(
                job_id = %job.job_id,
                fire_count = job.fire_count,
                "Job completed"
            ),
            FireOutcome::Failed(e) => tracing::warn!(
                job_id = %job.job_id,
                failure_count = job.failure_count,
                "Job failed: {e}"
            ),
        }
    }

    fn on_misfire(&self, job: &ScheduledJob, misfire: &MisfireError) {
        tracing::warn!(
            job_id = %job.job_id,
            misfire_count = job.misfire_count,
            "{misfire}"
        );
    }
}

/// Counts transitions.
#[derive(Debug, Default)]
pub struct CountingListener {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    misfired: AtomicU64,
}

impl CountingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn misfired(&self) -> u64 {
        self.misfired.load(Ordering::SeqCst)
    }
}

impl JobListener for CountingListener {
    fn on_fire_start(&self, _job: &ScheduledJob, _ctx: &JobContext) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_fire_complete(&self, _job: &ScheduledJob, outcome: &FireOutcome) {
        let counter = match outcome {
            FireOutcome::Completed => &self.completed,
            FireOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn on_misfire(&self, _job: &ScheduledJob, _misfire: &MisfireError) {
        self.misfired.fetch_add(1, Ordering::SeqCst);
    }
}
