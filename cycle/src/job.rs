use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jiff::{SignedDuration, Timestamp, tz::TimeZone};

use crate::cadence::Cadence;
use crate::period::AuctionPeriod;
use crate::store::{InstanceId, JobId};

/// Default tolerance between a job's fire time and its actual start.
pub const DEFAULT_MISFIRE_THRESHOLD: Duration = Duration::from_secs(60);

/// Static description of a recurring job, registered with the scheduler at
/// startup and persisted so every instance shares it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    pub job_id: JobId,
    pub cadence: Cadence,
    pub misfire_threshold: Duration,
}

impl JobDefinition {
    pub fn new(job_id: JobId, cadence: Cadence) -> Self {
        Self {
            job_id,
            cadence,
            misfire_threshold: DEFAULT_MISFIRE_THRESHOLD,
        }
    }

    pub fn with_misfire_threshold(mut self, threshold: Duration) -> Self {
        self.misfire_threshold = threshold;
        self
    }
}

/// What a job body is told about the firing it runs in.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub instance_id: InstanceId,
    /// The occurrence being fired, not the wall clock at start.
    pub scheduled_fire_at: Timestamp,
    pub fired_at: Timestamp,
    /// The auction cycle that ended before the scheduled fire time, so a
    /// late or recovered firing still settles the same cycle.
    pub period: AuctionPeriod,
    pub timezone: TimeZone,
    /// Another instance claimed this occurrence first and then lost it.
    pub recovering: bool,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        instance_id: InstanceId,
        scheduled_fire_at: Timestamp,
        fired_at: Timestamp,
        timezone: TimeZone,
    ) -> Self {
        Self {
            job_id,
            instance_id,
            scheduled_fire_at,
            fired_at,
            period: AuctionPeriod::previous_in(scheduled_fire_at, &timezone),
            timezone,
            recovering: false,
        }
    }

    pub fn with_recovering(mut self, recovering: bool) -> Self {
        self.recovering = recovering;
        self
    }
}

/// A firing whose body did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobExecutionError {
    #[error("job returned an error: {0}")]
    Failed(String),
    #[error("job panicked: {0}")]
    Panicked(String),
}

/// How a firing that reached FIRING ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Completed,
    Failed(JobExecutionError),
}

impl FireOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, FireOutcome::Completed)
    }
}

/// An occurrence picked up later than its misfire threshold allows. The
/// body is skipped and the job moves on to its next occurrence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "job {job_id} misfired: scheduled at {scheduled_fire_at}, \
    detected at {detected_at}"
)]
pub struct MisfireError {
    pub job_id: JobId,
    pub scheduled_fire_at: Timestamp,
    pub detected_at: Timestamp,
    pub threshold: Duration,
}

impl MisfireError {
    pub fn lateness(&self) -> SignedDuration {
        self.detected_at.duration_since(self.scheduled_fire_at)
    }
}

/// Body of a scheduled job. An `Err` is recorded as a failed firing; the job
/// is still rescheduled for its next occurrence.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<J: Job + ?Sized> Job for Arc<J> {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<()> {
        (**self).execute(ctx).await
    }
}

/// Adapts an async closure into a [`Job`].
pub struct FnJob<F>(F);

pub fn job_fn<F, Fut>(f: F) -> FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnJob(f)
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}
