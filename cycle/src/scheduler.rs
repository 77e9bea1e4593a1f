//! Cluster scheduler for recurring jobs.
//!
//! Every instance runs the same poll loop against the shared [`JobStore`].
//! Instances never talk to each other; a job occurrence is handed to exactly
//! one of them by a conditional claim on its row.
//!
//! ```text
//!             claim                begin_firing          mark_complete
//!   WAITING ---------> ACQUIRED ----------------> FIRING -------------> COMPLETE
//!      ^                  |                                                |
//!      |                  | mark_misfired (too late)                       |
//!      |                  v                                                |
//!      |              MISFIRED                                             |
//!      |                  |                                                |
//!      +------------------+------------------ reschedule ------------------+
//! ```
//!
//! The owner of a claimed row holds a lease (`owner_expires_at`) that it
//! renews while the job body runs. If the owner crashes the lease runs out,
//! the row shows up as due again and another instance claims the same
//! occurrence. Its body then sees `JobContext::recovering`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use jiff::Timestamp;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::job::{
    FireOutcome, Job, JobContext, JobDefinition, JobExecutionError,
    MisfireError,
};
use crate::listener::JobListener;
use crate::store::{
    InstanceId, JobId, JobState, JobStore, OutcomeRecord, ScheduledJob,
    StoreError,
};
use crate::telemetry::{log_error, spawn_with_tracing};
use crate::time::{TimeSource, deadline};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Human readable prefix of this instance's id.
    pub instance_name: String,
    pub poll_interval: Duration,
    /// Upper bound on firings processed at once by this instance.
    pub max_concurrent_fires: usize,
    /// How long a claim stays valid without renewal.
    pub job_lease: Duration,
    pub checkin_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: "clustered-job-scheduler".to_string(),
            poll_interval: Duration::from_secs(1),
            max_concurrent_fires: 10,
            job_lease: Duration::from_secs(60),
            checkin_interval: Duration::from_secs(20),
        }
    }
}

/// What one call to [`Scheduler::tick`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Occurrences this instance claimed.
    pub claimed: usize,
    /// Claims that went to another instance, or ownership lost mid-way.
    pub lost: usize,
    pub fired: usize,
    pub completed: usize,
    pub failed: usize,
    pub misfired: usize,
    /// Reclaimed occurrences whose outcome was already recorded and only
    /// needed rescheduling.
    pub recovered: usize,
}

impl TickReport {
    fn record(&mut self, processed: Processed) {
        match processed {
            Processed::Fired(FireOutcome::Completed) => {
                self.fired += 1;
                self.completed += 1;
            }
            Processed::Fired(FireOutcome::Failed(_)) => {
                self.fired += 1;
                self.failed += 1;
            }
            Processed::Misfired => self.misfired += 1,
            Processed::Rescheduled => self.recovered += 1,
            Processed::Lost => self.lost += 1,
        }
    }
}

enum Processed {
    Fired(FireOutcome),
    Misfired,
    Rescheduled,
    Lost,
}

struct RegisteredJob {
    definition: JobDefinition,
    body: Arc<dyn Job>,
}

pub struct SchedulerBuilder {
    store: Arc<dyn JobStore>,
    time_source: TimeSource,
    config: SchedulerConfig,
    jobs: HashMap<JobId, RegisteredJob>,
    listeners: Vec<Arc<dyn JobListener>>,
}

impl SchedulerBuilder {
    /// Register a job body. A later registration with the same id replaces
    /// the earlier one.
    pub fn job(mut self, definition: JobDefinition, body: impl Job) -> Self {
        self.jobs.insert(
            definition.job_id.clone(),
            RegisteredJob {
                definition,
                body: Arc::new(body),
            },
        );
        self
    }

    pub fn listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Scheduler {
        let instance_id = InstanceId::generate(&self.config.instance_name);
        let permits = Arc::new(Semaphore::new(
            self.config.max_concurrent_fires.max(1),
        ));
        Scheduler {
            inner: Arc::new(Inner {
                instance_id,
                store: self.store,
                time_source: self.time_source,
                config: self.config,
                jobs: self.jobs,
                listeners: self.listeners,
                permits,
                last_checkin: Mutex::new(None),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    instance_id: InstanceId,
    store: Arc<dyn JobStore>,
    time_source: TimeSource,
    config: SchedulerConfig,
    jobs: HashMap<JobId, RegisteredJob>,
    listeners: Vec<Arc<dyn JobListener>>,
    permits: Arc<Semaphore>,
    last_checkin: Mutex<Option<Timestamp>>,
}

impl Scheduler {
    pub fn builder(
        store: Arc<dyn JobStore>,
        time_source: TimeSource,
        config: SchedulerConfig,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            store,
            time_source,
            config,
            jobs: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.instance_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Persist every registered job definition and check in.
    ///
    /// New jobs start at their first occurrence after now. Existing rows keep
    /// their runtime state.
    #[tracing::instrument(skip(self), fields(instance_id = %self.inner.instance_id))]
    pub async fn bootstrap(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        let now = self.inner.time_source.now();
        let mut jobs = Vec::with_capacity(self.inner.jobs.len());
        for registered in self.inner.jobs.values() {
            let definition = &registered.definition;
            let next_fire_at = definition.cadence.next_after(now)?;
            let job = self
                .inner
                .store
                .upsert_job(definition, next_fire_at, now)
                .await?;
            tracing::info!(
                job_id = %job.job_id,
                cadence = %job.cadence,
                next_fire_at = %job.next_fire_at,
                "Job registered"
            );
            jobs.push(job);
        }
        self.checkin(now).await?;
        Ok(jobs)
    }

    /// Poll until `shutdown` resolves, then deregister.
    ///
    /// A failed tick is logged and retried on the next poll. A tick that is
    /// in progress when `shutdown` resolves runs to completion.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = time::interval(self.inner.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let _ = self.tick().await.map_err(log_error);
                }
            }
        }
        tracing::info!(instance_id = %self.inner.instance_id, "Scheduler stopping");
        let _ = self
            .inner
            .store
            .deregister(&self.inner.instance_id)
            .await
            .map_err(log_error);
    }

    pub async fn run(&self) {
        self.run_until(std::future::pending()).await
    }

    /// Claim and process every due occurrence once.
    ///
    /// Returns after all claimed occurrences finished processing. If the
    /// store fails while claiming, no further claims are made, the firings
    /// already started are still awaited, and the error is returned.
    #[tracing::instrument(skip(self), fields(instance_id = %self.inner.instance_id))]
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let now = self.inner.time_source.now();
        self.checkin_if_due(now).await?;

        let due = self.inner.store.list_due(now).await?;
        let mut report = TickReport::default();
        let mut result = Ok(());
        let mut tasks = JoinSet::new();

        for candidate in due {
            // Jobs this instance has no body for are left to the others.
            let Some(registered) = self.inner.jobs.get(&candidate.job_id)
            else {
                continue;
            };
            let Ok(permit) = self.inner.permits.clone().acquire_owned().await
            else {
                break;
            };

            let now = self.inner.time_source.now();
            let claim = self
                .inner
                .store
                .claim(
                    &candidate.job_id,
                    candidate.next_fire_at,
                    &self.inner.instance_id,
                    now,
                    deadline(now, self.inner.config.job_lease),
                )
                .await;
            match claim {
                Ok(Some(job)) => {
                    report.claimed += 1;
                    let recovering = candidate.cluster_lock_owner.is_some();
                    let scheduler = self.clone();
                    let body = registered.body.clone();
                    tasks.spawn(
                        async move {
                            let _permit = permit;
                            scheduler.process(job, body, recovering).await
                        }
                        .instrument(tracing::Span::current()),
                    );
                }
                Ok(None) => {
                    tracing::debug!(job_id = %candidate.job_id, "Claim lost");
                    report.lost += 1;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(processed)) => report.record(processed),
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    } else {
                        log_error(e);
                    }
                }
                Err(e) => log_error(e),
            }
        }

        if report != TickReport::default() {
            tracing::info!(?report, "Tick processed");
        }
        result.map(|()| report)
    }

    async fn checkin_if_due(&self, now: Timestamp) -> Result<(), StoreError> {
        let last = *self
            .inner
            .last_checkin
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let due = last.is_none_or(|last| {
            deadline(last, self.inner.config.checkin_interval) <= now
        });
        if due {
            self.checkin(now).await?;
        }
        Ok(())
    }

    async fn checkin(&self, now: Timestamp) -> Result<(), StoreError> {
        self.inner
            .store
            .checkin(
                &self.inner.instance_id,
                &self.inner.config.instance_name,
                now,
            )
            .await?;
        *self
            .inner
            .last_checkin
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(now);
        Ok(())
    }

    /// Drive one claimed occurrence back to WAITING.
    #[tracing::instrument(
        skip(self, job, body),
        fields(job_id = %job.job_id, fire_at = %job.next_fire_at)
    )]
    async fn process(
        &self,
        job: ScheduledJob,
        body: Arc<dyn Job>,
        recovering: bool,
    ) -> Result<Processed, StoreError> {
        let store = &self.inner.store;
        let owner = &self.inner.instance_id;
        let now = self.inner.time_source.now();

        // The previous owner recorded an outcome and crashed before
        // rescheduling.
        if matches!(job.state, JobState::Complete | JobState::Misfired) {
            tracing::info!(state = %job.state, "Rescheduling recovered job");
            return self.reschedule(&job, job.state, now).await;
        }

        if job.is_misfire(now) {
            let Some(job) =
                store.mark_misfired(&job.job_id, owner, now).await?
            else {
                return Ok(Processed::Lost);
            };
            let misfire = MisfireError {
                job_id: job.job_id.clone(),
                scheduled_fire_at: job.next_fire_at,
                detected_at: now,
                threshold: job.misfire_threshold,
            };
            for listener in &self.inner.listeners {
                listener.on_misfire(&job, &misfire);
            }
            return match self.reschedule(&job, JobState::Misfired, now).await? {
                Processed::Lost => Ok(Processed::Lost),
                _ => Ok(Processed::Misfired),
            };
        }

        let Some(job) = store.begin_firing(&job.job_id, owner, now).await?
        else {
            return Ok(Processed::Lost);
        };
        let ctx = JobContext::new(
            job.job_id.clone(),
            owner.clone(),
            job.next_fire_at,
            now,
            job.cadence.timezone().clone(),
        )
        .with_recovering(recovering);
        for listener in &self.inner.listeners {
            listener.on_fire_start(&job, &ctx);
        }

        let Some(outcome) = self.run_body(&job, body, ctx).await else {
            return Ok(Processed::Lost);
        };
        let record = match &outcome {
            FireOutcome::Completed => OutcomeRecord::completed(),
            FireOutcome::Failed(e) => OutcomeRecord::failed(e.to_string()),
        };

        let now = self.inner.time_source.now();
        let Some(job) = store
            .mark_complete(&job.job_id, owner, &record, now)
            .await?
        else {
            tracing::warn!("Ownership lost before the outcome was recorded");
            return Ok(Processed::Lost);
        };
        for listener in &self.inner.listeners {
            listener.on_fire_complete(&job, &outcome);
        }
        match self.reschedule(&job, JobState::Complete, now).await? {
            Processed::Lost => Ok(Processed::Lost),
            _ => Ok(Processed::Fired(outcome)),
        }
    }

    /// Move the job to its first occurrence after both `now` and the
    /// occurrence just handled.
    async fn reschedule(
        &self,
        job: &ScheduledJob,
        from: JobState,
        now: Timestamp,
    ) -> Result<Processed, StoreError> {
        let next_fire_at = job.cadence.next_after(now.max(job.next_fire_at))?;
        let rescheduled = self
            .inner
            .store
            .reschedule(
                &job.job_id,
                &self.inner.instance_id,
                from,
                next_fire_at,
                now,
            )
            .await?;
        match rescheduled {
            Some(job) => {
                tracing::debug!(next_fire_at = %job.next_fire_at, "Rescheduled");
                Ok(Processed::Rescheduled)
            }
            None => {
                tracing::warn!("Ownership lost before rescheduling");
                Ok(Processed::Lost)
            }
        }
    }

    /// Run the body in its own task, renewing the claim until it finishes.
    ///
    /// Returns `None` when the claim was lost on the way: another instance
    /// took the row over, or renewals kept failing until the lease ran out.
    /// The body is aborted in that case and nothing is recorded.
    async fn run_body(
        &self,
        job: &ScheduledJob,
        body: Arc<dyn Job>,
        ctx: JobContext,
    ) -> Option<FireOutcome> {
        let mut handle =
            spawn_with_tracing(async move { body.execute(ctx).await });
        let lease = self.inner.config.job_lease;
        let period = (lease / 3).max(Duration::from_millis(10));
        let mut renewal = time::interval_at(Instant::now() + period, period);
        let mut lease_until = job
            .owner_expires_at
            .unwrap_or_else(|| deadline(self.inner.time_source.now(), lease));

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                _ = renewal.tick() => {
                    let now = self.inner.time_source.now();
                    let until = deadline(now, lease);
                    let lost = match self
                        .inner
                        .store
                        .renew_ownership(&job.job_id, &self.inner.instance_id, until)
                        .await
                    {
                        Ok(true) => {
                            lease_until = until;
                            false
                        }
                        Ok(false) => true,
                        Err(e) => {
                            log_error(e);
                            lease_until <= now
                        }
                    };
                    if lost {
                        tracing::warn!("Ownership lost while firing, aborting job body");
                        handle.abort();
                        let _ = (&mut handle).await;
                        return None;
                    }
                }
            }
        };

        let outcome = match joined {
            Ok(Ok(())) => FireOutcome::Completed,
            Ok(Err(e)) => FireOutcome::Failed(JobExecutionError::Failed(
                format!("{e:#}"),
            )),
            Err(e) if e.is_panic() => FireOutcome::Failed(
                JobExecutionError::Panicked(panic_message(e.into_panic())),
            ),
            Err(e) => {
                FireOutcome::Failed(JobExecutionError::Panicked(e.to_string()))
            }
        };
        Some(outcome)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
