pub mod cadence;
pub mod job;
pub mod listener;
pub mod lock;
pub mod period;
pub mod scheduler;
pub mod settlement;
pub mod store;
pub mod telemetry;
pub mod time;

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use jiff::SignedDuration;
use sqlx::migrate::Migrator;

use crate::cadence::Cadence;
use crate::job::DEFAULT_MISFIRE_THRESHOLD;
use crate::lock::LockConfig;
use crate::scheduler::SchedulerConfig;
use crate::settlement::DEFAULT_SETTLEMENT_CADENCE;

/// Schema for locks, scheduled jobs, instances and settlements.
pub static MIGRATOR: Migrator = sqlx::migrate!();

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: String,
    pub scheduler: SchedulerConfig,
    pub lock: LockConfig,
    pub settlement_cadence: Cadence,
    pub settlement_misfire_threshold: Duration,
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// `DATABASE_URL` is required; every other variable has a default.
    /// Durations are written like `"1s"`, `"500ms"` or `"5m"`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let scheduler_defaults = SchedulerConfig::default();
        let lock_defaults = LockConfig::default();

        let database_url =
            lookup("DATABASE_URL").context("DATABASE_URL must be set")?;

        let scheduler = SchedulerConfig {
            instance_name: lookup("SCHEDULER_INSTANCE_NAME")
                .unwrap_or(scheduler_defaults.instance_name),
            poll_interval: duration_var(
                &lookup,
                "SCHEDULER_POLL_INTERVAL",
                scheduler_defaults.poll_interval,
            )?,
            max_concurrent_fires: parsed_var(
                &lookup,
                "SCHEDULER_MAX_CONCURRENT_FIRES",
                scheduler_defaults.max_concurrent_fires,
            )?,
            job_lease: duration_var(
                &lookup,
                "SCHEDULER_JOB_LEASE",
                scheduler_defaults.job_lease,
            )?,
            checkin_interval: duration_var(
                &lookup,
                "SCHEDULER_CHECKIN_INTERVAL",
                scheduler_defaults.checkin_interval,
            )?,
        };
        anyhow::ensure!(
            scheduler.max_concurrent_fires > 0,
            "SCHEDULER_MAX_CONCURRENT_FIRES must be at least 1"
        );

        let lock = LockConfig {
            lease: duration_var(&lookup, "LOCK_LEASE", lock_defaults.lease)?,
            retry_min: duration_var(
                &lookup,
                "LOCK_RETRY_MIN",
                lock_defaults.retry_min,
            )?,
            retry_max: duration_var(
                &lookup,
                "LOCK_RETRY_MAX",
                lock_defaults.retry_max,
            )?,
            sweep_interval: duration_var(
                &lookup,
                "LOCK_SWEEP_INTERVAL",
                lock_defaults.sweep_interval,
            )?,
        };
        anyhow::ensure!(
            lock.retry_min <= lock.retry_max,
            "LOCK_RETRY_MIN must not exceed LOCK_RETRY_MAX"
        );

        let settlement_cadence = lookup("SETTLEMENT_CADENCE")
            .as_deref()
            .unwrap_or(DEFAULT_SETTLEMENT_CADENCE)
            .parse::<Cadence>()
            .context("invalid SETTLEMENT_CADENCE")?;
        let settlement_misfire_threshold = duration_var(
            &lookup,
            "SETTLEMENT_MISFIRE_THRESHOLD",
            DEFAULT_MISFIRE_THRESHOLD,
        )?;

        Ok(Config {
            database_url,
            scheduler,
            lock,
            settlement_cadence,
            settlement_misfire_threshold,
        })
    }
}

fn parsed_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: '{value}'")),
        None => Ok(default),
    }
}

fn duration_var(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> anyhow::Result<Duration> {
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    let duration: SignedDuration = value
        .trim()
        .parse()
        .with_context(|| format!("invalid {key}: '{value}'"))?;
    Duration::try_from(duration)
        .with_context(|| format!("{key} must not be negative"))
}
