//! Shared durable state: named locks, scheduled jobs and scheduler instances.
//!
//! ## Design Decisions
//!
//! ### Single-row compare-and-set
//! - Every mutation is one conditional statement against one row: an upsert
//!   guarded by expiry for locks, an update guarded by owner and state for
//!   jobs. Losing a race is reported as `Ok(None)`/`Ok(false)`, never as an
//!   error, so callers can simply move on.
//! - No multi-row transactions are needed for the protocol.
//!
//! ### Leases
//! - Lock entries and job ownership both carry an expiry. An entry whose
//!   expiry has passed is treated as abandoned and may be taken over, which
//!   is how a crashed holder is recovered.
//! - Holders renew their lease while they work, so only crashed (or
//!   partitioned) holders lose it.
//!
//! ### Time Source Dependency
//! - Store operations never read the clock themselves. The caller passes
//!   `now` from its `TimeSource`, which keeps tests deterministic and lets
//!   every instance judge expiry with the same rule.

use std::time::Duration;

use async_trait::async_trait;
use derive_more::Display;
use jiff::{SignedDuration, Timestamp};
use jiff_sqlx::Timestamp as SqlxTs;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cadence::{Cadence, CadenceError};
use crate::job::JobDefinition;
use crate::lock::LockError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Longest lock name accepted by the stores.
pub const MAX_LOCK_NAME_LEN: usize = 255;

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct LockName(String);

impl LockName {
    pub fn new(name: impl Into<String>) -> Result<Self, LockError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_LOCK_NAME_LEN {
            return Err(LockError::InvalidName(name));
        }
        Ok(Self(name))
    }

    /// Conventional `"<entity type>:<entity id>"` name for a per-entity lock.
    pub fn for_entity(
        entity_type: &str,
        entity_id: impl std::fmt::Display,
    ) -> Result<Self, LockError> {
        Self::new(format!("{entity_type}:{entity_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifies one acquisition of a named lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, sqlx::Type)]
#[sqlx(transparent)]
pub struct OwnerToken(pub Uuid);

impl OwnerToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct JobId(pub String);

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifies one running scheduler process in the cluster.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// `<name>-<uuid>`; a restarted process always gets a fresh id.
    pub fn generate(instance_name: &str) -> Self {
        Self(format!("{instance_name}-{}", Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LockEntry {
    pub name: LockName,
    pub owner: OwnerToken,
    #[sqlx(try_from = "SqlxTs")]
    pub acquired_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub expires_at: Timestamp,
}

impl LockEntry {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Acquired,
    Firing,
    Misfired,
    Complete,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[sqlx(type_name = "fire_outcome", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    Failed,
    Misfired,
}

/// Durable record of one recurring job and the state of its current firing.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    pub job_id: JobId,
    pub cadence: Cadence,
    pub misfire_threshold: Duration,
    pub next_fire_at: Timestamp,
    pub state: JobState,
    pub cluster_lock_owner: Option<InstanceId>,
    pub owner_expires_at: Option<Timestamp>,
    pub fire_count: i64,
    pub misfire_count: i64,
    pub failure_count: i64,
    pub last_fired_at: Option<Timestamp>,
    pub last_completed_at: Option<Timestamp>,
    pub last_outcome: Option<OutcomeKind>,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ScheduledJob {
    pub fn new(
        definition: &JobDefinition,
        next_fire_at: Timestamp,
        now: Timestamp,
    ) -> Self {
        Self {
            job_id: definition.job_id.clone(),
            cadence: definition.cadence.clone(),
            misfire_threshold: definition.misfire_threshold,
            next_fire_at,
            state: JobState::Waiting,
            cluster_lock_owner: None,
            owner_expires_at: None,
            fire_count: 0,
            misfire_count: 0,
            failure_count: 0,
            last_fired_at: None,
            last_completed_at: None,
            last_outcome: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// No owner, or the owner's lease ran out.
    pub fn ownership_free(&self, now: Timestamp) -> bool {
        match (&self.cluster_lock_owner, self.owner_expires_at) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => expires_at <= now,
            (Some(_), None) => false,
        }
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_fire_at <= now && self.ownership_free(now)
    }

    pub fn is_owned_by(&self, owner: &InstanceId) -> bool {
        self.cluster_lock_owner.as_ref() == Some(owner)
    }

    /// How far past its fire time the job is at `now`.
    pub fn lateness(&self, now: Timestamp) -> SignedDuration {
        now.duration_since(self.next_fire_at)
    }

    pub fn is_misfire(&self, now: Timestamp) -> bool {
        let threshold = SignedDuration::try_from(self.misfire_threshold)
            .unwrap_or(SignedDuration::MAX);
        self.lateness(now) > threshold
    }
}

/// A scheduler process that has checked in with the cluster.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SchedulerInstance {
    pub instance_id: InstanceId,
    pub instance_name: String,
    #[sqlx(try_from = "SqlxTs")]
    pub started_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub last_checkin_at: Timestamp,
}

impl SchedulerInstance {
    /// Checked in within `checkin_interval` of `now`, with one interval of
    /// grace for a slow tick.
    pub fn is_live(&self, now: Timestamp, checkin_interval: Duration) -> bool {
        let window = checkin_interval.saturating_mul(2);
        crate::time::deadline(self.last_checkin_at, window) > now
    }
}

/// Result recorded when a firing leaves the FIRING state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub kind: OutcomeKind,
    pub error: Option<String>,
}

impl OutcomeRecord {
    pub fn completed() -> Self {
        Self {
            kind: OutcomeKind::Completed,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failed,
            error: Some(error.into()),
        }
    }
}

/// Durable table of named locks shared by every instance.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create the entry for `name`, or take over an expired one.
    ///
    /// Returns `None` while another owner holds an unexpired entry.
    async fn try_acquire(
        &self,
        name: &LockName,
        owner: &OwnerToken,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> Result<Option<LockEntry>, StoreError>;

    /// Push out the expiry of an entry still held by `owner`.
    async fn renew(
        &self,
        name: &LockName,
        owner: &OwnerToken,
        expires_at: Timestamp,
    ) -> Result<bool, StoreError>;

    /// Delete the entry if `owner` still holds it.
    async fn release(
        &self,
        name: &LockName,
        owner: &OwnerToken,
    ) -> Result<bool, StoreError>;

    async fn get_lock(
        &self,
        name: &LockName,
    ) -> Result<Option<LockEntry>, StoreError>;

    /// Delete every entry that expired at or before `now`.
    async fn sweep_expired(&self, now: Timestamp) -> Result<u64, StoreError>;
}

/// Durable table of scheduled jobs and cluster instances.
///
/// Every state transition is conditional on `cluster_lock_owner == owner`
/// and on the expected source state; a failed condition yields `None`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert the job, or refresh its definition while keeping runtime state.
    /// `next_fire_at` is only replaced when the cadence changed and the job
    /// is idle.
    async fn upsert_job(
        &self,
        definition: &JobDefinition,
        next_fire_at: Timestamp,
        now: Timestamp,
    ) -> Result<ScheduledJob, StoreError>;

    async fn get_job(
        &self,
        job_id: &JobId,
    ) -> Result<Option<ScheduledJob>, StoreError>;

    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Jobs whose fire time has passed and whose ownership is free.
    async fn list_due(
        &self,
        now: Timestamp,
    ) -> Result<Vec<ScheduledJob>, StoreError>;

    /// WAITING (or abandoned) → ACQUIRED for the occurrence at
    /// `expected_fire_at`.
    async fn claim(
        &self,
        job_id: &JobId,
        expected_fire_at: Timestamp,
        owner: &InstanceId,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError>;

    /// ACQUIRED → FIRING.
    async fn begin_firing(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError>;

    /// ACQUIRED → MISFIRED.
    async fn mark_misfired(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError>;

    /// FIRING → COMPLETE.
    async fn mark_complete(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        outcome: &OutcomeRecord,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError>;

    /// `from` → WAITING with a strictly later `next_fire_at`, releasing
    /// ownership.
    async fn reschedule(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        from: JobState,
        next_fire_at: Timestamp,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError>;

    async fn renew_ownership(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        lease_until: Timestamp,
    ) -> Result<bool, StoreError>;

    async fn checkin(
        &self,
        instance_id: &InstanceId,
        instance_name: &str,
        now: Timestamp,
    ) -> Result<(), StoreError>;

    async fn deregister(
        &self,
        instance_id: &InstanceId,
    ) -> Result<(), StoreError>;

    async fn list_instances(
        &self,
    ) -> Result<Vec<SchedulerInstance>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable")]
    Unavailable(#[source] sqlx::Error),
    #[error("Unique constraint violation")]
    NotUnique(#[source] sqlx::Error),
    #[error("Database error")]
    Database(#[source] sqlx::Error),
    #[error("Invalid stored cadence")]
    InvalidCadence(#[from] CadenceError),
    #[error("Unexpected error")]
    UnexpectedError(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether the failure is about reaching the store rather than about the
    /// request itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() {
                return StoreError::NotUnique(e);
            }
        }
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e),
            e => StoreError::Database(e),
        }
    }
}

/// Durations are persisted as whole milliseconds.
pub(crate) fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn millis_to_duration(millis: i64) -> Duration {
    Duration::from_millis(u64::try_from(millis).unwrap_or(0))
}
