//! In-process stores with the same compare-and-set rules as [`PgStore`].
//!
//! Every operation holds one mutex for its whole read-modify-write, which
//! gives the same single-row atomicity Postgres does. Used for tests and for
//! single-process deployments that only need the lock executor.
//!
//! [`PgStore`]: super::PgStore

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use jiff::Timestamp;

use super::{
    InstanceId, JobId, JobState, JobStore, LockEntry, LockName, LockStore,
    OutcomeKind, OutcomeRecord, OwnerToken, ScheduledJob, SchedulerInstance,
    StoreError,
};
use crate::job::JobDefinition;

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    locks: HashMap<LockName, LockEntry>,
    jobs: BTreeMap<JobId, ScheduledJob>,
    instances: BTreeMap<InstanceId, SchedulerInstance>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Tables {
    /// Apply `update` to the job if `owner` holds it in state `from`.
    fn transition(
        &mut self,
        job_id: &JobId,
        owner: &InstanceId,
        from: JobState,
        update: impl FnOnce(&mut ScheduledJob),
    ) -> Option<ScheduledJob> {
        let job = self.jobs.get_mut(job_id)?;
        if !job.is_owned_by(owner) || job.state != from {
            return None;
        }
        update(job);
        Some(job.clone())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(
        &self,
        name: &LockName,
        owner: &OwnerToken,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> Result<Option<LockEntry>, StoreError> {
        let mut tables = self.tables();
        if let Some(existing) = tables.locks.get(name) {
            if !existing.is_expired(now) {
                return Ok(None);
            }
        }
        let entry = LockEntry {
            name: name.clone(),
            owner: *owner,
            acquired_at: now,
            expires_at,
        };
        tables.locks.insert(name.clone(), entry.clone());
        Ok(Some(entry))
    }

    async fn renew(
        &self,
        name: &LockName,
        owner: &OwnerToken,
        expires_at: Timestamp,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables();
        match tables.locks.get_mut(name) {
            Some(entry) if entry.owner == *owner => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(
        &self,
        name: &LockName,
        owner: &OwnerToken,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables();
        match tables.locks.get(name) {
            Some(entry) if entry.owner == *owner => {
                tables.locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lock(
        &self,
        name: &LockName,
    ) -> Result<Option<LockEntry>, StoreError> {
        Ok(self.tables().locks.get(name).cloned())
    }

    async fn sweep_expired(&self, now: Timestamp) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let before = tables.locks.len();
        tables.locks.retain(|_, entry| !entry.is_expired(now));
        Ok((before - tables.locks.len()) as u64)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn upsert_job(
        &self,
        definition: &JobDefinition,
        next_fire_at: Timestamp,
        now: Timestamp,
    ) -> Result<ScheduledJob, StoreError> {
        let mut tables = self.tables();
        let job = tables
            .jobs
            .entry(definition.job_id.clone())
            .and_modify(|job| {
                if job.cadence != definition.cadence
                    && job.cluster_lock_owner.is_none()
                {
                    job.next_fire_at = next_fire_at;
                }
                job.cadence = definition.cadence.clone();
                job.misfire_threshold = definition.misfire_threshold;
                job.updated_at = now;
            })
            .or_insert_with(|| ScheduledJob::new(definition, next_fire_at, now));
        Ok(job.clone())
    }

    async fn get_job(
        &self,
        job_id: &JobId,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        Ok(self.tables().jobs.get(job_id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        Ok(self.tables().jobs.values().cloned().collect())
    }

    async fn list_due(
        &self,
        now: Timestamp,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let mut due: Vec<_> = self
            .tables()
            .jobs
            .values()
            .filter(|job| job.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            (a.next_fire_at, &a.job_id).cmp(&(b.next_fire_at, &b.job_id))
        });
        Ok(due)
    }

    async fn claim(
        &self,
        job_id: &JobId,
        expected_fire_at: Timestamp,
        owner: &InstanceId,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        let mut tables = self.tables();
        let Some(job) = tables.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if job.next_fire_at != expected_fire_at || !job.is_due(now) {
            return Ok(None);
        }
        if !matches!(job.state, JobState::Complete | JobState::Misfired) {
            job.state = JobState::Acquired;
        }
        job.cluster_lock_owner = Some(owner.clone());
        job.owner_expires_at = Some(lease_until);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn begin_firing(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        Ok(self.tables().transition(
            job_id,
            owner,
            JobState::Acquired,
            |job| {
                job.state = JobState::Firing;
                job.fire_count += 1;
                job.last_fired_at = Some(now);
                job.updated_at = now;
            },
        ))
    }

    async fn mark_misfired(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        Ok(self.tables().transition(
            job_id,
            owner,
            JobState::Acquired,
            |job| {
                job.state = JobState::Misfired;
                job.misfire_count += 1;
                job.last_outcome = Some(OutcomeKind::Misfired);
                job.last_error = None;
                job.updated_at = now;
            },
        ))
    }

    async fn mark_complete(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        outcome: &OutcomeRecord,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        Ok(self.tables().transition(
            job_id,
            owner,
            JobState::Firing,
            |job| {
                job.state = JobState::Complete;
                if outcome.kind == OutcomeKind::Failed {
                    job.failure_count += 1;
                }
                job.last_completed_at = Some(now);
                job.last_outcome = Some(outcome.kind);
                job.last_error = outcome.error.clone();
                job.updated_at = now;
            },
        ))
    }

    async fn reschedule(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        from: JobState,
        next_fire_at: Timestamp,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        let mut tables = self.tables();
        if tables
            .jobs
            .get(job_id)
            .is_some_and(|job| job.next_fire_at >= next_fire_at)
        {
            return Ok(None);
        }
        Ok(tables.transition(job_id, owner, from, |job| {
            job.state = JobState::Waiting;
            job.next_fire_at = next_fire_at;
            job.cluster_lock_owner = None;
            job.owner_expires_at = None;
            job.updated_at = now;
        }))
    }

    async fn renew_ownership(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        lease_until: Timestamp,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables();
        match tables.jobs.get_mut(job_id) {
            Some(job) if job.is_owned_by(owner) => {
                job.owner_expires_at = Some(lease_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn checkin(
        &self,
        instance_id: &InstanceId,
        instance_name: &str,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        self.tables()
            .instances
            .entry(instance_id.clone())
            .and_modify(|instance| {
                instance.instance_name = instance_name.to_string();
                instance.last_checkin_at = now;
            })
            .or_insert_with(|| SchedulerInstance {
                instance_id: instance_id.clone(),
                instance_name: instance_name.to_string(),
                started_at: now,
                last_checkin_at: now,
            });
        Ok(())
    }

    async fn deregister(
        &self,
        instance_id: &InstanceId,
    ) -> Result<(), StoreError> {
        self.tables().instances.remove(instance_id);
        Ok(())
    }

    async fn list_instances(
        &self,
    ) -> Result<Vec<SchedulerInstance>, StoreError> {
        Ok(self.tables().instances.values().cloned().collect())
    }
}
