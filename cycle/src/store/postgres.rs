//! Postgres-backed stores.
//!
//! Each trait operation is a single statement. Mutual exclusion comes from
//! row-level conditions: `INSERT .. ON CONFLICT .. WHERE` for locks and
//! `UPDATE .. WHERE cluster_lock_owner = $owner AND state = $state` for jobs.
//! Postgres serializes conflicting writes to one row, so exactly one of any
//! set of concurrent callers sees its condition hold.

use async_trait::async_trait;
use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use sqlx::{FromRow, PgPool};

use super::{
    InstanceId, JobId, JobState, JobStore, LockEntry, LockName, LockStore,
    OutcomeKind, OutcomeRecord, OwnerToken, ScheduledJob, SchedulerInstance,
    StoreError, duration_to_millis, millis_to_duration,
};
use crate::job::JobDefinition;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::Type)]
#[sqlx(transparent)]
struct OptionalTimestamp(Option<SqlxTs>);

impl From<OptionalTimestamp> for Option<Timestamp> {
    fn from(x: OptionalTimestamp) -> Option<Timestamp> {
        x.0.map(|x| x.to_jiff())
    }
}

/// A `scheduled_jobs` row as stored; the cadence is still text.
#[derive(FromRow)]
struct JobRow {
    job_id: JobId,
    cadence: String,
    misfire_threshold_ms: i64,
    #[sqlx(try_from = "SqlxTs")]
    next_fire_at: Timestamp,
    state: JobState,
    cluster_lock_owner: Option<InstanceId>,
    #[sqlx(try_from = "OptionalTimestamp")]
    owner_expires_at: Option<Timestamp>,
    fire_count: i64,
    misfire_count: i64,
    failure_count: i64,
    #[sqlx(try_from = "OptionalTimestamp")]
    last_fired_at: Option<Timestamp>,
    #[sqlx(try_from = "OptionalTimestamp")]
    last_completed_at: Option<Timestamp>,
    last_outcome: Option<OutcomeKind>,
    last_error: Option<String>,
    #[sqlx(try_from = "SqlxTs")]
    created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    updated_at: Timestamp,
}

impl TryFrom<JobRow> for ScheduledJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            job_id: row.job_id,
            cadence: row.cadence.parse()?,
            misfire_threshold: millis_to_duration(row.misfire_threshold_ms),
            next_fire_at: row.next_fire_at,
            state: row.state,
            cluster_lock_owner: row.cluster_lock_owner,
            owner_expires_at: row.owner_expires_at,
            fire_count: row.fire_count,
            misfire_count: row.misfire_count,
            failure_count: row.failure_count,
            last_fired_at: row.last_fired_at,
            last_completed_at: row.last_completed_at,
            last_outcome: row.last_outcome,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_job(row: Option<JobRow>) -> Result<Option<ScheduledJob>, StoreError> {
    row.map(ScheduledJob::try_from).transpose()
}

#[async_trait]
impl LockStore for PgStore {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn try_acquire(
        &self,
        name: &LockName,
        owner: &OwnerToken,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> Result<Option<LockEntry>, StoreError> {
        sqlx::query_as::<_, LockEntry>(
            "INSERT INTO named_locks (name, owner, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                owner = EXCLUDED.owner,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE named_locks.expires_at <= EXCLUDED.acquired_at
            RETURNING *",
        )
        .bind(name)
        .bind(owner)
        .bind(now.to_sqlx())
        .bind(expires_at.to_sqlx())
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn renew(
        &self,
        name: &LockName,
        owner: &OwnerToken,
        expires_at: Timestamp,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE named_locks SET expires_at = $3
            WHERE name = $1 AND owner = $2",
        )
        .bind(name)
        .bind(owner)
        .bind(expires_at.to_sqlx())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn release(
        &self,
        name: &LockName,
        owner: &OwnerToken,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM named_locks WHERE name = $1 AND owner = $2",
        )
        .bind(name)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_lock(
        &self,
        name: &LockName,
    ) -> Result<Option<LockEntry>, StoreError> {
        sqlx::query_as::<_, LockEntry>(
            "SELECT * FROM named_locks WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    async fn sweep_expired(&self, now: Timestamp) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM named_locks WHERE expires_at <= $1")
                .bind(now.to_sqlx())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobStore for PgStore {
    #[tracing::instrument(skip(self))]
    async fn upsert_job(
        &self,
        definition: &JobDefinition,
        next_fire_at: Timestamp,
        now: Timestamp,
    ) -> Result<ScheduledJob, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "INSERT INTO scheduled_jobs (
                job_id, cadence, misfire_threshold_ms, next_fire_at,
                state, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'waiting', $5, $5)
            ON CONFLICT (job_id) DO UPDATE SET
                cadence = EXCLUDED.cadence,
                misfire_threshold_ms = EXCLUDED.misfire_threshold_ms,
                next_fire_at = CASE
                    WHEN scheduled_jobs.cadence <> EXCLUDED.cadence
                        AND scheduled_jobs.cluster_lock_owner IS NULL
                    THEN EXCLUDED.next_fire_at
                    ELSE scheduled_jobs.next_fire_at
                END,
                updated_at = EXCLUDED.updated_at
            RETURNING *",
        )
        .bind(&definition.job_id)
        .bind(definition.cadence.to_string())
        .bind(duration_to_millis(definition.misfire_threshold))
        .bind(next_fire_at.to_sqlx())
        .bind(now.to_sqlx())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_job(
        &self,
        job_id: &JobId,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM scheduled_jobs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        sqlx::query_as::<_, JobRow>(
            "SELECT * FROM scheduled_jobs ORDER BY job_id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScheduledJob::try_from)
        .collect()
    }

    async fn list_due(
        &self,
        now: Timestamp,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        sqlx::query_as::<_, JobRow>(
            "SELECT * FROM scheduled_jobs
            WHERE next_fire_at <= $1
            AND (cluster_lock_owner IS NULL OR owner_expires_at <= $1)
            ORDER BY next_fire_at, job_id",
        )
        .bind(now.to_sqlx())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScheduledJob::try_from)
        .collect()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn claim(
        &self,
        job_id: &JobId,
        expected_fire_at: Timestamp,
        owner: &InstanceId,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        // A firing that was already finished by a crashed owner keeps its
        // state so the new owner only has to reschedule it.
        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE scheduled_jobs SET
                state = CASE
                    WHEN state IN ('complete', 'misfired') THEN state
                    ELSE 'acquired'::job_state
                END,
                cluster_lock_owner = $3,
                owner_expires_at = $5,
                updated_at = $4
            WHERE job_id = $1
            AND next_fire_at = $2
            AND next_fire_at <= $4
            AND (cluster_lock_owner IS NULL OR owner_expires_at <= $4)
            RETURNING *",
        )
        .bind(job_id)
        .bind(expected_fire_at.to_sqlx())
        .bind(owner)
        .bind(now.to_sqlx())
        .bind(lease_until.to_sqlx())
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn begin_firing(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE scheduled_jobs SET
                state = 'firing',
                fire_count = fire_count + 1,
                last_fired_at = $3,
                updated_at = $3
            WHERE job_id = $1
            AND cluster_lock_owner = $2
            AND state = 'acquired'
            RETURNING *",
        )
        .bind(job_id)
        .bind(owner)
        .bind(now.to_sqlx())
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn mark_misfired(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE scheduled_jobs SET
                state = 'misfired',
                misfire_count = misfire_count + 1,
                last_outcome = 'misfired',
                last_error = NULL,
                updated_at = $3
            WHERE job_id = $1
            AND cluster_lock_owner = $2
            AND state = 'acquired'
            RETURNING *",
        )
        .bind(job_id)
        .bind(owner)
        .bind(now.to_sqlx())
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn mark_complete(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        outcome: &OutcomeRecord,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE scheduled_jobs SET
                state = 'complete',
                failure_count = failure_count
                    + CASE WHEN $3 = 'failed'::fire_outcome THEN 1 ELSE 0 END,
                last_completed_at = $5,
                last_outcome = $3,
                last_error = $4,
                updated_at = $5
            WHERE job_id = $1
            AND cluster_lock_owner = $2
            AND state = 'firing'
            RETURNING *",
        )
        .bind(job_id)
        .bind(owner)
        .bind(outcome.kind)
        .bind(outcome.error.as_deref())
        .bind(now.to_sqlx())
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn reschedule(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        from: JobState,
        next_fire_at: Timestamp,
        now: Timestamp,
    ) -> Result<Option<ScheduledJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE scheduled_jobs SET
                state = 'waiting',
                next_fire_at = $4,
                cluster_lock_owner = NULL,
                owner_expires_at = NULL,
                updated_at = $5
            WHERE job_id = $1
            AND cluster_lock_owner = $2
            AND state = $3
            AND next_fire_at < $4
            RETURNING *",
        )
        .bind(job_id)
        .bind(owner)
        .bind(from)
        .bind(next_fire_at.to_sqlx())
        .bind(now.to_sqlx())
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    async fn renew_ownership(
        &self,
        job_id: &JobId,
        owner: &InstanceId,
        lease_until: Timestamp,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET owner_expires_at = $3
            WHERE job_id = $1 AND cluster_lock_owner = $2",
        )
        .bind(job_id)
        .bind(owner)
        .bind(lease_until.to_sqlx())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn checkin(
        &self,
        instance_id: &InstanceId,
        instance_name: &str,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scheduler_instances (
                instance_id, instance_name, started_at, last_checkin_at
            )
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (instance_id) DO UPDATE SET
                instance_name = EXCLUDED.instance_name,
                last_checkin_at = EXCLUDED.last_checkin_at",
        )
        .bind(instance_id)
        .bind(instance_name)
        .bind(now.to_sqlx())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deregister(
        &self,
        instance_id: &InstanceId,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM scheduler_instances WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_instances(
        &self,
    ) -> Result<Vec<SchedulerInstance>, StoreError> {
        sqlx::query_as::<_, SchedulerInstance>(
            "SELECT * FROM scheduler_instances ORDER BY instance_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}
