//! The weekly auction settlement job.
//!
//! What a settlement computes belongs to the auction domain; this job marks
//! the cycle as settled in `auction_settlements`, once per cycle no matter
//! how often the occurrence is fired or recovered.

use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use sqlx::{FromRow, PgPool};

use crate::cadence::Cadence;
use crate::job::{Job, JobContext, JobDefinition};
use crate::store::{InstanceId, JobId};

pub const SETTLEMENT_JOB_ID: &str = "auction-settlement";

/// Every Monday at 01:00, when the previous cycle has just ended.
pub const DEFAULT_SETTLEMENT_CADENCE: &str = "MON 01:00 UTC";

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct AuctionSettlement {
    #[sqlx(try_from = "SqlxTs")]
    pub period_start: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub period_end: Timestamp,
    pub job_id: JobId,
    pub settled_by: InstanceId,
    #[sqlx(try_from = "SqlxTs")]
    pub settled_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct AuctionSettlementJob {
    pool: PgPool,
}

impl AuctionSettlementJob {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Job for AuctionSettlementJob {
    #[tracing::instrument(skip(self, ctx), fields(period_start = %ctx.period.start))]
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<()> {
        let (period_start, period_end) =
            ctx.period.to_timestamps(&ctx.timezone)?;
        let inserted = sqlx::query(
            "INSERT INTO auction_settlements (
                period_start, period_end, job_id, settled_by, settled_at
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (period_start) DO NOTHING",
        )
        .bind(period_start.to_sqlx())
        .bind(period_end.to_sqlx())
        .bind(&ctx.job_id)
        .bind(&ctx.instance_id)
        .bind(ctx.fired_at.to_sqlx())
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            tracing::info!(
                %period_start,
                %period_end,
                recovering = ctx.recovering,
                "Auction period settled"
            );
        } else {
            tracing::info!(%period_start, "Auction period already settled");
        }
        Ok(())
    }
}

pub fn settlement_definition(
    cadence: Cadence,
    misfire_threshold: Duration,
) -> JobDefinition {
    JobDefinition::new(JobId::from(SETTLEMENT_JOB_ID), cadence)
        .with_misfire_threshold(misfire_threshold)
}

pub async fn list_settlements(
    pool: &PgPool,
) -> Result<Vec<AuctionSettlement>, sqlx::Error> {
    sqlx::query_as::<_, AuctionSettlement>(
        "SELECT * FROM auction_settlements ORDER BY period_start",
    )
    .fetch_all(pool)
    .await
}
