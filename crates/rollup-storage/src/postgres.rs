use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rollup_core::{
    BucketKey, LoadScope, OutputRecord, OwnerId, RecordId, ReminderRecord, ReminderStatus,
    SnapshotRecord,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::{OutputStore, StoreError, WriteOutcome};

/// Postgres-backed store for snapshots and reminders. Each `save_all` runs in
/// one transaction; unique indexes on the natural keys back the conflict check.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Database(err.into()))
    }
}

fn parse_key(text: &str) -> Result<BucketKey, StoreError> {
    text.parse()
        .map_err(|err: rollup_core::KeyParseError| StoreError::Corrupt(err.to_string()))
}

fn snapshot_from_row(row: &PgRow) -> Result<SnapshotRecord, StoreError> {
    let bucket_key: String = row.try_get("bucket_key")?;
    let source_count: i64 = row.try_get("source_count")?;
    let Json(totals): Json<BTreeMap<String, Decimal>> = row.try_get("totals")?;
    let folded: Vec<String> = row.try_get("folded")?;
    Ok(SnapshotRecord {
        id: Some(row.try_get::<Uuid, _>("id")?),
        bucket: parse_key(&bucket_key)?,
        period_start: row.try_get::<NaiveDate, _>("period_start")?,
        period_end: row.try_get::<NaiveDate, _>("period_end")?,
        totals,
        source_count: u64::try_from(source_count)
            .map_err(|_| StoreError::Corrupt(format!("negative source_count for {bucket_key}")))?,
        folded: folded.into_iter().map(RecordId).collect::<BTreeSet<_>>(),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn reminder_from_row(row: &PgRow) -> Result<ReminderRecord, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ReminderRecord {
        id: Some(row.try_get::<Uuid, _>("id")?),
        owner: OwnerId(row.try_get("owner_id")?),
        job_id: row.try_get("job_id")?,
        status: status.parse::<ReminderStatus>().map_err(StoreError::Corrupt)?,
        last_activity_at: row.try_get("last_activity_at")?,
        created_at: row.try_get("created_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

const SNAPSHOT_COLUMNS: &str =
    "id, bucket_key, period_start, period_end, totals, source_count, folded, created_at, updated_at";

const REMINDER_COLUMNS: &str =
    "id, owner_id, job_id, status, last_activity_at, created_at, closed_at";

#[async_trait]
impl OutputStore<SnapshotRecord> for PgStore {
    async fn load_existing(
        &self,
        scope: &LoadScope,
    ) -> Result<BTreeMap<BucketKey, SnapshotRecord>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE period_start <= $2 AND period_end >= $1"
        );
        let rows = sqlx::query(&sql)
            .bind(scope.from)
            .bind(scope.to)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| snapshot_from_row(row).map(|s| (s.bucket.clone(), s)))
            .collect()
    }

    async fn save_all(
        &self,
        records: Vec<SnapshotRecord>,
    ) -> Result<WriteOutcome<SnapshotRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = WriteOutcome::default();

        for mut record in records {
            let folded: Vec<String> = record.folded.iter().map(|id| id.0.clone()).collect();
            let source_count = i64::try_from(record.source_count)
                .map_err(|_| StoreError::Corrupt(format!("source_count overflow for {}", record.bucket)))?;
            match record.id {
                Some(id) => {
                    let result = sqlx::query(
                        "UPDATE snapshots SET totals = $3, source_count = $4, folded = $5, updated_at = $6 \
                         WHERE id = $1 AND bucket_key = $2",
                    )
                    .bind(id)
                    .bind(record.bucket.to_string())
                    .bind(Json(&record.totals))
                    .bind(source_count)
                    .bind(&folded)
                    .bind(record.updated_at)
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() == 0 {
                        return Err(StoreError::UnknownIdentity { id });
                    }
                    outcome.updated += 1;
                }
                None => {
                    let id = Uuid::new_v4();
                    let result = sqlx::query(
                        "INSERT INTO snapshots (id, bucket_key, period_start, period_end, totals, source_count, folded, created_at, updated_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                         ON CONFLICT (bucket_key) DO NOTHING",
                    )
                    .bind(id)
                    .bind(record.bucket.to_string())
                    .bind(record.period_start)
                    .bind(record.period_end)
                    .bind(Json(&record.totals))
                    .bind(source_count)
                    .bind(&folded)
                    .bind(record.created_at)
                    .bind(record.updated_at)
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() == 0 {
                        return Err(StoreError::Conflict {
                            bucket: record.bucket,
                        });
                    }
                    record.assign_id(id);
                    outcome.inserted += 1;
                }
            }
            outcome.records.push(record);
        }

        tx.commit().await?;
        debug!(inserted = outcome.inserted, updated = outcome.updated, "snapshots committed");
        Ok(outcome)
    }

    async fn list_all(&self) -> Result<Vec<SnapshotRecord>, StoreError> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots ORDER BY period_start, bucket_key");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(snapshot_from_row).collect()
    }
}

#[async_trait]
impl OutputStore<ReminderRecord> for PgStore {
    async fn load_existing(
        &self,
        _scope: &LoadScope,
    ) -> Result<BTreeMap<BucketKey, ReminderRecord>, StoreError> {
        let sql = format!("SELECT {REMINDER_COLUMNS} FROM reminders WHERE status = 'open'");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| reminder_from_row(row).map(|r| (r.key(), r)))
            .collect()
    }

    async fn save_all(
        &self,
        records: Vec<ReminderRecord>,
    ) -> Result<WriteOutcome<ReminderRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = WriteOutcome::default();

        for mut record in records {
            match record.id {
                Some(id) => {
                    let result = sqlx::query(
                        "UPDATE reminders SET status = $3, last_activity_at = $4, closed_at = $5 \
                         WHERE id = $1 AND owner_id = $2",
                    )
                    .bind(id)
                    .bind(&record.owner.0)
                    .bind(record.status.as_str())
                    .bind(record.last_activity_at)
                    .bind(record.closed_at)
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() == 0 {
                        return Err(StoreError::UnknownIdentity { id });
                    }
                    outcome.updated += 1;
                }
                None => {
                    let id = Uuid::new_v4();
                    // the partial unique index only covers open reminders
                    let result = sqlx::query(
                        "INSERT INTO reminders (id, owner_id, job_id, status, last_activity_at, created_at, closed_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7) \
                         ON CONFLICT DO NOTHING",
                    )
                    .bind(id)
                    .bind(&record.owner.0)
                    .bind(&record.job_id)
                    .bind(record.status.as_str())
                    .bind(record.last_activity_at)
                    .bind(record.created_at)
                    .bind(record.closed_at)
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() == 0 {
                        return Err(StoreError::Conflict {
                            bucket: record.key(),
                        });
                    }
                    record.assign_id(id);
                    outcome.inserted += 1;
                }
            }
            outcome.records.push(record);
        }

        tx.commit().await?;
        debug!(inserted = outcome.inserted, updated = outcome.updated, "reminders committed");
        Ok(outcome)
    }

    async fn list_all(&self) -> Result<Vec<ReminderRecord>, StoreError> {
        let sql = format!("SELECT {REMINDER_COLUMNS} FROM reminders ORDER BY created_at, owner_id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(reminder_from_row).collect()
    }
}
