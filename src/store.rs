//! Typed access to the `outbox_messages` table.
//!
//! Worker exclusivity is enforced with optimistic concurrency, not row locks:
//! every mutating statement carries `WHERE id = $1 AND version = $2` and bumps
//! `version`. A zero-row update means another worker already moved the record
//! and the caller must drop it. Read-committed isolation is sufficient; no
//! `SELECT … FOR UPDATE SKIP LOCKED` is used.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};
use crate::record::{OutboxRecord, OutboxStatus};

/// Relay-facing queries against the outbox table.
///
/// Mutating calls take `&mut OutboxRecord` and return whether the guarded
/// update won: on `Ok(true)` the in-memory record mirrors the new row state,
/// on `Ok(false)` the record was moved by another worker and is left
/// untouched.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Pending records visible to `worker_id`, oldest first.
    ///
    /// Selects `status = PENDING AND (worker_id IS NULL OR worker_id = $self)`
    /// so a worker can resume records it leased before a crash.
    async fn lease_pending(&self, worker_id: &str, limit: i64) -> OutboxResult<Vec<OutboxRecord>>;

    /// Assert ownership of `record` for the duration of a publish attempt.
    async fn claim(&self, record: &mut OutboxRecord, worker_id: &str) -> OutboxResult<bool>;

    /// Terminal success: `SENT`, `processed_at` set, `error_message` cleared.
    async fn mark_sent(&self, record: &mut OutboxRecord) -> OutboxResult<bool>;

    /// Record one failed publish attempt.
    ///
    /// Increments `retry_count` and stores `error`. While budget remains the
    /// record returns to `PENDING` with its lease cleared, so the next poll
    /// selects it again; once `retry_count` reaches `max_retries` it is
    /// promoted to `DEAD_LETTER` with `processed_at` set.
    async fn mark_failed(&self, record: &mut OutboxRecord, error: &str) -> OutboxResult<bool>;

    async fn count_by_status(&self, status: OutboxStatus) -> OutboxResult<i64>;

    /// Pending records that have already failed at least once (the
    /// `outbox.messages.failed` gauge).
    async fn count_retrying(&self) -> OutboxResult<i64>;

    /// Prune `SENT` records processed before `cutoff`. Returns rows deleted.
    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64>;
}

/// SQLx/PostgreSQL implementation of [`OutboxStore`].
pub struct PgOutboxStore {
    pool: PgPool,
}

const RECORD_COLUMNS: &str = "id, aggregate_id, aggregate_type, event_type, payload, \
     changed_fields, status, created_at, processed_at, retry_count, max_retries, \
     error_message, worker_id, version";

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append `record` to the outbox inside the caller's transaction, so the
    /// record commits or rolls back together with the business write.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &OutboxRecord,
    ) -> OutboxResult<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let changed_fields = record
            .changed_fields
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id,
                aggregate_id,
                aggregate_type,
                event_type,
                payload,
                changed_fields,
                status,
                created_at,
                processed_at,
                retry_count,
                max_retries,
                error_message,
                worker_id,
                version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(record.id)
        .bind(&record.aggregate_id)
        .bind(&record.aggregate_type)
        .bind(&record.event_type)
        .bind(payload)
        .bind(changed_fields)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.processed_at)
        .bind(record.retry_count)
        .bind(record.max_retries)
        .bind(&record.error_message)
        .bind(&record.worker_id)
        .bind(record.version)
        .execute(&mut **tx)
        .await?;

        debug!(
            record_id = %record.id,
            event_type = %record.event_type,
            aggregate_id = %record.aggregate_id,
            "Outbox record enlisted in transaction"
        );

        Ok(())
    }

    /// Pending count and age in seconds of the oldest pending record
    /// (0 when nothing is pending).
    pub async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_messages
            WHERE status = 'PENDING'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = row.try_get("pending").unwrap_or(0);
        let age: i64 = row.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }

    /// Reset every record created since `ts` to `PENDING` so a healthy relay
    /// republishes it. Includes dead-lettered records; this is the operator
    /// action the dead-letter state waits for.
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'PENDING',
                processed_at = NULL,
                retry_count = 0,
                error_message = NULL,
                worker_id = NULL,
                version = version + 1
            WHERE created_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    /// Reset records in the inclusive id range to `PENDING` for backfill.
    pub async fn replay_range(&self, from_id: Uuid, to_id: Uuid) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'PENDING',
                processed_at = NULL,
                retry_count = 0,
                error_message = NULL,
                worker_id = NULL,
                version = version + 1
            WHERE id BETWEEN $1 AND $2
            "#,
        )
        .bind(from_id)
        .bind(to_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    fn map_row(row: &sqlx::postgres::PgRow) -> OutboxResult<OutboxRecord> {
        let status: String = row.try_get("status").map_err(OutboxError::Database)?;
        let status = status
            .parse::<OutboxStatus>()
            .map_err(|e| OutboxError::Other(anyhow::anyhow!(e)))?;

        let payload: String = row.try_get("payload").map_err(OutboxError::Database)?;
        let payload = serde_json::from_str(&payload)?;

        let changed_fields: Option<String> = row
            .try_get("changed_fields")
            .map_err(OutboxError::Database)?;
        let changed_fields = changed_fields
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(OutboxRecord {
            id: row.try_get("id").map_err(OutboxError::Database)?,
            aggregate_id: row.try_get("aggregate_id").map_err(OutboxError::Database)?,
            aggregate_type: row
                .try_get("aggregate_type")
                .map_err(OutboxError::Database)?,
            event_type: row.try_get("event_type").map_err(OutboxError::Database)?,
            payload,
            changed_fields,
            status,
            created_at: row.try_get("created_at").map_err(OutboxError::Database)?,
            processed_at: row.try_get("processed_at").map_err(OutboxError::Database)?,
            retry_count: row.try_get("retry_count").map_err(OutboxError::Database)?,
            max_retries: row.try_get("max_retries").map_err(OutboxError::Database)?,
            error_message: row
                .try_get("error_message")
                .map_err(OutboxError::Database)?,
            worker_id: row.try_get("worker_id").map_err(OutboxError::Database)?,
            version: row.try_get("version").map_err(OutboxError::Database)?,
        })
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn lease_pending(&self, worker_id: &str, limit: i64) -> OutboxResult<Vec<OutboxRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM outbox_messages
            WHERE status = 'PENDING'
              AND (worker_id IS NULL OR worker_id = $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(worker_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .iter()
            .map(Self::map_row)
            .collect::<OutboxResult<Vec<_>>>()?;

        debug!(worker_id = %worker_id, count = records.len(), "Leased pending records");

        Ok(records)
    }

    async fn claim(&self, record: &mut OutboxRecord, worker_id: &str) -> OutboxResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET worker_id = $3,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(record.id)
        .bind(record.version)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            debug!(record_id = %record.id, worker_id = %worker_id, "Lost claim race");
            return Ok(false);
        }

        record.worker_id = Some(worker_id.to_string());
        record.version += 1;
        Ok(true)
    }

    async fn mark_sent(&self, record: &mut OutboxRecord) -> OutboxResult<bool> {
        let now = Utc::now();
        let res = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'SENT',
                processed_at = $3,
                error_message = NULL,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(record.id)
        .bind(record.version)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            debug!(record_id = %record.id, "Lost mark_sent race");
            return Ok(false);
        }

        record.status = OutboxStatus::Sent;
        record.processed_at = Some(now);
        record.error_message = None;
        record.version += 1;
        Ok(true)
    }

    async fn mark_failed(&self, record: &mut OutboxRecord, error: &str) -> OutboxResult<bool> {
        let now = Utc::now();
        let promote = record.retries_exhausted_after_next_failure();

        let res = if promote {
            sqlx::query(
                r#"
                UPDATE outbox_messages
                SET status = 'DEAD_LETTER',
                    retry_count = retry_count + 1,
                    error_message = $3,
                    processed_at = $4,
                    worker_id = NULL,
                    version = version + 1
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(record.id)
            .bind(record.version)
            .bind(error)
            .bind(now)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE outbox_messages
                SET status = 'PENDING',
                    retry_count = retry_count + 1,
                    error_message = $3,
                    worker_id = NULL,
                    version = version + 1
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(record.id)
            .bind(record.version)
            .bind(error)
            .execute(&self.pool)
            .await?
        };

        if res.rows_affected() == 0 {
            debug!(record_id = %record.id, "Lost mark_failed race");
            return Ok(false);
        }

        record.retry_count += 1;
        record.error_message = Some(error.to_string());
        record.worker_id = None;
        record.version += 1;
        if promote {
            record.status = OutboxStatus::DeadLetter;
            record.processed_at = Some(now);
            warn!(
                record_id = %record.id,
                event_type = %record.event_type,
                retry_count = record.retry_count,
                "Record exhausted retries, promoted to dead letter"
            );
        } else {
            record.status = OutboxStatus::Pending;
        }
        Ok(true)
    }

    async fn count_by_status(&self, status: OutboxStatus) -> OutboxResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*)::BIGINT AS count FROM outbox_messages WHERE status = $1",
        )
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("count").unwrap_or(0))
    }

    async fn count_retrying(&self) -> OutboxResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)::BIGINT AS count
            FROM outbox_messages
            WHERE status = 'PENDING' AND retry_count > 0
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("count").unwrap_or(0))
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            "DELETE FROM outbox_messages WHERE status = 'SENT' AND processed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}
