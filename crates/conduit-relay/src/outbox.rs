//! Transactional outbox.
//!
//! `append` rides on the caller's own transaction, so the intent to
//! publish commits or rolls back with the business mutation it
//! accompanies. A drainer claims pending rows later and forwards them
//! to the bus.
//!
//! Row lifecycle: `pending → publishing → published | failed`. A
//! `failed` row is terminal for the automatic retry cycle but can be
//! requeued to `pending` by hand. A `publishing` row whose claim has
//! gone stale (the claiming drainer died mid-sweep) is released back
//! to `pending` on a later sweep.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_bus::dialect::SqlDialect;
use conduit_core::envelope::{Envelope, EventId};
use sqlx::{PgPool, Postgres, Sqlite, SqlitePool, Transaction};

use crate::error::{RelayError, Result};

/// State of one outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Waiting for a drainer sweep.
    Pending,
    /// Claimed by a drainer, publish in flight.
    Publishing,
    /// Successfully handed to the bus.
    Published,
    /// Retries exhausted; requires manual requeue.
    Failed,
}

impl OutboxStatus {
    /// Stable storage encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    /// Parses the storage encoding.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "publishing" => Some(Self::Publishing),
            "published" => Some(Self::Published),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbox row.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// Storage-assigned row id.
    pub id: i64,
    /// Event identifier carried by the envelope.
    pub event_id: EventId,
    /// Destination topic.
    pub topic: String,
    /// Payload shape tag.
    pub event_type: String,
    /// Routing key, possibly empty.
    pub key: String,
    /// Serialized payload.
    pub payload: String,
    /// Serialized headers.
    pub headers: String,
    /// Row state.
    pub status: OutboxStatus,
    /// Publish attempts so far.
    pub attempts: i32,
    /// Failure message from the most recent attempt.
    pub last_error: Option<String>,
    /// When the row was appended.
    pub created_at: DateTime<Utc>,
    /// When the publish succeeded.
    pub published_at: Option<DateTime<Utc>>,
    /// Earliest time the next attempt may run; `None` means immediately.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Rebuilds the envelope this row was appended from.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when the stored payload or headers
    /// fail to decode.
    pub fn envelope(&self) -> Result<Envelope> {
        Ok(Envelope {
            event_id: self.event_id,
            topic: self.topic.clone(),
            event_type: self.event_type.clone(),
            key: self.key.clone(),
            payload: serde_json::from_str(&self.payload)?,
            headers: serde_json::from_str(&self.headers)?,
            timestamp: self.created_at,
            offset: None,
        })
    }
}

/// Aggregate outbox state for the operational query surface.
#[derive(Debug, Clone, Default)]
pub struct OutboxReport {
    /// Rows waiting for a sweep.
    pub pending: u64,
    /// Rows claimed by an in-flight sweep.
    pub publishing: u64,
    /// Rows handed to the bus.
    pub published: u64,
    /// Rows whose retries are exhausted.
    pub failed: u64,
    /// Append time of the oldest pending row.
    pub oldest_pending: Option<DateTime<Utc>>,
}

/// Pool-level outbox operations consumed by the drainer and the
/// operational query surface. Appending stays on the concrete stores
/// because it needs the caller's typed transaction handle.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Claims up to `limit` due pending rows, oldest first, moving each
    /// to `publishing`. Rows another drainer claimed concurrently are
    /// skipped.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Returns `publishing` rows claimed at or before `cutoff` to
    /// `pending`. Recovers rows stranded by a drainer that died
    /// between claiming and settling. Returns the number released.
    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Marks a claimed row `published`.
    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Returns a claimed row to `pending` for a later sweep.
    async fn mark_retry(
        &self,
        id: i64,
        attempts: i32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Marks a claimed row terminally `failed`.
    async fn mark_failed(&self, id: i64, attempts: i32, error: &str) -> Result<()>;

    /// Aggregate counts and the oldest pending append time.
    async fn report(&self) -> Result<OutboxReport>;

    /// Terminally failed rows, oldest first.
    async fn failed_entries(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Requeues one `failed` row to `pending`. Returns `false` when the
    /// row does not exist or is not failed.
    async fn requeue_failed(&self, id: i64) -> Result<bool>;
}

/// Prebuilt statements for the outbox table.
#[derive(Debug, Clone)]
struct OutboxStatements {
    create_tables: Vec<String>,
    insert: String,
    select_due: String,
    claim: String,
    release_stale: String,
    mark_published: String,
    mark_retry: String,
    mark_failed: String,
    count_by_status: String,
    oldest_pending: String,
    select_failed: String,
    requeue: String,
}

const ENTRY_COLUMNS: &str = "id, event_id, topic, event_type, key, payload, headers, \
                             status, attempts, last_error, created_at, published_at, \
                             next_attempt_at";

impl OutboxStatements {
    fn new(dialect: SqlDialect) -> Self {
        let d = dialect;
        let ts = d.timestamp_type();
        Self {
            create_tables: vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS bus_outbox (\
                     {}, event_id TEXT NOT NULL, topic TEXT NOT NULL, \
                     event_type TEXT NOT NULL, key TEXT NOT NULL, \
                     payload TEXT NOT NULL, headers TEXT NOT NULL, \
                     status TEXT NOT NULL, attempts BIGINT NOT NULL DEFAULT 0, \
                     last_error TEXT, created_at {ts} NOT NULL, \
                     published_at {ts}, next_attempt_at {ts}, claimed_at {ts})",
                    d.bigserial_pk("id")
                ),
                "CREATE INDEX IF NOT EXISTS idx_bus_outbox_status_created \
                 ON bus_outbox (status, created_at)"
                    .to_string(),
            ],
            insert: format!(
                "INSERT INTO bus_outbox \
                 (event_id, topic, event_type, key, payload, headers, status, attempts, \
                  created_at) \
                 VALUES ({})",
                d.placeholders(9)
            ),
            select_due: format!(
                "SELECT {ENTRY_COLUMNS} FROM bus_outbox \
                 WHERE status = 'pending' \
                 AND (next_attempt_at IS NULL OR next_attempt_at <= {p1}) \
                 ORDER BY created_at ASC LIMIT {p2}",
                p1 = d.placeholder(1),
                p2 = d.placeholder(2),
            ),
            claim: format!(
                "UPDATE bus_outbox SET status = 'publishing', claimed_at = {p2} \
                 WHERE id = {p1} AND status = 'pending'",
                p1 = d.placeholder(1),
                p2 = d.placeholder(2),
            ),
            release_stale: format!(
                "UPDATE bus_outbox SET status = 'pending', claimed_at = NULL \
                 WHERE status = 'publishing' AND claimed_at <= {}",
                d.placeholder(1)
            ),
            mark_published: format!(
                "UPDATE bus_outbox SET status = 'published', published_at = {p2} \
                 WHERE id = {p1}",
                p1 = d.placeholder(1),
                p2 = d.placeholder(2),
            ),
            mark_retry: format!(
                "UPDATE bus_outbox SET status = 'pending', attempts = {p2}, \
                 last_error = {p3}, next_attempt_at = {p4} WHERE id = {p1}",
                p1 = d.placeholder(1),
                p2 = d.placeholder(2),
                p3 = d.placeholder(3),
                p4 = d.placeholder(4),
            ),
            mark_failed: format!(
                "UPDATE bus_outbox SET status = 'failed', attempts = {p2}, \
                 last_error = {p3} WHERE id = {p1}",
                p1 = d.placeholder(1),
                p2 = d.placeholder(2),
                p3 = d.placeholder(3),
            ),
            count_by_status: "SELECT status, COUNT(*) FROM bus_outbox GROUP BY status"
                .to_string(),
            oldest_pending: "SELECT MIN(created_at) FROM bus_outbox WHERE status = 'pending'"
                .to_string(),
            select_failed: format!(
                "SELECT {ENTRY_COLUMNS} FROM bus_outbox WHERE status = 'failed' \
                 ORDER BY created_at ASC LIMIT {}",
                d.placeholder(1)
            ),
            requeue: format!(
                "UPDATE bus_outbox SET status = 'pending', next_attempt_at = NULL, \
                 last_error = NULL WHERE id = {} AND status = 'failed'",
                d.placeholder(1)
            ),
        }
    }
}

type EntryRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

fn row_to_entry(row: EntryRow) -> Result<OutboxEntry> {
    let (
        id,
        event_id,
        topic,
        event_type,
        key,
        payload,
        headers,
        status,
        attempts,
        last_error,
        created_at,
        published_at,
        next_attempt_at,
    ) = row;
    Ok(OutboxEntry {
        id,
        event_id: EventId::parse(&event_id)
            .map_err(|e| RelayError::Corrupt(format!("outbox row {id}: {e}")))?,
        topic,
        event_type,
        key,
        payload,
        headers,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| RelayError::Corrupt(format!("outbox row {id}: status {status:?}")))?,
        attempts: attempts as i32,
        last_error,
        created_at,
        published_at,
        next_attempt_at,
    })
}

/// Outbox over an embedded SQLite database.
#[derive(Clone)]
pub struct SqliteOutboxStore {
    pool: SqlitePool,
    sql: Arc<OutboxStatements>,
}

impl SqliteOutboxStore {
    /// Wraps a pool and bootstraps the outbox table.
    ///
    /// # Errors
    ///
    /// Returns a database error when schema creation fails.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let sql = OutboxStatements::new(SqlDialect::Sqlite);
        for statement in &sql.create_tables {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, sql: Arc::new(sql) })
    }

    /// The pool this store writes through, for callers opening the
    /// transaction [`Self::append`] joins.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Appends a pending row inside the caller's transaction.
    ///
    /// The row exists only if the caller commits; a rollback leaves no
    /// trace of the publish intent.
    ///
    /// # Errors
    ///
    /// Returns a database error when the insert fails or a
    /// serialization error when the envelope cannot be encoded.
    pub async fn append(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        envelope: &Envelope,
    ) -> Result<i64> {
        let result = sqlx::query(&self.sql.insert)
            .bind(envelope.event_id.to_string())
            .bind(&envelope.topic)
            .bind(&envelope.event_type)
            .bind(&envelope.key)
            .bind(serde_json::to_string(&envelope.payload)?)
            .bind(serde_json::to_string(&envelope.headers)?)
            .bind(OutboxStatus::Pending.as_str())
            .bind(0i64)
            .bind(envelope.timestamp)
            .execute(&mut **tx)
            .await?;
        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&self.sql.select_due)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut entry = row_to_entry(row)?;
            // Compare-and-set claim; a row stolen by a concurrent
            // drainer is simply skipped.
            let won = sqlx::query(&self.sql.claim)
                .bind(entry.id)
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected();
            if won == 1 {
                entry.status = OutboxStatus::Publishing;
                claimed.push(entry);
            }
        }
        Ok(claimed)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let released = sqlx::query(&self.sql.release_stale)
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(released)
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let updated = sqlx::query(&self.sql.mark_published)
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(RelayError::EntryNotFound(id));
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: i64,
        attempts: i32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(&self.sql.mark_retry)
            .bind(id)
            .bind(i64::from(attempts))
            .bind(error)
            .bind(next_attempt_at)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(RelayError::EntryNotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, attempts: i32, error: &str) -> Result<()> {
        let updated = sqlx::query(&self.sql.mark_failed)
            .bind(id)
            .bind(i64::from(attempts))
            .bind(error)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(RelayError::EntryNotFound(id));
        }
        Ok(())
    }

    async fn report(&self) -> Result<OutboxReport> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as(&self.sql.count_by_status).fetch_all(&self.pool).await?;
        let oldest_pending: Option<DateTime<Utc>> =
            sqlx::query_scalar(&self.sql.oldest_pending).fetch_one(&self.pool).await?;

        let mut report = OutboxReport { oldest_pending, ..OutboxReport::default() };
        for (status, count) in counts {
            let count = count.max(0) as u64;
            match OutboxStatus::parse(&status) {
                Some(OutboxStatus::Pending) => report.pending = count,
                Some(OutboxStatus::Publishing) => report.publishing = count,
                Some(OutboxStatus::Published) => report.published = count,
                Some(OutboxStatus::Failed) => report.failed = count,
                None => {
                    return Err(RelayError::Corrupt(format!("unknown outbox status {status:?}")))
                },
            }
        }
        Ok(report)
    }

    async fn failed_entries(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&self.sql.select_failed)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_entry).collect()
    }

    async fn requeue_failed(&self, id: i64) -> Result<bool> {
        let updated =
            sqlx::query(&self.sql.requeue).bind(id).execute(&self.pool).await?.rows_affected();
        Ok(updated == 1)
    }
}

/// Outbox over a PostgreSQL database.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    sql: Arc<OutboxStatements>,
    insert_returning: Arc<String>,
}

impl PostgresOutboxStore {
    /// Wraps a pool and bootstraps the outbox table.
    ///
    /// # Errors
    ///
    /// Returns a database error when schema creation fails.
    pub async fn new(pool: PgPool) -> Result<Self> {
        let sql = OutboxStatements::new(SqlDialect::Postgres);
        for statement in &sql.create_tables {
            sqlx::query(statement).execute(&pool).await?;
        }
        let insert_returning = format!("{} RETURNING id", sql.insert);
        Ok(Self { pool, sql: Arc::new(sql), insert_returning: Arc::new(insert_returning) })
    }

    /// The pool this store writes through, for callers opening the
    /// transaction [`Self::append`] joins.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Appends a pending row inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns a database error when the insert fails or a
    /// serialization error when the envelope cannot be encoded.
    pub async fn append(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        envelope: &Envelope,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(self.insert_returning.as_str())
            .bind(envelope.event_id.to_string())
            .bind(&envelope.topic)
            .bind(&envelope.event_type)
            .bind(&envelope.key)
            .bind(serde_json::to_string(&envelope.payload)?)
            .bind(serde_json::to_string(&envelope.headers)?)
            .bind(OutboxStatus::Pending.as_str())
            .bind(0i64)
            .bind(envelope.timestamp)
            .fetch_one(&mut **tx)
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&self.sql.select_due)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut entry = row_to_entry(row)?;
            let won = sqlx::query(&self.sql.claim)
                .bind(entry.id)
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected();
            if won == 1 {
                entry.status = OutboxStatus::Publishing;
                claimed.push(entry);
            }
        }
        Ok(claimed)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let released = sqlx::query(&self.sql.release_stale)
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(released)
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let updated = sqlx::query(&self.sql.mark_published)
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(RelayError::EntryNotFound(id));
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: i64,
        attempts: i32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(&self.sql.mark_retry)
            .bind(id)
            .bind(i64::from(attempts))
            .bind(error)
            .bind(next_attempt_at)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(RelayError::EntryNotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, attempts: i32, error: &str) -> Result<()> {
        let updated = sqlx::query(&self.sql.mark_failed)
            .bind(id)
            .bind(i64::from(attempts))
            .bind(error)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(RelayError::EntryNotFound(id));
        }
        Ok(())
    }

    async fn report(&self) -> Result<OutboxReport> {
        let counts: Vec<(String, i64)> = sqlx::query_as(&self.sql.count_by_status)
            .fetch_all(&self.pool)
            .await?;
        let oldest_pending: Option<DateTime<Utc>> =
            sqlx::query_scalar(&self.sql.oldest_pending).fetch_one(&self.pool).await?;

        let mut report = OutboxReport { oldest_pending, ..OutboxReport::default() };
        for (status, count) in counts {
            let count = count.max(0) as u64;
            match OutboxStatus::parse(&status) {
                Some(OutboxStatus::Pending) => report.pending = count,
                Some(OutboxStatus::Publishing) => report.publishing = count,
                Some(OutboxStatus::Published) => report.published = count,
                Some(OutboxStatus::Failed) => report.failed = count,
                None => {
                    return Err(RelayError::Corrupt(format!("unknown outbox status {status:?}")))
                },
            }
        }
        Ok(report)
    }

    async fn failed_entries(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&self.sql.select_failed)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_entry).collect()
    }

    async fn requeue_failed(&self, id: i64) -> Result<bool> {
        let updated =
            sqlx::query(&self.sql.requeue).bind(id).execute(&self.pool).await?.rows_affected();
        Ok(updated == 1)
    }
}
