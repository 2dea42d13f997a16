//! Consumer-side de-duplication ledger.
//!
//! A row keyed by (event_id, consumer_group) means "this pair has been
//! processed to completion." Rows are append-only; the only write is a
//! conditional insert, so redelivered events collapse to a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_bus::dialect::SqlDialect;
use conduit_core::envelope::EventId;
use sqlx::{PgPool, SqlitePool};

use crate::error::Result;

/// De-duplication ledger operations.
#[async_trait]
pub trait InboxStore: Send + Sync + 'static {
    /// Records that (event, group) has been processed.
    ///
    /// Returns `true` when this call inserted the row, `false` when the
    /// pair was already present. Exactly one call across all deliveries
    /// of an event to a group ever returns `true`.
    async fn mark_processed(&self, event_id: EventId, consumer_group: &str) -> Result<bool>;

    /// Whether the pair is already recorded.
    async fn is_processed(&self, event_id: EventId, consumer_group: &str) -> Result<bool>;

    /// Deletes rows processed before the cutoff, returning the count.
    ///
    /// Retention is a deployment decision: rows only guard against
    /// redelivery, and brokers do not redeliver indefinitely, so a
    /// bounded window keeps the ledger from growing without end.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, Clone)]
struct InboxStatements {
    create_tables: Vec<String>,
    insert_if_absent: String,
    exists: String,
    purge: String,
}

impl InboxStatements {
    fn new(dialect: SqlDialect) -> Self {
        let d = dialect;
        let ts = d.timestamp_type();
        Self {
            create_tables: vec![format!(
                "CREATE TABLE IF NOT EXISTS bus_inbox (\
                 event_id TEXT NOT NULL, consumer_group TEXT NOT NULL, \
                 processed_at {ts} NOT NULL, \
                 PRIMARY KEY (event_id, consumer_group))"
            )],
            insert_if_absent: d.insert_if_absent(
                "bus_inbox",
                &["event_id", "consumer_group", "processed_at"],
                &["event_id", "consumer_group"],
            ),
            exists: format!(
                "SELECT COUNT(*) FROM bus_inbox WHERE event_id = {} AND consumer_group = {}",
                d.placeholder(1),
                d.placeholder(2),
            ),
            purge: format!(
                "DELETE FROM bus_inbox WHERE processed_at < {}",
                d.placeholder(1)
            ),
        }
    }
}

/// Inbox over an embedded SQLite database.
#[derive(Clone)]
pub struct SqliteInboxStore {
    pool: SqlitePool,
    sql: Arc<InboxStatements>,
}

impl SqliteInboxStore {
    /// Wraps a pool and bootstraps the inbox table.
    ///
    /// # Errors
    ///
    /// Returns a database error when schema creation fails.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let sql = InboxStatements::new(SqlDialect::Sqlite);
        for statement in &sql.create_tables {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, sql: Arc::new(sql) })
    }
}

#[async_trait]
impl InboxStore for SqliteInboxStore {
    async fn mark_processed(&self, event_id: EventId, consumer_group: &str) -> Result<bool> {
        let inserted = sqlx::query(&self.sql.insert_if_absent)
            .bind(event_id.to_string())
            .bind(consumer_group)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(inserted == 1)
    }

    async fn is_processed(&self, event_id: EventId, consumer_group: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(&self.sql.exists)
            .bind(event_id.to_string())
            .bind(consumer_group)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted =
            sqlx::query(&self.sql.purge).bind(cutoff).execute(&self.pool).await?.rows_affected();
        Ok(deleted)
    }
}

/// Inbox over a PostgreSQL database.
#[derive(Clone)]
pub struct PostgresInboxStore {
    pool: PgPool,
    sql: Arc<InboxStatements>,
}

impl PostgresInboxStore {
    /// Wraps a pool and bootstraps the inbox table.
    ///
    /// # Errors
    ///
    /// Returns a database error when schema creation fails.
    pub async fn new(pool: PgPool) -> Result<Self> {
        let sql = InboxStatements::new(SqlDialect::Postgres);
        for statement in &sql.create_tables {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, sql: Arc::new(sql) })
    }
}

#[async_trait]
impl InboxStore for PostgresInboxStore {
    async fn mark_processed(&self, event_id: EventId, consumer_group: &str) -> Result<bool> {
        let inserted = sqlx::query(&self.sql.insert_if_absent)
            .bind(event_id.to_string())
            .bind(consumer_group)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(inserted == 1)
    }

    async fn is_processed(&self, event_id: EventId, consumer_group: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(&self.sql.exists)
            .bind(event_id.to_string())
            .bind(consumer_group)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted =
            sqlx::query(&self.sql.purge).bind(cutoff).execute(&self.pool).await?.rows_affected();
        Ok(deleted)
    }
}
