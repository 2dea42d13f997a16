//! Embedded SQLite adapter.
//!
//! Durable single-node bus backed by the broker tables from
//! [`BrokerStatements`]. Offsets are the `bus_events` rowids, so the
//! group cursor stores the last settled rowid and polling selects
//! everything past it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::{
    envelope::{Envelope, EventId},
    error::Result,
    BusError,
};
use futures::stream;
use sqlx::SqlitePool;
use tracing::debug;

use crate::{
    bus::{
        decode_headers, encode_headers, ConsumerInfo, DlqEvent, EventBus, EventHandler,
        NackReason, ReplayFilter, ReplayStream, TopicInfo,
    },
    dialect::{BrokerStatements, SqlDialect},
    runtime::{ConsumerRuntime, ConsumerTransport, RuntimeConfig},
};

type EventRow = (i64, String, String, String, String, String, DateTime<Utc>);
type DlqRow = (String, String, String, String, String, DateTime<Utc>);

/// Bus backed by an embedded SQLite database.
///
/// Cheap to clone; clones share the pool and consumer runtime.
#[derive(Clone)]
pub struct SqliteBus {
    pool: SqlitePool,
    sql: Arc<BrokerStatements>,
    runtime: Arc<ConsumerRuntime>,
}

impl SqliteBus {
    /// Wraps an existing pool and bootstraps the broker tables.
    ///
    /// # Errors
    ///
    /// Returns a database error when schema creation fails.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        Self::with_runtime(pool, RuntimeConfig::default()).await
    }

    /// Wraps an existing pool with explicit consumer loop tuning.
    ///
    /// # Errors
    ///
    /// Returns a database error when schema creation fails.
    pub async fn with_runtime(pool: SqlitePool, runtime: RuntimeConfig) -> Result<Self> {
        let sql = BrokerStatements::new(SqlDialect::Sqlite);
        for statement in &sql.create_tables {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, sql: Arc::new(sql), runtime: Arc::new(ConsumerRuntime::new(runtime)) })
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(&self.sql.topic_exists)
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn require_topic(&self, topic: &str) -> Result<()> {
        if self.topic_exists(topic).await? {
            Ok(())
        } else {
            Err(BusError::topic_not_found(topic))
        }
    }

    async fn cursor_for(&self, topic: &str, group_id: &str) -> Result<i64> {
        let cursor: Option<i64> = sqlx::query_scalar(&self.sql.select_cursor)
            .bind(topic)
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;
        match cursor {
            Some(cursor) => Ok(cursor),
            None => {
                self.require_topic(topic).await?;
                Err(BusError::consumer_not_found(topic, group_id))
            },
        }
    }

    /// Sets the cursor to `offset` unless it is already past it.
    async fn advance_cursor(&self, topic: &str, group_id: &str, offset: u64) -> Result<()> {
        let updated = sqlx::query(&self.sql.advance_cursor)
            .bind(topic)
            .bind(group_id)
            .bind(offset as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            // Either the cursor already moved past this offset or the
            // group row is gone; only the latter is an error.
            self.cursor_for(topic, group_id).await?;
        }
        Ok(())
    }
}

fn row_to_envelope(topic: &str, row: EventRow) -> Result<Envelope> {
    let (id, event_id, event_type, key, payload, headers, created_at) = row;
    Ok(Envelope {
        event_id: EventId::parse(&event_id).map_err(|e| BusError::Serialization(e.to_string()))?,
        topic: topic.to_string(),
        event_type,
        key,
        payload: serde_json::from_str(&payload)?,
        headers: decode_headers(&headers)?,
        timestamp: created_at,
        offset: Some(id as u64),
    })
}

fn row_to_dlq(row: DlqRow) -> Result<DlqEvent> {
    let (_event_id, _topic, group_id, reason, envelope, failed_at) = row;
    Ok(DlqEvent { envelope: serde_json::from_str(&envelope)?, group_id, reason, failed_at })
}

#[async_trait]
impl ConsumerTransport for SqliteBus {
    async fn poll_batch(&self, topic: &str, group_id: &str, max: usize) -> Result<Vec<Envelope>> {
        // Fails fast with the precise error when the group is unknown;
        // the subquery in the batch statement would just return nothing.
        self.cursor_for(topic, group_id).await?;

        let rows: Vec<EventRow> = sqlx::query_as(&self.sql.poll_batch)
            .bind(topic)
            .bind(group_id)
            .bind(max as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|row| row_to_envelope(topic, row)).collect()
    }

    async fn ack(&self, envelope: &Envelope, group_id: &str) -> Result<()> {
        let offset = envelope
            .offset
            .ok_or_else(|| BusError::backend("cannot ack an envelope without an offset"))?;
        self.advance_cursor(&envelope.topic, group_id, offset).await
    }

    async fn nack(&self, envelope: &Envelope, group_id: &str, reason: NackReason) -> Result<()> {
        match reason {
            NackReason::Transient(reason) => {
                debug!(
                    topic = %envelope.topic,
                    group_id,
                    event_id = %envelope.event_id,
                    reason = %reason,
                    "transient nack, event left for redelivery"
                );
                Ok(())
            },
            NackReason::Permanent(reason) => {
                let offset = envelope.offset.ok_or_else(|| {
                    BusError::backend("cannot nack an envelope without an offset")
                })?;

                sqlx::query(&self.sql.insert_dlq)
                    .bind(envelope.event_id.to_string())
                    .bind(&envelope.topic)
                    .bind(group_id)
                    .bind(&reason)
                    .bind(serde_json::to_string(envelope)?)
                    .bind(Utc::now())
                    .execute(&self.pool)
                    .await?;

                self.advance_cursor(&envelope.topic, group_id, offset).await
            },
        }
    }
}

#[async_trait]
impl EventBus for SqliteBus {
    async fn publish(&self, envelope: Envelope) -> Result<Envelope> {
        sqlx::query(&self.sql.insert_topic)
            .bind(&envelope.topic)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        let result = sqlx::query(&self.sql.insert_event)
            .bind(envelope.event_id.to_string())
            .bind(&envelope.topic)
            .bind(&envelope.event_type)
            .bind(&envelope.key)
            .bind(serde_json::to_string(&envelope.payload)?)
            .bind(encode_headers(&envelope.headers)?)
            .bind(envelope.timestamp)
            .execute(&self.pool)
            .await?;

        let offset = result.last_insert_rowid() as u64;
        debug!(topic = %envelope.topic, event_id = %envelope.event_id, offset, "event published");
        Ok(envelope.with_offset(offset))
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        sqlx::query(&self.sql.insert_topic)
            .bind(topic)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        sqlx::query(&self.sql.insert_group)
            .bind(topic)
            .bind(group_id)
            .bind(0i64)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        self.runtime.subscribe(Arc::new(self.clone()), topic, group_id, handler).await
    }

    async fn unsubscribe(&self, topic: &str, group_id: &str) -> Result<()> {
        self.runtime.unsubscribe(topic, group_id).await
    }

    async fn ack(&self, envelope: &Envelope, group_id: &str) -> Result<()> {
        ConsumerTransport::ack(self, envelope, group_id).await
    }

    async fn nack(&self, envelope: &Envelope, group_id: &str, reason: NackReason) -> Result<()> {
        ConsumerTransport::nack(self, envelope, group_id, reason).await
    }

    async fn replay(&self, filter: ReplayFilter) -> Result<ReplayStream> {
        self.require_topic(&filter.topic).await?;

        let rows: Vec<EventRow> = sqlx::query_as(&self.sql.replay_scan)
            .bind(&filter.topic)
            .fetch_all(&self.pool)
            .await?;

        let matched: Vec<Result<Envelope>> = rows
            .into_iter()
            .map(|row| row_to_envelope(&filter.topic, row))
            .filter(|decoded| decoded.as_ref().map_or(true, |e| filter.matches(e)))
            .collect();
        Ok(Box::pin(stream::iter(matched)))
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(&self.sql.list_topics).fetch_all(&self.pool).await?)
    }

    async fn get_topic_info(&self, topic: &str) -> Result<TopicInfo> {
        self.require_topic(topic).await?;

        let event_count: i64 = sqlx::query_scalar(&self.sql.count_events)
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;
        let dlq_count: i64 = sqlx::query_scalar(&self.sql.count_dlq_for_topic)
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;
        let consumer_groups: Vec<String> = sqlx::query_scalar(&self.sql.groups_for_topic)
            .bind(topic)
            .fetch_all(&self.pool)
            .await?;

        Ok(TopicInfo {
            topic: topic.to_string(),
            event_count: event_count as u64,
            consumer_groups,
            dlq_count: dlq_count as u64,
            partitions: None,
        })
    }

    async fn get_dlq_events(
        &self,
        topic: Option<&str>,
        group_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DlqEvent>> {
        if let Some(topic) = topic {
            self.require_topic(topic).await?;
        }

        let statement =
            BrokerStatements::select_dlq(SqlDialect::Sqlite, topic.is_some(), group_id.is_some());
        let mut query = sqlx::query_as::<_, DlqRow>(&statement);
        if let Some(topic) = topic {
            query = query.bind(topic);
        }
        if let Some(group_id) = group_id {
            query = query.bind(group_id);
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;

        rows.into_iter().map(row_to_dlq).collect()
    }

    async fn replay_dlq_event(&self, event_id: EventId, group_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let entry: Option<(String, String, String, DateTime<Utc>)> =
            sqlx::query_as(&self.sql.select_dlq_entry)
                .bind(event_id.to_string())
                .bind(group_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((envelope, topic, _reason, _failed_at)) = entry else {
            return Ok(false);
        };
        let envelope: Envelope = serde_json::from_str(&envelope)?;

        sqlx::query(&self.sql.delete_dlq_entry)
            .bind(event_id.to_string())
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        // Re-enqueue at the topic tail under the same event ID. Groups
        // that already settled the event rely on their inbox ledgers.
        sqlx::query(&self.sql.insert_event)
            .bind(envelope.event_id.to_string())
            .bind(&topic)
            .bind(&envelope.event_type)
            .bind(&envelope.key)
            .bind(serde_json::to_string(&envelope.payload)?)
            .bind(encode_headers(&envelope.headers)?)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn clear_dlq(&self, topic: Option<&str>) -> Result<u64> {
        if let Some(topic) = topic {
            self.require_topic(topic).await?;
        }

        let statement = BrokerStatements::delete_dlq(SqlDialect::Sqlite, topic.is_some());
        let mut query = sqlx::query(&statement);
        if let Some(topic) = topic {
            query = query.bind(topic);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn get_event(&self, event_id: EventId) -> Result<Envelope> {
        let row: Option<(i64, String, String, String, String, String, String, DateTime<Utc>)> =
            sqlx::query_as(&self.sql.select_event)
                .bind(event_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        let Some((id, raw_id, topic, event_type, key, payload, headers, created_at)) = row else {
            return Err(BusError::event_not_found(event_id));
        };
        row_to_envelope(&topic, (id, raw_id, event_type, key, payload, headers, created_at))
    }

    async fn get_consumer_info(&self, group_id: &str, topic: &str) -> Result<ConsumerInfo> {
        let cursor = self.cursor_for(topic, group_id).await?;
        let lag: i64 = sqlx::query_scalar(&self.sql.count_events_after)
            .bind(topic)
            .bind(cursor)
            .fetch_one(&self.pool)
            .await?;

        Ok(ConsumerInfo {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            position: cursor as u64,
            lag: lag as u64,
        })
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.runtime.shutdown().await;
        Ok(())
    }
}
