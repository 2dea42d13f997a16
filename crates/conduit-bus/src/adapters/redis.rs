//! Redis Streams adapter.
//!
//! Each topic maps to one stream (`conduit:topic:<name>`) with a side
//! stream per topic for dead letters (`conduit:dlq:<name>`) and a set
//! (`conduit:topics`) as the topic registry. Offsets come from a
//! per-topic counter so entry IDs are `<offset>-0`, which keeps the
//! bus offset a plain integer and makes XACK addressable from it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::{
    envelope::{Envelope, EventId},
    error::Result,
    BusError,
};
use futures::stream;
use redis::{
    aio::MultiplexedConnection,
    streams::{StreamId, StreamReadOptions, StreamReadReply},
    AsyncCommands,
};
use tracing::debug;

use crate::{
    bus::{ConsumerInfo, DlqEvent, EventBus, EventHandler, NackReason, ReplayFilter, ReplayStream, TopicInfo},
    runtime::{ConsumerRuntime, ConsumerTransport, RuntimeConfig},
};

const TOPIC_REGISTRY: &str = "conduit:topics";

/// Configuration for the Redis adapter.
#[derive(Debug, Clone)]
pub struct RedisBusConfig {
    /// Consumer name registered with XREADGROUP. One runtime per
    /// process polls serially, so a single name suffices.
    pub consumer_name: String,
    /// Consumer loop tuning.
    pub runtime: RuntimeConfig,
}

impl Default for RedisBusConfig {
    fn default() -> Self {
        Self { consumer_name: "conduit-runtime".to_string(), runtime: RuntimeConfig::default() }
    }
}

/// Bus backed by Redis Streams.
///
/// Cheap to clone; clones share the connection and consumer runtime.
#[derive(Clone)]
pub struct RedisBus {
    conn: MultiplexedConnection,
    consumer_name: Arc<String>,
    runtime: Arc<ConsumerRuntime>,
}

fn backend_err(e: redis::RedisError) -> BusError {
    BusError::backend(e.to_string())
}

fn topic_stream(topic: &str) -> String {
    format!("conduit:topic:{topic}")
}

fn topic_seq(topic: &str) -> String {
    format!("conduit:seq:{topic}")
}

fn dlq_stream(topic: &str) -> String {
    format!("conduit:dlq:{topic}")
}

fn offset_from_id(id: &str) -> Result<u64> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse().ok())
        .ok_or_else(|| BusError::backend(format!("malformed stream entry id: {id}")))
}

fn entry_to_envelope(entry: &StreamId) -> Result<Envelope> {
    let raw: String = entry
        .get("envelope")
        .ok_or_else(|| BusError::backend("stream entry missing envelope field"))?;
    let envelope: Envelope = serde_json::from_str(&raw)?;
    Ok(envelope.with_offset(offset_from_id(&entry.id)?))
}

fn entry_to_dlq(entry: &StreamId) -> Result<DlqEvent> {
    let raw: String = entry
        .get("envelope")
        .ok_or_else(|| BusError::backend("dead letter entry missing envelope field"))?;
    let group_id: String = entry
        .get("group_id")
        .ok_or_else(|| BusError::backend("dead letter entry missing group_id field"))?;
    let reason: String = entry.get("reason").unwrap_or_default();
    let failed_at: String = entry.get("failed_at").unwrap_or_default();
    let failed_at = DateTime::parse_from_rfc3339(&failed_at)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(DlqEvent { envelope: serde_json::from_str(&raw)?, group_id, reason, failed_at })
}

impl RedisBus {
    /// Connects to a Redis server and wraps the connection.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the URL is malformed or the
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisBusConfig::default()).await
    }

    /// Connects to a Redis server with explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the URL is malformed or the
    /// connection cannot be established.
    pub async fn connect_with_config(url: &str, config: RedisBusConfig) -> Result<Self> {
        let client = redis::Client::open(url).map_err(backend_err)?;
        let conn = client.get_multiplexed_async_connection().await.map_err(backend_err)?;
        Ok(Self::with_config(conn, config))
    }

    /// Wraps an existing connection with explicit configuration.
    pub fn with_config(conn: MultiplexedConnection, config: RedisBusConfig) -> Self {
        Self {
            conn,
            consumer_name: Arc::new(config.consumer_name),
            runtime: Arc::new(ConsumerRuntime::new(config.runtime)),
        }
    }

    async fn require_topic(&self, topic: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let known: bool =
            conn.sismember(TOPIC_REGISTRY, topic).await.map_err(backend_err)?;
        if known {
            Ok(())
        } else {
            Err(BusError::topic_not_found(topic))
        }
    }

    async fn require_group(&self, topic: &str, group_id: &str) -> Result<()> {
        if self.groups_for(topic).await?.iter().any(|g| g == group_id) {
            Ok(())
        } else {
            Err(BusError::consumer_not_found(topic, group_id))
        }
    }

    async fn groups_for(&self, topic: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        // XINFO GROUPS errors when the stream does not exist yet; a
        // registered topic with no stream simply has no groups.
        let reply: std::result::Result<redis::streams::StreamInfoGroupsReply, _> =
            conn.xinfo_groups(topic_stream(topic)).await;
        match reply {
            Ok(reply) => {
                let mut groups: Vec<String> =
                    reply.groups.into_iter().map(|g| g.name).collect();
                groups.sort();
                Ok(groups)
            },
            Err(_) => Ok(Vec::new()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group_id: &str,
        from: &str,
        max: usize,
    ) -> Result<Vec<Envelope>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group_id, self.consumer_name.as_str())
            .count(max);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[from], &options)
            .await
            .map_err(backend_err)?;

        reply
            .keys
            .iter()
            .flat_map(|key| key.ids.iter())
            .map(entry_to_envelope)
            .collect()
    }

    async fn publish_with_offset(&self, envelope: &Envelope) -> Result<u64> {
        let mut conn = self.conn.clone();
        let offset: u64 =
            conn.incr(topic_seq(&envelope.topic), 1u64).await.map_err(backend_err)?;
        let stamped = envelope.with_offset(offset);
        let _: String = conn
            .xadd(
                topic_stream(&envelope.topic),
                format!("{offset}-0"),
                &[("envelope", serde_json::to_string(&stamped)?)],
            )
            .await
            .map_err(backend_err)?;
        Ok(offset)
    }
}

#[async_trait]
impl ConsumerTransport for RedisBus {
    async fn poll_batch(&self, topic: &str, group_id: &str, max: usize) -> Result<Vec<Envelope>> {
        self.require_topic(topic).await?;
        self.require_group(topic, group_id).await?;

        let stream = topic_stream(topic);
        // Pending entries first: a transient nack leaves the entry in
        // the PEL and it has to be redelivered before anything new.
        let pending = self.read_group(&stream, group_id, "0", max).await?;
        if !pending.is_empty() {
            return Ok(pending);
        }
        self.read_group(&stream, group_id, ">", max).await
    }

    async fn ack(&self, envelope: &Envelope, group_id: &str) -> Result<()> {
        let offset = envelope
            .offset
            .ok_or_else(|| BusError::backend("cannot ack an envelope without an offset"))?;
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .xack(topic_stream(&envelope.topic), group_id, &[format!("{offset}-0")])
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn nack(&self, envelope: &Envelope, group_id: &str, reason: NackReason) -> Result<()> {
        match reason {
            NackReason::Transient(reason) => {
                // The entry stays in the group's PEL and the next poll
                // picks it up again.
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

                let mut conn = self.conn.clone();
                let _: String = conn
                    .xadd(
                        dlq_stream(&envelope.topic),
                        "*",
                        &[
                            ("event_id", envelope.event_id.to_string()),
                            ("group_id", group_id.to_string()),
                            ("reason", reason),
                            ("envelope", serde_json::to_string(envelope)?),
                            ("failed_at", Utc::now().to_rfc3339()),
                        ],
                    )
                    .await
                    .map_err(backend_err)?;
                let _: u64 = conn
                    .xack(topic_stream(&envelope.topic), group_id, &[format!("{offset}-0")])
                    .await
                    .map_err(backend_err)?;
                Ok(())
            },
        }
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, envelope: Envelope) -> Result<Envelope> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.sadd(TOPIC_REGISTRY, &envelope.topic).await.map_err(backend_err)?;

        let offset = self.publish_with_offset(&envelope).await?;
        debug!(topic = %envelope.topic, event_id = %envelope.event_id, offset, "event published");
        Ok(envelope.with_offset(offset))
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.sadd(TOPIC_REGISTRY, topic).await.map_err(backend_err)?;

        let created: std::result::Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(topic_stream(topic), group_id, "0").await;
        if let Err(e) = created {
            // BUSYGROUP means the group already exists, which is fine.
            if e.code() != Some("BUSYGROUP") {
                return Err(backend_err(e));
            }
        }

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

        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamRangeReply =
            conn.xrange_all(topic_stream(&filter.topic)).await.map_err(backend_err)?;

        let matched: Vec<Result<Envelope>> = reply
            .ids
            .iter()
            .map(entry_to_envelope)
            .filter(|decoded| decoded.as_ref().map_or(true, |e| filter.matches(e)))
            .collect();
        Ok(Box::pin(stream::iter(matched)))
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut topics: Vec<String> =
            conn.smembers(TOPIC_REGISTRY).await.map_err(backend_err)?;
        topics.sort();
        Ok(topics)
    }

    async fn get_topic_info(&self, topic: &str) -> Result<TopicInfo> {
        self.require_topic(topic).await?;

        let mut conn = self.conn.clone();
        let event_count: u64 = conn.xlen(topic_stream(topic)).await.map_err(backend_err)?;
        let dlq_count: u64 = conn.xlen(dlq_stream(topic)).await.map_err(backend_err)?;
        let consumer_groups = self.groups_for(topic).await?;

        Ok(TopicInfo {
            topic: topic.to_string(),
            event_count,
            consumer_groups,
            dlq_count,
            partitions: None,
        })
    }

    async fn get_dlq_events(
        &self,
        topic: Option<&str>,
        group_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DlqEvent>> {
        let topics = match topic {
            Some(topic) => {
                self.require_topic(topic).await?;
                vec![topic.to_string()]
            },
            None => self.list_topics().await?,
        };

        let mut conn = self.conn.clone();
        let mut events = Vec::new();
        for topic in &topics {
            let reply: redis::streams::StreamRangeReply =
                conn.xrange_all(dlq_stream(topic)).await.map_err(backend_err)?;
            for entry in &reply.ids {
                let event = entry_to_dlq(entry)?;
                if group_id.is_none_or(|g| g == event.group_id) {
                    events.push(event);
                }
            }
        }

        events.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        events.truncate(limit);
        Ok(events)
    }

    async fn replay_dlq_event(&self, event_id: EventId, group_id: &str) -> Result<bool> {
        let wanted = event_id.to_string();
        let mut conn = self.conn.clone();

        for topic in self.list_topics().await? {
            let key = dlq_stream(&topic);
            let reply: redis::streams::StreamRangeReply =
                conn.xrange_all(&key).await.map_err(backend_err)?;

            for entry in &reply.ids {
                let entry_event: Option<String> = entry.get("event_id");
                let entry_group: Option<String> = entry.get("group_id");
                if entry_event.as_deref() != Some(wanted.as_str())
                    || entry_group.as_deref() != Some(group_id)
                {
                    continue;
                }

                let event = entry_to_dlq(entry)?;
                let _: u64 = conn.xdel(&key, &[&entry.id]).await.map_err(backend_err)?;
                // Re-enqueue at the topic tail under the same event ID.
                self.publish_with_offset(&event.envelope).await?;
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn clear_dlq(&self, topic: Option<&str>) -> Result<u64> {
        let topics = match topic {
            Some(topic) => {
                self.require_topic(topic).await?;
                vec![topic.to_string()]
            },
            None => self.list_topics().await?,
        };

        let mut conn = self.conn.clone();
        let mut cleared = 0;
        for topic in &topics {
            let key = dlq_stream(topic);
            let count: u64 = conn.xlen(&key).await.map_err(backend_err)?;
            let _: u64 = conn.del(&key).await.map_err(backend_err)?;
            cleared += count;
        }
        Ok(cleared)
    }

    async fn get_event(&self, event_id: EventId) -> Result<Envelope> {
        let mut conn = self.conn.clone();

        for topic in self.list_topics().await? {
            let reply: redis::streams::StreamRangeReply =
                conn.xrange_all(topic_stream(&topic)).await.map_err(backend_err)?;
            for entry in &reply.ids {
                let envelope = entry_to_envelope(entry)?;
                if envelope.event_id == event_id {
                    return Ok(envelope);
                }
            }
        }

        Err(BusError::event_not_found(event_id))
    }

    async fn get_consumer_info(&self, group_id: &str, topic: &str) -> Result<ConsumerInfo> {
        self.require_topic(topic).await?;

        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamInfoGroupsReply =
            conn.xinfo_groups(topic_stream(topic)).await.map_err(|_| {
                BusError::consumer_not_found(topic, group_id)
            })?;
        let group = reply
            .groups
            .into_iter()
            .find(|g| g.name == group_id)
            .ok_or_else(|| BusError::consumer_not_found(topic, group_id))?;

        let position = offset_from_id(&group.last_delivered_id).unwrap_or(0);
        let undelivered: redis::streams::StreamRangeReply = conn
            .xrange(topic_stream(topic), format!("({}", group.last_delivered_id), "+")
            .await
            .map_err(backend_err)?;

        Ok(ConsumerInfo {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            position,
            lag: undelivered.ids.len() as u64 + group.pending as u64,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(backend_err)?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.runtime.shutdown().await;
        Ok(())
    }
}
