//! Apache Kafka adapter.
//!
//! Requires librdkafka at build time, so the whole module sits behind
//! the `kafka` cargo feature. Envelopes travel as JSON payloads; the
//! Kafka partition rides along in a header so acknowledgements can
//! address the right partition. Dead letters go to a `<topic>.dlq`
//! companion topic.
//!
//! Kafka has no server-side consumer-group registry this adapter can
//! cheaply enumerate, and DLQ topics are append-only. Group listings
//! and DLQ replay tombstones are therefore process-local views.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::{
    envelope::{Envelope, EventId},
    error::Result,
    BusError,
};
use futures::stream;
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{Header, Headers, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer},
    ClientConfig, Message, Offset, TopicPartitionList,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    bus::{ConsumerInfo, DlqEvent, EventBus, EventHandler, NackReason, ReplayFilter, ReplayStream, TopicInfo},
    runtime::{ConsumerRuntime, ConsumerTransport, RuntimeConfig},
};

const PARTITION_HEADER: &str = "x-conduit-partition";
const DLQ_SUFFIX: &str = ".dlq";

/// Configuration for the Kafka adapter.
#[derive(Debug, Clone)]
pub struct KafkaBusConfig {
    /// `bootstrap.servers` list.
    pub brokers: String,
    /// `client.id` reported to the cluster.
    pub client_id: String,
    /// Total time one poll spends waiting on the broker.
    pub poll_budget: Duration,
    /// Upper bound on metadata and replay fetches.
    pub operation_timeout: Duration,
    /// Consumer loop tuning.
    pub runtime: RuntimeConfig,
}

impl Default for KafkaBusConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "conduit".to_string(),
            poll_budget: Duration::from_millis(250),
            operation_timeout: Duration::from_secs(10),
            runtime: RuntimeConfig::default(),
        }
    }
}

struct KafkaState {
    config: KafkaBusConfig,
    producer: FutureProducer,
    /// One consumer per (topic, group), created lazily on subscribe.
    consumers: Mutex<HashMap<(String, String), Arc<StreamConsumer>>>,
    /// Groups this process has subscribed, per topic.
    known_groups: Mutex<HashMap<String, HashSet<String>>>,
    /// Dead letters this process replayed; DLQ topics are append-only,
    /// so listings filter these out.
    replayed: Mutex<HashSet<(String, String)>>,
}

/// Bus backed by an Apache Kafka cluster.
///
/// Cheap to clone; clones share producers and consumers.
#[derive(Clone)]
pub struct KafkaBus {
    inner: Arc<KafkaState>,
    runtime: Arc<ConsumerRuntime>,
}

fn kafka_err(e: rdkafka::error::KafkaError) -> BusError {
    BusError::backend(e.to_string())
}

fn dlq_topic(topic: &str) -> String {
    format!("{topic}{DLQ_SUFFIX}")
}

fn is_dlq_topic(topic: &str) -> bool {
    topic.ends_with(DLQ_SUFFIX)
}

fn header_value<H: Headers>(headers: Option<&H>, wanted: &str) -> Option<String> {
    let headers = headers?;
    for header in headers.iter() {
        if header.key == wanted {
            return header.value.map(|v| String::from_utf8_lossy(v).into_owned());
        }
    }
    None
}

fn message_to_envelope(message: &impl Message) -> Result<Envelope> {
    let payload = message
        .payload()
        .ok_or_else(|| BusError::backend("kafka message without a payload"))?;
    let envelope: Envelope = serde_json::from_slice(payload)
        .map_err(|e| BusError::Serialization(e.to_string()))?;
    Ok(envelope
        .with_header(PARTITION_HEADER, message.partition().to_string())
        .with_offset(message.offset() as u64))
}

fn envelope_partition(envelope: &Envelope) -> Result<i32> {
    envelope
        .header(PARTITION_HEADER)
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| BusError::backend("envelope is missing its kafka partition header"))
}

impl KafkaBus {
    /// Connects a producer to the cluster.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the producer cannot be created.
    pub fn new(config: KafkaBusConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .create()
            .map_err(kafka_err)?;

        let runtime = Arc::new(ConsumerRuntime::new(config.runtime.clone()));
        Ok(Self {
            inner: Arc::new(KafkaState {
                config,
                producer,
                consumers: Mutex::new(HashMap::new()),
                known_groups: Mutex::new(HashMap::new()),
                replayed: Mutex::new(HashSet::new()),
            }),
            runtime,
        })
    }

    fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.inner.config.brokers)
            .set("client.id", &self.inner.config.client_id)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");
        config
    }

    async fn consumer_for(&self, topic: &str, group_id: &str) -> Result<Arc<StreamConsumer>> {
        let mut consumers = self.inner.consumers.lock().await;
        if let Some(consumer) = consumers.get(&(topic.to_string(), group_id.to_string())) {
            return Ok(Arc::clone(consumer));
        }

        let consumer: StreamConsumer = self.consumer_config(group_id).create().map_err(kafka_err)?;
        consumer.subscribe(&[topic]).map_err(kafka_err)?;
        let consumer = Arc::new(consumer);
        consumers.insert((topic.to_string(), group_id.to_string()), Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn existing_consumer(&self, topic: &str, group_id: &str) -> Result<Arc<StreamConsumer>> {
        let consumers = self.inner.consumers.lock().await;
        consumers
            .get(&(topic.to_string(), group_id.to_string()))
            .cloned()
            .ok_or_else(|| BusError::consumer_not_found(topic, group_id))
    }

    fn partitions_of(&self, topic: &str) -> Result<Vec<i32>> {
        let metadata = self
            .inner
            .producer
            .client()
            .fetch_metadata(Some(topic), self.inner.config.operation_timeout)
            .map_err(kafka_err)?;
        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| BusError::topic_not_found(topic))?;
        if topic_metadata.partitions().is_empty() {
            return Err(BusError::topic_not_found(topic));
        }
        Ok(topic_metadata.partitions().iter().map(|p| p.id()).collect())
    }

    fn count_messages(&self, topic: &str) -> Result<u64> {
        let mut total = 0;
        for partition in self.partitions_of(topic)? {
            let (low, high) = self
                .inner
                .producer
                .client()
                .fetch_watermarks(topic, partition, self.inner.config.operation_timeout)
                .map_err(kafka_err)?;
            total += (high - low).max(0) as u64;
        }
        Ok(total)
    }

    /// Reads every current message of a topic with a throwaway group.
    async fn scan_topic(&self, topic: &str) -> Result<Vec<rdkafka::message::OwnedMessage>> {
        let partitions = self.partitions_of(topic)?;
        let mut remaining = 0u64;
        let mut assignment = TopicPartitionList::new();
        for partition in &partitions {
            let (low, high) = self
                .inner
                .producer
                .client()
                .fetch_watermarks(topic, *partition, self.inner.config.operation_timeout)
                .map_err(kafka_err)?;
            remaining += (high - low).max(0) as u64;
            assignment
                .add_partition_offset(topic, *partition, Offset::Beginning)
                .map_err(kafka_err)?;
        }
        if remaining == 0 {
            return Ok(Vec::new());
        }

        let scan_group = format!("conduit-scan-{}", uuid::Uuid::new_v4());
        let consumer: StreamConsumer =
            self.consumer_config(&scan_group).create().map_err(kafka_err)?;
        consumer.assign(&assignment).map_err(kafka_err)?;

        let mut messages = Vec::with_capacity(remaining as usize);
        let deadline = tokio::time::Instant::now() + self.inner.config.operation_timeout;
        while (messages.len() as u64) < remaining {
            let message =
                match tokio::time::timeout_at(deadline, consumer.recv()).await {
                    Ok(received) => received.map_err(kafka_err)?,
                    Err(_) => break,
                };
            messages.push(message.detach());
        }
        Ok(messages)
    }

    async fn dlq_entries(&self, topic: &str) -> Result<Vec<DlqEvent>> {
        let dlq = dlq_topic(topic);
        if self.partitions_of(&dlq).is_err() {
            // No dead letters produced for this topic yet.
            return Ok(Vec::new());
        }

        let replayed = self.inner.replayed.lock().await.clone();
        let mut entries = Vec::new();
        for message in self.scan_topic(&dlq).await? {
            let envelope = message_to_envelope(&message)?;
            let group_id = header_value(message.headers(), "group_id").unwrap_or_default();
            if replayed.contains(&(envelope.event_id.to_string(), group_id.clone())) {
                continue;
            }
            let reason = header_value(message.headers(), "reason").unwrap_or_default();
            let failed_at = header_value(message.headers(), "failed_at")
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map_or_else(Utc::now, |t| t.with_timezone(&Utc));
            entries.push(DlqEvent { envelope, group_id, reason, failed_at });
        }
        Ok(entries)
    }

    async fn produce(
        &self,
        topic: &str,
        envelope: &Envelope,
        extra_headers: &[(&str, String)],
    ) -> Result<(i32, i64)> {
        let payload = serde_json::to_string(envelope)?;
        let mut headers = OwnedHeaders::new().insert(Header {
            key: "event_id",
            value: Some(&envelope.event_id.to_string()),
        });
        for (key, value) in extra_headers {
            headers = headers.insert(Header { key: *key, value: Some(value.as_str()) });
        }

        let record = FutureRecord::to(topic)
            .key(&envelope.key)
            .payload(&payload)
            .headers(headers);
        self.inner
            .producer
            .send(record, self.inner.config.operation_timeout)
            .await
            .map_err(|(e, _)| BusError::publish(topic, e.to_string()))
    }
}

#[async_trait]
impl ConsumerTransport for KafkaBus {
    async fn poll_batch(&self, topic: &str, group_id: &str, max: usize) -> Result<Vec<Envelope>> {
        let consumer = self.existing_consumer(topic, group_id).await?;

        let mut batch = Vec::new();
        let deadline = tokio::time::Instant::now() + self.inner.config.poll_budget;
        while batch.len() < max {
            let message = match tokio::time::timeout_at(deadline, consumer.recv()).await {
                Ok(received) => received.map_err(kafka_err)?,
                Err(_) => break,
            };
            batch.push(message_to_envelope(&message)?);
        }
        Ok(batch)
    }

    async fn ack(&self, envelope: &Envelope, group_id: &str) -> Result<()> {
        let offset = envelope
            .offset
            .ok_or_else(|| BusError::backend("cannot ack an envelope without an offset"))?;
        let partition = envelope_partition(envelope)?;
        let consumer = self.existing_consumer(&envelope.topic, group_id).await?;

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&envelope.topic, partition, Offset::Offset(offset as i64 + 1))
            .map_err(kafka_err)?;
        consumer.commit(&offsets, CommitMode::Async).map_err(kafka_err)?;
        Ok(())
    }

    async fn nack(&self, envelope: &Envelope, group_id: &str, reason: NackReason) -> Result<()> {
        let offset = envelope
            .offset
            .ok_or_else(|| BusError::backend("cannot nack an envelope without an offset"))?;
        let partition = envelope_partition(envelope)?;
        let consumer = self.existing_consumer(&envelope.topic, group_id).await?;

        match reason {
            NackReason::Transient(reason) => {
                // Rewind so the next poll sees the same message again.
                consumer
                    .seek(
                        &envelope.topic,
                        partition,
                        Offset::Offset(offset as i64),
                        self.inner.config.operation_timeout,
                    )
                    .map_err(kafka_err)?;
                debug!(
                    topic = %envelope.topic,
                    group_id,
                    event_id = %envelope.event_id,
                    reason = %reason,
                    "transient nack, rewound for redelivery"
                );
                Ok(())
            },
            NackReason::Permanent(reason) => {
                self.produce(
                    &dlq_topic(&envelope.topic),
                    envelope,
                    &[
                        ("group_id", group_id.to_string()),
                        ("reason", reason),
                        ("failed_at", Utc::now().to_rfc3339()),
                    ],
                )
                .await?;

                let mut offsets = TopicPartitionList::new();
                offsets
                    .add_partition_offset(
                        &envelope.topic,
                        partition,
                        Offset::Offset(offset as i64 + 1),
                    )
                    .map_err(kafka_err)?;
                consumer.commit(&offsets, CommitMode::Async).map_err(kafka_err)?;
                Ok(())
            },
        }
    }
}

#[async_trait]
impl EventBus for KafkaBus {
    async fn publish(&self, envelope: Envelope) -> Result<Envelope> {
        let (partition, offset) = self.produce(&envelope.topic, &envelope, &[]).await?;
        debug!(
            topic = %envelope.topic,
            event_id = %envelope.event_id,
            partition,
            offset,
            "event published"
        );
        Ok(envelope
            .with_header(PARTITION_HEADER, partition.to_string())
            .with_offset(offset as u64))
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        self.consumer_for(topic, group_id).await?;
        {
            let mut known = self.inner.known_groups.lock().await;
            known.entry(topic.to_string()).or_default().insert(group_id.to_string());
        }
        self.runtime.subscribe(Arc::new(self.clone()), topic, group_id, handler).await
    }

    async fn unsubscribe(&self, topic: &str, group_id: &str) -> Result<()> {
        self.runtime.unsubscribe(topic, group_id).await?;
        let mut consumers = self.inner.consumers.lock().await;
        consumers.remove(&(topic.to_string(), group_id.to_string()));
        Ok(())
    }

    async fn ack(&self, envelope: &Envelope, group_id: &str) -> Result<()> {
        ConsumerTransport::ack(self, envelope, group_id).await
    }

    async fn nack(&self, envelope: &Envelope, group_id: &str, reason: NackReason) -> Result<()> {
        ConsumerTransport::nack(self, envelope, group_id, reason).await
    }

    async fn replay(&self, filter: ReplayFilter) -> Result<ReplayStream> {
        self.partitions_of(&filter.topic)?;

        let mut matched = Vec::new();
        for message in self.scan_topic(&filter.topic).await? {
            let envelope = message_to_envelope(&message)?;
            if filter.matches(&envelope) {
                matched.push(Ok(envelope));
            }
        }
        matched.sort_by_key(|e| e.as_ref().map(|e| e.offset).unwrap_or_default());
        Ok(Box::pin(stream::iter(matched)))
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        let metadata = self
            .inner
            .producer
            .client()
            .fetch_metadata(None, self.inner.config.operation_timeout)
            .map_err(kafka_err)?;
        let mut topics: Vec<String> = metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .filter(|name| !name.starts_with("__") && !is_dlq_topic(name))
            .collect();
        topics.sort();
        Ok(topics)
    }

    async fn get_topic_info(&self, topic: &str) -> Result<TopicInfo> {
        let partitions = self.partitions_of(topic)?;
        let event_count = self.count_messages(topic)?;
        let dlq_count = self.count_messages(&dlq_topic(topic)).unwrap_or(0);

        let known = self.inner.known_groups.lock().await;
        let mut consumer_groups: Vec<String> =
            known.get(topic).map(|groups| groups.iter().cloned().collect()).unwrap_or_default();
        consumer_groups.sort();

        Ok(TopicInfo {
            topic: topic.to_string(),
            event_count,
            consumer_groups,
            dlq_count,
            partitions: Some(partitions.len() as u32),
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
                self.partitions_of(topic)?;
                vec![topic.to_string()]
            },
            None => self.list_topics().await?,
        };

        let mut events = Vec::new();
        for topic in &topics {
            for event in self.dlq_entries(topic).await? {
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
        for topic in self.list_topics().await? {
            let Some(entry) = self
                .dlq_entries(&topic)
                .await?
                .into_iter()
                .find(|e| e.envelope.event_id == event_id && e.group_id == group_id)
            else {
                continue;
            };

            // DLQ topics are append-only; record the replay so the
            // entry stops showing up in listings.
            self.inner
                .replayed
                .lock()
                .await
                .insert((event_id.to_string(), group_id.to_string()));

            let mut envelope = entry.envelope;
            envelope.headers.remove(PARTITION_HEADER);
            envelope.offset = None;
            self.produce(&topic, &envelope, &[]).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn clear_dlq(&self, topic: Option<&str>) -> Result<u64> {
        let topics = match topic {
            Some(topic) => {
                self.partitions_of(topic)?;
                vec![topic.to_string()]
            },
            None => self.list_topics().await?,
        };

        let mut entries = Vec::new();
        for topic in &topics {
            entries.extend(self.dlq_entries(topic).await?);
        }

        let cleared = entries.len() as u64;
        let mut replayed = self.inner.replayed.lock().await;
        for entry in entries {
            replayed.insert((entry.envelope.event_id.to_string(), entry.group_id));
        }
        Ok(cleared)
    }

    async fn get_event(&self, event_id: EventId) -> Result<Envelope> {
        for topic in self.list_topics().await? {
            for message in self.scan_topic(&topic).await? {
                let envelope = message_to_envelope(&message)?;
                if envelope.event_id == event_id {
                    return Ok(envelope);
                }
            }
        }
        Err(BusError::event_not_found(event_id))
    }

    async fn get_consumer_info(&self, group_id: &str, topic: &str) -> Result<ConsumerInfo> {
        let consumer = self.existing_consumer(topic, group_id).await?;
        let committed = consumer
            .committed(self.inner.config.operation_timeout)
            .map_err(kafka_err)?;

        let mut position = 0u64;
        let mut lag = 0u64;
        for partition in self.partitions_of(topic)? {
            let offset = committed
                .find_partition(topic, partition)
                .map(|p| p.offset())
                .unwrap_or(Offset::Invalid);
            let committed_offset = match offset {
                Offset::Offset(o) => o,
                _ => 0,
            };
            let (low, high) = self
                .inner
                .producer
                .client()
                .fetch_watermarks(topic, partition, self.inner.config.operation_timeout)
                .map_err(kafka_err)?;
            position += committed_offset.max(0) as u64;
            lag += (high - committed_offset.max(low)).max(0) as u64;
        }

        Ok(ConsumerInfo { group_id: group_id.to_string(), topic: topic.to_string(), position, lag })
    }

    async fn health_check(&self) -> Result<()> {
        self.inner
            .producer
            .client()
            .fetch_metadata(None, self.inner.config.operation_timeout)
            .map(|_| ())
            .map_err(kafka_err)
    }

    async fn shutdown(&self) -> Result<()> {
        self.runtime.shutdown().await;
        self.inner.consumers.lock().await.clear();
        Ok(())
    }
}
