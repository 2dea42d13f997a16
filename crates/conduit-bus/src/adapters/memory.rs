//! In-process bus adapter.
//!
//! Topic state lives in a `RwLock`-guarded map; nothing survives
//! process exit. Used for tests and throwaway local runs, and as the
//! reference semantics the durable adapters are checked against.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use conduit_core::{envelope::Envelope, envelope::EventId, error::Result, BusError};
use futures::stream;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    bus::{ConsumerInfo, DlqEvent, EventBus, EventHandler, NackReason, ReplayFilter, ReplayStream, TopicInfo},
    runtime::{ConsumerRuntime, ConsumerTransport, RuntimeConfig},
};

/// Configuration for the in-process adapter.
#[derive(Debug, Clone)]
pub struct MemoryBusConfig {
    /// Whether publishing to an unknown topic creates it. When false,
    /// publishes to unknown topics are rejected.
    pub auto_create_topics: bool,
    /// Consumer loop tuning.
    pub runtime: RuntimeConfig,
}

impl Default for MemoryBusConfig {
    fn default() -> Self {
        Self { auto_create_topics: true, runtime: RuntimeConfig::default() }
    }
}

#[derive(Default)]
struct GroupState {
    /// Next offset to deliver. Events below the cursor are settled.
    cursor: u64,
}

#[derive(Default)]
struct TopicState {
    /// The append-only event log; an event's offset is its index.
    events: Vec<Envelope>,
    groups: HashMap<String, GroupState>,
    dlq: Vec<DlqEvent>,
}

/// In-process, non-durable bus.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBus {
    topics: Arc<RwLock<HashMap<String, TopicState>>>,
    runtime: Arc<ConsumerRuntime>,
    auto_create_topics: bool,
}

impl MemoryBus {
    /// Creates an in-process bus with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryBusConfig::default())
    }

    /// Creates an in-process bus with explicit configuration.
    pub fn with_config(config: MemoryBusConfig) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            runtime: Arc::new(ConsumerRuntime::new(config.runtime)),
            auto_create_topics: config.auto_create_topics,
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsumerTransport for MemoryBus {
    async fn poll_batch(&self, topic: &str, group_id: &str, max: usize) -> Result<Vec<Envelope>> {
        let topics = self.topics.read().await;
        let state = topics.get(topic).ok_or_else(|| BusError::topic_not_found(topic))?;
        let group = state
            .groups
            .get(group_id)
            .ok_or_else(|| BusError::consumer_not_found(topic, group_id))?;

        let start = usize::try_from(group.cursor).unwrap_or(usize::MAX).min(state.events.len());
        let end = start.saturating_add(max).min(state.events.len());
        Ok(state.events[start..end].to_vec())
    }

    async fn ack(&self, envelope: &Envelope, group_id: &str) -> Result<()> {
        let offset = envelope
            .offset
            .ok_or_else(|| BusError::backend("cannot ack an envelope without an offset"))?;

        let mut topics = self.topics.write().await;
        let state = topics
            .get_mut(&envelope.topic)
            .ok_or_else(|| BusError::topic_not_found(&envelope.topic))?;
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| BusError::consumer_not_found(&envelope.topic, group_id))?;

        group.cursor = group.cursor.max(offset + 1);
        Ok(())
    }

    async fn nack(&self, envelope: &Envelope, group_id: &str, reason: NackReason) -> Result<()> {
        match reason {
            NackReason::Transient(reason) => {
                // Leave the cursor in place; the next poll redelivers.
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

                let mut topics = self.topics.write().await;
                let state = topics
                    .get_mut(&envelope.topic)
                    .ok_or_else(|| BusError::topic_not_found(&envelope.topic))?;
                let group = state
                    .groups
                    .get_mut(group_id)
                    .ok_or_else(|| BusError::consumer_not_found(&envelope.topic, group_id))?;

                group.cursor = group.cursor.max(offset + 1);
                state.dlq.push(DlqEvent {
                    envelope: envelope.clone(),
                    group_id: group_id.to_string(),
                    reason,
                    failed_at: Utc::now(),
                });
                Ok(())
            },
        }
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, envelope: Envelope) -> Result<Envelope> {
        let mut topics = self.topics.write().await;

        if !self.auto_create_topics && !topics.contains_key(&envelope.topic) {
            return Err(BusError::publish(
                &envelope.topic,
                "topic does not exist and auto-creation is disabled",
            ));
        }

        let state = topics.entry(envelope.topic.clone()).or_default();
        let offset = state.events.len() as u64;
        let published = envelope.with_offset(offset);
        state.events.push(published.clone());

        debug!(topic = %published.topic, event_id = %published.event_id, offset, "event published");
        Ok(published)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        {
            let mut topics = self.topics.write().await;
            let state = topics.entry(topic.to_string()).or_default();
            state.groups.entry(group_id.to_string()).or_default();
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
        let topics = self.topics.read().await;
        let state =
            topics.get(&filter.topic).ok_or_else(|| BusError::topic_not_found(&filter.topic))?;

        let matched: Vec<Result<Envelope>> =
            state.events.iter().filter(|e| filter.matches(e)).cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(matched)))
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        let topics = self.topics.read().await;
        let mut names: Vec<String> = topics.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get_topic_info(&self, topic: &str) -> Result<TopicInfo> {
        let topics = self.topics.read().await;
        let state = topics.get(topic).ok_or_else(|| BusError::topic_not_found(topic))?;

        let mut consumer_groups: Vec<String> = state.groups.keys().cloned().collect();
        consumer_groups.sort();

        Ok(TopicInfo {
            topic: topic.to_string(),
            event_count: state.events.len() as u64,
            consumer_groups,
            dlq_count: state.dlq.len() as u64,
            partitions: None,
        })
    }

    async fn get_dlq_events(
        &self,
        topic: Option<&str>,
        group_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DlqEvent>> {
        let topics = self.topics.read().await;

        if let Some(topic) = topic {
            if !topics.contains_key(topic) {
                return Err(BusError::topic_not_found(topic));
            }
        }

        let mut events: Vec<DlqEvent> = topics
            .iter()
            .filter(|(name, _)| topic.is_none_or(|t| t == name.as_str()))
            .flat_map(|(_, state)| state.dlq.iter())
            .filter(|entry| group_id.is_none_or(|g| g == entry.group_id))
            .cloned()
            .collect();

        events.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        events.truncate(limit);
        Ok(events)
    }

    async fn replay_dlq_event(&self, event_id: EventId, group_id: &str) -> Result<bool> {
        let mut topics = self.topics.write().await;

        for state in topics.values_mut() {
            let Some(position) = state
                .dlq
                .iter()
                .position(|e| e.envelope.event_id == event_id && e.group_id == group_id)
            else {
                continue;
            };

            let entry = state.dlq.remove(position);
            // Re-enqueue at the tail. Other groups that already settled
            // the event rely on their inbox ledgers to no-op.
            let offset = state.events.len() as u64;
            state.events.push(entry.envelope.with_offset(offset));
            return Ok(true);
        }

        Ok(false)
    }

    async fn clear_dlq(&self, topic: Option<&str>) -> Result<u64> {
        let mut topics = self.topics.write().await;

        match topic {
            Some(topic) => {
                let state =
                    topics.get_mut(topic).ok_or_else(|| BusError::topic_not_found(topic))?;
                let cleared = state.dlq.len() as u64;
                state.dlq.clear();
                Ok(cleared)
            },
            None => {
                let mut cleared = 0;
                for state in topics.values_mut() {
                    cleared += state.dlq.len() as u64;
                    state.dlq.clear();
                }
                Ok(cleared)
            },
        }
    }

    async fn get_event(&self, event_id: EventId) -> Result<Envelope> {
        let topics = self.topics.read().await;
        topics
            .values()
            .flat_map(|state| state.events.iter())
            .find(|e| e.event_id == event_id)
            .cloned()
            .ok_or_else(|| BusError::event_not_found(event_id))
    }

    async fn get_consumer_info(&self, group_id: &str, topic: &str) -> Result<ConsumerInfo> {
        let topics = self.topics.read().await;
        let state = topics.get(topic).ok_or_else(|| BusError::topic_not_found(topic))?;
        let group = state
            .groups
            .get(group_id)
            .ok_or_else(|| BusError::consumer_not_found(topic, group_id))?;

        Ok(ConsumerInfo {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            position: group.cursor,
            lag: (state.events.len() as u64).saturating_sub(group.cursor),
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.runtime.shutdown().await;
        Ok(())
    }
}
