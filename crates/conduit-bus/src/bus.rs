//! The abstract bus contract every backend adapter implements.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::{envelope::Envelope, envelope::EventId, error::Result};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lazy, finite stream of historical envelopes produced by
/// [`EventBus::replay`]. Each call re-scans independently and does not
/// consume from the live stream position.
pub type ReplayStream = BoxStream<'static, Result<Envelope>>;

/// Outcome classification a consumer attaches to a negative
/// acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackReason {
    /// The failure may succeed on redelivery; the backend keeps the
    /// event at the group's cursor for the next poll.
    Transient(String),
    /// The failure is terminal; the backend routes the event to the
    /// dead-letter queue and stops redelivery for this group.
    Permanent(String),
}

impl NackReason {
    /// Creates a transient nack.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    /// Creates a permanent nack.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    /// The human-readable reason text.
    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(r) | Self::Permanent(r) => r,
        }
    }
}

/// Failure raised by an [`EventHandler`], classified for retry routing.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Retryable failure; the consumer loop nacks transiently.
    #[error("transient handler failure: {0}")]
    Transient(String),
    /// Terminal failure; the consumer loop nacks permanently, routing
    /// the event to the DLQ.
    #[error("permanent handler failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Creates a transient handler failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent handler failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }
}

/// Asynchronous event handler invoked by the consumer loop.
///
/// Invocation for a given subscription is strictly serialized; the
/// loop awaits the outcome before fetching the next message.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Processes one delivered envelope.
    async fn handle(&self, envelope: &Envelope) -> std::result::Result<(), HandlerError>;
}

/// Filter for [`EventBus::replay`]. All bounds are optional except the
/// topic; unset bounds are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    /// Topic to replay from.
    pub topic: String,
    /// Inclusive lower timestamp bound.
    pub from_timestamp: Option<DateTime<Utc>>,
    /// Inclusive upper timestamp bound.
    pub to_timestamp: Option<DateTime<Utc>>,
    /// Inclusive lower offset bound.
    pub from_offset: Option<u64>,
    /// Inclusive upper offset bound.
    pub to_offset: Option<u64>,
    /// Exact routing-key match.
    pub key_filter: Option<String>,
}

impl ReplayFilter {
    /// Creates an unbounded replay filter for a topic.
    pub fn topic(topic: impl Into<String>) -> Self {
        Self { topic: topic.into(), ..Self::default() }
    }

    /// Restricts the replay to offsets at or above `offset`.
    #[must_use]
    pub fn from_offset(mut self, offset: u64) -> Self {
        self.from_offset = Some(offset);
        self
    }

    /// Restricts the replay to offsets at or below `offset`.
    #[must_use]
    pub fn to_offset(mut self, offset: u64) -> Self {
        self.to_offset = Some(offset);
        self
    }

    /// Restricts the replay to envelopes with exactly this routing key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key_filter = Some(key.into());
        self
    }

    /// Whether an envelope passes every configured bound.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(from) = self.from_timestamp {
            if envelope.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to_timestamp {
            if envelope.timestamp > to {
                return false;
            }
        }
        let offset = envelope.offset.unwrap_or(0);
        if let Some(from) = self.from_offset {
            if offset < from {
                return false;
            }
        }
        if let Some(to) = self.to_offset {
            if offset > to {
                return false;
            }
        }
        if let Some(key) = &self.key_filter {
            if &envelope.key != key {
                return false;
            }
        }
        true
    }
}

/// Introspection summary for one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    /// Topic name.
    pub topic: String,
    /// Number of events held (approximate on some backends).
    pub event_count: u64,
    /// Consumer groups attached to the topic.
    pub consumer_groups: Vec<String>,
    /// Number of dead-lettered events across all groups.
    pub dlq_count: u64,
    /// Partition count, when the backend has partitions.
    pub partitions: Option<u32>,
}

/// Introspection summary for one consumer group on one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerInfo {
    /// Consumer group name.
    pub group_id: String,
    /// Topic the group consumes.
    pub topic: String,
    /// Position of the group's delivery cursor.
    pub position: u64,
    /// Approximate number of events not yet acknowledged.
    pub lag: u64,
}

/// An event parked in the dead-letter queue.
#[derive(Debug, Clone)]
pub struct DlqEvent {
    /// The dead-lettered envelope.
    pub envelope: Envelope,
    /// Consumer group whose processing permanently failed.
    pub group_id: String,
    /// Reason recorded with the permanent nack.
    pub reason: String,
    /// When the event was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

/// The uniform client contract over every backend.
///
/// Read operations fail with [`conduit_core::BusError::TopicNotFound`]
/// or [`conduit_core::BusError::EventNotFound`] rather than returning
/// empty results, so callers can distinguish "nothing there" from "no
/// such topic".
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Publishes an envelope, returning a copy with the backend-assigned
    /// offset attached.
    async fn publish(&self, envelope: Envelope) -> Result<Envelope>;

    /// Registers a handler for `(topic, group_id)` and starts its
    /// consumer loop.
    ///
    /// Fails with [`conduit_core::BusError::Subscription`] if the pair
    /// is already active.
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()>;

    /// Stops and removes the consumer loop for `(topic, group_id)`.
    ///
    /// Fails with [`conduit_core::BusError::ConsumerNotFound`] if no
    /// subscription is active. Cancellation is cooperative: the loop
    /// stops at its next suspension point and the call returns only
    /// after the task has terminated.
    async fn unsubscribe(&self, topic: &str, group_id: &str) -> Result<()>;

    /// Acknowledges a delivered envelope for a consumer group.
    async fn ack(&self, envelope: &Envelope, group_id: &str) -> Result<()>;

    /// Negatively acknowledges a delivered envelope.
    async fn nack(&self, envelope: &Envelope, group_id: &str, reason: NackReason) -> Result<()>;

    /// Replays historical events matching the filter.
    ///
    /// The returned stream is finite and restartable; it does not
    /// consume from any live group's position.
    async fn replay(&self, filter: ReplayFilter) -> Result<ReplayStream>;

    /// Lists all topics known to the backend.
    async fn list_topics(&self) -> Result<Vec<String>>;

    /// Introspects one topic.
    async fn get_topic_info(&self, topic: &str) -> Result<TopicInfo>;

    /// Lists dead-lettered events, optionally filtered by topic and
    /// consumer group.
    async fn get_dlq_events(
        &self,
        topic: Option<&str>,
        group_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DlqEvent>>;

    /// Re-enqueues a dead-lettered event for its consumer group.
    ///
    /// Returns `true` when the event was found and re-enqueued, `false`
    /// when no matching DLQ entry exists.
    async fn replay_dlq_event(&self, event_id: EventId, group_id: &str) -> Result<bool>;

    /// Removes dead-lettered events, optionally scoped to a topic,
    /// returning the number removed.
    async fn clear_dlq(&self, topic: Option<&str>) -> Result<u64>;

    /// Fetches a single event by ID.
    async fn get_event(&self, event_id: EventId) -> Result<Envelope>;

    /// Introspects one consumer group on one topic.
    async fn get_consumer_info(&self, group_id: &str, topic: &str) -> Result<ConsumerInfo>;

    /// Verifies the backend is reachable.
    async fn health_check(&self) -> Result<()>;

    /// Stops every active consumer loop and awaits their termination.
    ///
    /// The subscription registry is emptied, so the same pairs can be
    /// subscribed again afterwards. The backend connection itself stays
    /// usable for publish and introspection.
    async fn shutdown(&self) -> Result<()>;
}

/// Serializes envelope headers for backends that store them as text.
pub(crate) fn encode_headers(headers: &HashMap<String, String>) -> Result<String> {
    Ok(serde_json::to_string(headers)?)
}

/// Deserializes envelope headers stored as text.
pub(crate) fn decode_headers(raw: &str) -> Result<HashMap<String, String>> {
    if raw.is_empty() {
        return Ok(HashMap::new());
    }
    Ok(serde_json::from_str(raw)?)
}
