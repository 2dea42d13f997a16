//! Error taxonomy for the event substrate.
//!
//! Typed failures surfaced to callers so "nothing there" can be
//! distinguished from "no such topic". Read operations on the bus fail
//! with the not-found variants rather than returning empty results.

use thiserror::Error;

use crate::envelope::EventId;

/// Result type alias using [`BusError`].
pub type Result<T> = std::result::Result<T, BusError>;

/// Error type shared by the bus contract and its adapters.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// Referenced topic does not exist on the backend.
    #[error("topic not found: {topic}")]
    TopicNotFound {
        /// The topic that was looked up.
        topic: String,
    },

    /// No consumer group registered for the (topic, group) pair.
    #[error("consumer {group_id} not found on topic {topic}")]
    ConsumerNotFound {
        /// Topic the lookup was scoped to.
        topic: String,
        /// Consumer group that was looked up.
        group_id: String,
    },

    /// Referenced event does not exist.
    #[error("event not found: {event_id}")]
    EventNotFound {
        /// The event ID that was looked up.
        event_id: EventId,
    },

    /// Backend rejected a publish.
    #[error("publish to {topic} rejected: {message}")]
    Publish {
        /// Topic the publish targeted.
        topic: String,
        /// Backend-provided rejection detail.
        message: String,
    },

    /// Subscription could not be established, typically because the
    /// (topic, group) pair is already active.
    #[error("subscription for {group_id} on {topic} failed: {message}")]
    Subscription {
        /// Topic of the attempted subscription.
        topic: String,
        /// Consumer group of the attempted subscription.
        group_id: String,
        /// Failure detail.
        message: String,
    },

    /// Storage-level failure beneath an adapter or ledger.
    #[error("database error: {0}")]
    Database(String),

    /// Payload or header encoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Wire-level backend failure that is not a typed rejection.
    #[error("backend error: {0}")]
    Backend(String),
}

impl BusError {
    /// Creates a topic-not-found error.
    pub fn topic_not_found(topic: impl Into<String>) -> Self {
        Self::TopicNotFound { topic: topic.into() }
    }

    /// Creates a consumer-not-found error.
    pub fn consumer_not_found(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self::ConsumerNotFound { topic: topic.into(), group_id: group_id.into() }
    }

    /// Creates an event-not-found error.
    pub fn event_not_found(event_id: EventId) -> Self {
        Self::EventNotFound { event_id }
    }

    /// Creates a publish rejection.
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish { topic: topic.into(), message: message.into() }
    }

    /// Creates a subscription failure.
    pub fn subscription(
        topic: impl Into<String>,
        group_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Subscription {
            topic: topic.into(),
            group_id: group_id.into(),
            message: message.into(),
        }
    }

    /// Creates a backend failure from any displayable source.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Whether the failure is worth retrying at a later sweep.
    ///
    /// Typed rejections (unknown topic, duplicate subscription) are
    /// deterministic and will not succeed on retry; storage and wire
    /// failures may.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Backend(_) | Self::Publish { .. })
    }
}

impl From<sqlx::Error> for BusError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::Database("requested row not found".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_rejections_are_not_retryable() {
        assert!(!BusError::topic_not_found("orders").is_retryable());
        assert!(!BusError::subscription("orders", "billing", "already active").is_retryable());
        assert!(BusError::Database("connection reset".into()).is_retryable());
        assert!(BusError::publish("orders", "broker unavailable").is_retryable());
    }

    #[test]
    fn display_carries_identifiers() {
        let err = BusError::consumer_not_found("orders", "billing");
        let text = err.to_string();
        assert!(text.contains("orders"));
        assert!(text.contains("billing"));
    }
}
