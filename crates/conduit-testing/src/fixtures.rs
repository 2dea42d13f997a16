//! Builders for test envelopes with sensible defaults.

use std::collections::HashMap;

use conduit_core::envelope::{Envelope, EventId, TENANT_HEADER};
use serde_json::{json, Value};

/// Builder for test envelopes.
pub struct EnvelopeBuilder {
    topic: String,
    event_type: String,
    payload: Value,
    key: Option<String>,
    headers: HashMap<String, String>,
    event_id: Option<EventId>,
}

impl EnvelopeBuilder {
    /// Creates a builder for the given topic with a default payload.
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            event_type: "test.event".to_string(),
            payload: json!({"msg": "test"}),
            key: None,
            headers: HashMap::new(),
            event_id: None,
        }
    }

    /// Sets the event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Sets the JSON payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the routing key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Tags the envelope with a tenant identifier.
    #[must_use]
    pub fn tenant(self, tenant_id: impl Into<String>) -> Self {
        self.header(TENANT_HEADER, tenant_id)
    }

    /// Pins the event ID instead of generating one.
    #[must_use]
    pub fn event_id(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    /// Builds the envelope.
    pub fn build(self) -> Envelope {
        let mut envelope = Envelope::new(self.topic, self.event_type, self.payload);
        if let Some(key) = self.key {
            envelope.key = key;
        }
        if let Some(event_id) = self.event_id {
            envelope.event_id = event_id;
        }
        envelope.headers.extend(self.headers);
        envelope
    }
}
