//! Canonical event envelope shared by every backend adapter.
//!
//! An [`Envelope`] is created by the publisher and immutable afterward.
//! Backends attach the assigned offset after a successful publish by
//! returning a copy; caller-visible fields are never mutated in place.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header key carrying the tenant identity for shared-topic tenancy.
pub const TENANT_HEADER: &str = "x-conduit-tenant";

/// Strongly-typed event identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. Assigned once at
/// envelope creation and follows the event through outbox, broker, inbox,
/// and DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an event ID from its string form.
    ///
    /// # Errors
    ///
    /// Returns the underlying uuid parse error for malformed input.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Canonical event representation shared by every backend.
///
/// Immutable once created. The `offset` field is `None` until a backend
/// assigns a position during publish; [`Envelope::with_offset`] attaches
/// it to a copy rather than mutating the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier assigned at creation.
    pub event_id: EventId,

    /// Topic name. Logical or physical depending on the tenancy strategy
    /// applied before publish.
    pub topic: String,

    /// String tag describing the payload shape.
    pub event_type: String,

    /// Routing/partition key. May be empty.
    pub key: String,

    /// Opaque structured payload.
    pub payload: serde_json::Value,

    /// Transport headers.
    pub headers: HashMap<String, String>,

    /// Creation time.
    pub timestamp: DateTime<Utc>,

    /// Backend-assigned position, present only after a successful publish.
    pub offset: Option<u64>,
}

impl Envelope {
    /// Creates a new envelope with a fresh event ID and current timestamp.
    pub fn new(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            topic: topic.into(),
            event_type: event_type.into(),
            key: String::new(),
            payload,
            headers: HashMap::new(),
            timestamp: Utc::now(),
            offset: None,
        }
    }

    /// Returns a copy with the routing key set.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Returns a copy with a header added.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns a copy with the backend-assigned offset attached.
    ///
    /// Copy-on-attach: the original envelope is not mutated, so callers
    /// holding the pre-publish value never observe the offset appearing.
    #[must_use]
    pub fn with_offset(&self, offset: u64) -> Self {
        let mut copy = self.clone();
        copy.offset = Some(offset);
        copy
    }

    /// Looks up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Returns the tenant identity carried in the envelope headers, if any.
    ///
    /// Shared-topic tenancy embeds the tenant in [`TENANT_HEADER`] so
    /// consumers can filter without inspecting the payload.
    pub fn tenant(&self) -> Option<&str> {
        self.header(TENANT_HEADER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_attaches_to_a_copy() {
        let envelope = Envelope::new("orders", "order.created", serde_json::json!({"id": 1}));
        assert_eq!(envelope.offset, None);

        let published = envelope.with_offset(42);
        assert_eq!(published.offset, Some(42));
        assert_eq!(envelope.offset, None);
        assert_eq!(published.event_id, envelope.event_id);
    }

    #[test]
    fn headers_round_trip() {
        let envelope = Envelope::new("orders", "order.created", serde_json::Value::Null)
            .with_header(TENANT_HEADER, "acme")
            .with_header("trace-id", "abc123");

        assert_eq!(envelope.tenant(), Some("acme"));
        assert_eq!(envelope.header("trace-id"), Some("abc123"));
        assert_eq!(envelope.header("missing"), None);
    }

    #[test]
    fn event_id_parses_its_display_form() {
        let id = EventId::new();
        let parsed = EventId::parse(&id.to_string()).expect("round trip");
        assert_eq!(parsed, id);
    }
}
