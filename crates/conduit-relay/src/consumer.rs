//! Idempotent consumer wrapper.
//!
//! Composes a user handler with the inbox ledger and retry
//! classification. The inbox is consulted only after the handler
//! succeeds: the handler itself may be what determines success, so the
//! wrapper records completion rather than gating invocation. A `false`
//! from the ledger means a previous delivery already completed the
//! work, which is still a success from the bus's point of view.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use conduit_bus::{EventHandler, HandlerError};
use conduit_core::envelope::{Envelope, EventId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::inbox::InboxStore;

/// Wraps a handler with inbox de-duplication and bounded retries.
///
/// Transient handler failures are passed through (the bus redelivers)
/// until the attempt budget is spent, at which point the failure is
/// escalated to permanent so the event routes to the DLQ instead of
/// being retried forever.
pub struct IdempotentConsumer {
    inner: Arc<dyn EventHandler>,
    inbox: Arc<dyn InboxStore>,
    consumer_group: String,
    max_attempts: u32,
    /// In-flight transient attempt counts, per event. Entries are
    /// dropped on success or escalation.
    attempts: Mutex<HashMap<EventId, u32>>,
}

impl IdempotentConsumer {
    /// Wraps `inner` for the given consumer group.
    pub fn new(
        inner: Arc<dyn EventHandler>,
        inbox: Arc<dyn InboxStore>,
        consumer_group: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            inner,
            inbox,
            consumer_group: consumer_group.into(),
            max_attempts: max_attempts.max(1),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    async fn clear_attempts(&self, event_id: EventId) {
        self.attempts.lock().await.remove(&event_id);
    }
}

#[async_trait]
impl EventHandler for IdempotentConsumer {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match self.inner.handle(envelope).await {
            Ok(()) => {
                let first = self
                    .inbox
                    .mark_processed(envelope.event_id, &self.consumer_group)
                    .await
                    .map_err(|e| HandlerError::transient(e.to_string()))?;
                if !first {
                    debug!(
                        event_id = %envelope.event_id,
                        consumer_group = %self.consumer_group,
                        "redelivery of an already-processed event"
                    );
                }
                self.clear_attempts(envelope.event_id).await;
                Ok(())
            },
            Err(HandlerError::Transient(message)) => {
                let attempt = {
                    let mut attempts = self.attempts.lock().await;
                    let attempt = attempts.entry(envelope.event_id).or_insert(0);
                    *attempt += 1;
                    *attempt
                };

                if attempt >= self.max_attempts {
                    warn!(
                        event_id = %envelope.event_id,
                        consumer_group = %self.consumer_group,
                        attempt,
                        "retry budget exhausted, routing to dead letters"
                    );
                    self.clear_attempts(envelope.event_id).await;
                    return Err(HandlerError::permanent(format!(
                        "failed after {attempt} attempts: {message}"
                    )));
                }

                debug!(
                    event_id = %envelope.event_id,
                    consumer_group = %self.consumer_group,
                    attempt,
                    max_attempts = self.max_attempts,
                    "transient handler failure, awaiting redelivery"
                );
                Err(HandlerError::Transient(message))
            },
            Err(HandlerError::Permanent(message)) => {
                self.clear_attempts(envelope.event_id).await;
                Err(HandlerError::Permanent(message))
            },
        }
    }
}
