//! Shared subscription registry and consumer-loop lifecycle.
//!
//! Every adapter reuses this runtime so only the wire protocol differs
//! between backends. The loop shape is fixed: poll a batch, dispatch
//! each envelope serially to the handler, translate the outcome into
//! ack/nack, sleep when idle. Cancellation is cooperative and observed
//! at the poll and sleep suspension points.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::{envelope::Envelope, error::Result, BusError, Clock, SystemClock};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventHandler, HandlerError, NackReason};

/// Wire-level operations an adapter contributes to the shared loop.
///
/// `poll_batch` must not advance the group's cursor; the cursor moves
/// only through `ack`/`nack`, which the loop issues after the handler
/// completes. This is what makes redelivery of unacknowledged events
/// work uniformly across backends.
#[async_trait]
pub trait ConsumerTransport: Send + Sync + 'static {
    /// Fetches the next batch of undelivered envelopes for a group.
    async fn poll_batch(&self, topic: &str, group_id: &str, max: usize) -> Result<Vec<Envelope>>;

    /// Acknowledges a delivered envelope.
    async fn ack(&self, envelope: &Envelope, group_id: &str) -> Result<()>;

    /// Negatively acknowledges a delivered envelope.
    async fn nack(&self, envelope: &Envelope, group_id: &str, reason: NackReason) -> Result<()>;
}

/// Tuning for the shared consumer loop.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Idle wait between polls that returned nothing.
    pub poll_interval: Duration,
    /// Maximum envelopes fetched per poll.
    pub batch_size: usize,
    /// Wait after a poll error before retrying, to avoid tight error
    /// loops.
    pub error_backoff: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            batch_size: 16,
            error_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct SubscriptionKey {
    topic: String,
    group_id: String,
}

struct ActiveSubscription {
    token: CancellationToken,
    handle: JoinHandle<()>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

/// Owns the subscription registry and one consumer task per active
/// `(topic, group_id)` pair.
///
/// The registry is guarded by a mutex so subscribe/unsubscribe cannot
/// race with loop housekeeping. At most one task exists per key at any
/// time.
pub struct ConsumerRuntime {
    subscriptions: Mutex<HashMap<SubscriptionKey, ActiveSubscription>>,
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
}

impl ConsumerRuntime {
    /// Creates a runtime with the given tuning.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a runtime with an injected clock for deterministic tests.
    pub fn with_clock(config: RuntimeConfig, clock: Arc<dyn Clock>) -> Self {
        Self { subscriptions: Mutex::new(HashMap::new()), config, clock }
    }

    /// Registers a handler and starts its consumer loop.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Subscription`] if the `(topic, group_id)`
    /// pair already has an active subscription.
    pub async fn subscribe(
        &self,
        transport: Arc<dyn ConsumerTransport>,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let key = SubscriptionKey { topic: topic.to_string(), group_id: group_id.to_string() };

        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&key) {
            return Err(BusError::subscription(topic, group_id, "already subscribed"));
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(consumer_loop(
            transport,
            key.clone(),
            handler,
            self.config.clone(),
            self.clock.clone(),
            token.clone(),
        ));

        subscriptions
            .insert(key, ActiveSubscription { token, handle, created_at: self.clock.now_utc() });

        info!(topic, group_id, "subscription registered, consumer loop started");
        Ok(())
    }

    /// Cancels the consumer loop for a key and awaits its termination.
    ///
    /// The loop's cancellation is swallowed as a normal outcome; callers
    /// never observe it as an error.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConsumerNotFound`] if the key has no active
    /// subscription.
    pub async fn unsubscribe(&self, topic: &str, group_id: &str) -> Result<()> {
        let key = SubscriptionKey { topic: topic.to_string(), group_id: group_id.to_string() };

        let subscription = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions
                .remove(&key)
                .ok_or_else(|| BusError::consumer_not_found(topic, group_id))?
        };

        subscription.token.cancel();
        if let Err(join_error) = subscription.handle.await {
            // Task cancellation is a normal shutdown path, not a failure.
            if !join_error.is_cancelled() {
                warn!(topic, group_id, error = %join_error, "consumer loop ended abnormally");
            }
        }

        info!(topic, group_id, "subscription removed, consumer loop stopped");
        Ok(())
    }

    /// Whether a subscription is currently active for the key.
    pub async fn is_subscribed(&self, topic: &str, group_id: &str) -> bool {
        let key = SubscriptionKey { topic: topic.to_string(), group_id: group_id.to_string() };
        self.subscriptions.lock().await.contains_key(&key)
    }

    /// Cancels every consumer loop and awaits their termination.
    pub async fn shutdown(&self) {
        let drained: Vec<(SubscriptionKey, ActiveSubscription)> =
            self.subscriptions.lock().await.drain().collect();

        for (key, subscription) in drained {
            subscription.token.cancel();
            let _ = subscription.handle.await;
            debug!(topic = %key.topic, group_id = %key.group_id, "consumer loop stopped");
        }
    }
}

/// The shared loop body: poll, dispatch serially, ack/nack, idle.
async fn consumer_loop(
    transport: Arc<dyn ConsumerTransport>,
    key: SubscriptionKey,
    handler: Arc<dyn EventHandler>,
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
) {
    debug!(topic = %key.topic, group_id = %key.group_id, "consumer loop running");

    loop {
        if token.is_cancelled() {
            break;
        }

        let batch = tokio::select! {
            result = transport.poll_batch(&key.topic, &key.group_id, config.batch_size) => result,
            () = token.cancelled() => break,
        };

        let batch = match batch {
            Ok(batch) => batch,
            Err(poll_error) => {
                error!(
                    topic = %key.topic,
                    group_id = %key.group_id,
                    error = %poll_error,
                    "poll failed, backing off"
                );
                tokio::select! {
                    () = clock.sleep(config.error_backoff) => continue,
                    () = token.cancelled() => break,
                }
            },
        };

        if batch.is_empty() {
            tokio::select! {
                () = clock.sleep(config.poll_interval) => {},
                () = token.cancelled() => break,
            }
            continue;
        }

        for envelope in batch {
            if token.is_cancelled() {
                return;
            }
            if !dispatch_one(&*transport, &key, &*handler, &envelope).await {
                // The cursor did not advance; the rest of the batch will
                // be polled again, so dispatching it now would duplicate.
                break;
            }
        }
    }
}

/// Dispatches one envelope and translates the handler outcome into an
/// acknowledgement. Returns whether the group cursor advanced; on a
/// transient nack or a failed acknowledgement it did not, and the
/// remainder of the batch must be re-polled instead of dispatched.
async fn dispatch_one(
    transport: &dyn ConsumerTransport,
    key: &SubscriptionKey,
    handler: &dyn EventHandler,
    envelope: &Envelope,
) -> bool {
    let (outcome, advanced) = match handler.handle(envelope).await {
        Ok(()) => (transport.ack(envelope, &key.group_id).await, true),
        Err(HandlerError::Transient(reason)) => {
            debug!(
                topic = %key.topic,
                group_id = %key.group_id,
                event_id = %envelope.event_id,
                reason = %reason,
                "handler failed transiently, leaving for redelivery"
            );
            (transport.nack(envelope, &key.group_id, NackReason::Transient(reason)).await, false)
        },
        Err(HandlerError::Permanent(reason)) => {
            warn!(
                topic = %key.topic,
                group_id = %key.group_id,
                event_id = %envelope.event_id,
                reason = %reason,
                "handler failed permanently, dead-lettering"
            );
            (transport.nack(envelope, &key.group_id, NackReason::Permanent(reason)).await, true)
        },
    };

    match outcome {
        Ok(()) => advanced,
        Err(ack_error) => {
            error!(
                topic = %key.topic,
                group_id = %key.group_id,
                event_id = %envelope.event_id,
                error = %ack_error,
                "acknowledgement failed"
            );
            false
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport with no backlog; the loop it feeds just idles.
    struct IdleTransport;

    #[async_trait]
    impl ConsumerTransport for IdleTransport {
        async fn poll_batch(
            &self,
            _topic: &str,
            _group_id: &str,
            _max: usize,
        ) -> Result<Vec<Envelope>> {
            Ok(Vec::new())
        }

        async fn ack(&self, _envelope: &Envelope, _group_id: &str) -> Result<()> {
            Ok(())
        }

        async fn nack(
            &self,
            _envelope: &Envelope,
            _group_id: &str,
            _reason: NackReason,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl EventHandler for NoopHandler {
        async fn handle(&self, _envelope: &Envelope) -> std::result::Result<(), HandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_tracks_the_subscription_lifecycle() {
        let runtime = ConsumerRuntime::new(RuntimeConfig::default());
        let transport = Arc::new(IdleTransport);

        assert!(!runtime.is_subscribed("orders", "billing").await);

        runtime
            .subscribe(transport.clone(), "orders", "billing", Arc::new(NoopHandler))
            .await
            .unwrap();
        assert!(runtime.is_subscribed("orders", "billing").await);
        assert!(!runtime.is_subscribed("orders", "audit").await);

        runtime.unsubscribe("orders", "billing").await.unwrap();
        assert!(!runtime.is_subscribed("orders", "billing").await);
    }

    #[tokio::test]
    async fn shutdown_empties_the_registry() {
        let runtime = ConsumerRuntime::new(RuntimeConfig::default());
        let transport = Arc::new(IdleTransport);

        runtime
            .subscribe(transport.clone(), "orders", "billing", Arc::new(NoopHandler))
            .await
            .unwrap();
        runtime.subscribe(transport, "orders", "audit", Arc::new(NoopHandler)).await.unwrap();

        runtime.shutdown().await;

        assert!(!runtime.is_subscribed("orders", "billing").await);
        assert!(!runtime.is_subscribed("orders", "audit").await);
    }
}
