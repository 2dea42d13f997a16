//! Outbox semantics end to end: transactional append, sweep
//! publishing, bounded-time drains, and the retry ladder.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use conduit_bus::{
    adapters::MemoryBus, ConsumerInfo, DlqEvent, EventBus, EventHandler, NackReason,
    ReplayFilter, ReplayStream, TopicInfo,
};
use conduit_core::{BusError, Clock, Envelope, EventId, TestClock};
use conduit_relay::{DrainerConfig, OutboxDrainer, OutboxStatus, OutboxStore, SqliteOutboxStore};
use conduit_testing::{sqlite_test_pool, EnvelopeBuilder};

/// Bus wrapper that misbehaves on publish, for drainer failure paths.
struct ScriptedBus {
    inner: MemoryBus,
    /// When set, every publish fails with a backend error.
    fail_publish: bool,
    /// Wall-clock delay applied before each publish.
    publish_delay: Duration,
}

impl ScriptedBus {
    fn failing() -> Self {
        Self { inner: MemoryBus::new(), fail_publish: true, publish_delay: Duration::ZERO }
    }

    fn slow(delay: Duration) -> Self {
        Self { inner: MemoryBus::new(), fail_publish: false, publish_delay: delay }
    }
}

#[async_trait]
impl EventBus for ScriptedBus {
    async fn publish(&self, envelope: Envelope) -> conduit_core::Result<Envelope> {
        if !self.publish_delay.is_zero() {
            tokio::time::sleep(self.publish_delay).await;
        }
        if self.fail_publish {
            return Err(BusError::backend("broker down"));
        }
        self.inner.publish(envelope).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> conduit_core::Result<()> {
        self.inner.subscribe(topic, group_id, handler).await
    }

    async fn unsubscribe(&self, topic: &str, group_id: &str) -> conduit_core::Result<()> {
        self.inner.unsubscribe(topic, group_id).await
    }

    async fn ack(&self, envelope: &Envelope, group_id: &str) -> conduit_core::Result<()> {
        self.inner.ack(envelope, group_id).await
    }

    async fn nack(
        &self,
        envelope: &Envelope,
        group_id: &str,
        reason: NackReason,
    ) -> conduit_core::Result<()> {
        self.inner.nack(envelope, group_id, reason).await
    }

    async fn replay(&self, filter: ReplayFilter) -> conduit_core::Result<ReplayStream> {
        self.inner.replay(filter).await
    }

    async fn list_topics(&self) -> conduit_core::Result<Vec<String>> {
        self.inner.list_topics().await
    }

    async fn get_topic_info(&self, topic: &str) -> conduit_core::Result<TopicInfo> {
        self.inner.get_topic_info(topic).await
    }

    async fn get_dlq_events(
        &self,
        topic: Option<&str>,
        group_id: Option<&str>,
        limit: usize,
    ) -> conduit_core::Result<Vec<DlqEvent>> {
        self.inner.get_dlq_events(topic, group_id, limit).await
    }

    async fn replay_dlq_event(
        &self,
        event_id: EventId,
        group_id: &str,
    ) -> conduit_core::Result<bool> {
        self.inner.replay_dlq_event(event_id, group_id).await
    }

    async fn clear_dlq(&self, topic: Option<&str>) -> conduit_core::Result<u64> {
        self.inner.clear_dlq(topic).await
    }

    async fn get_event(&self, event_id: EventId) -> conduit_core::Result<Envelope> {
        self.inner.get_event(event_id).await
    }

    async fn get_consumer_info(
        &self,
        group_id: &str,
        topic: &str,
    ) -> conduit_core::Result<ConsumerInfo> {
        self.inner.get_consumer_info(group_id, topic).await
    }

    async fn health_check(&self) -> conduit_core::Result<()> {
        self.inner.health_check().await
    }

    async fn shutdown(&self) -> conduit_core::Result<()> {
        self.inner.shutdown().await
    }
}

async fn outbox_store() -> SqliteOutboxStore {
    let pool = sqlite_test_pool().await.expect("test pool");
    SqliteOutboxStore::new(pool).await.expect("schema bootstrap")
}

async fn append_committed(store: &SqliteOutboxStore, envelope: &Envelope) -> i64 {
    let mut tx = store.pool().begin().await.expect("begin");
    let id = store.append(&mut tx, envelope).await.expect("append");
    tx.commit().await.expect("commit");
    id
}

#[tokio::test]
async fn rollback_leaves_no_outbox_row() {
    let store = outbox_store().await;

    let mut tx = store.pool().begin().await.unwrap();
    store.append(&mut tx, &EnvelopeBuilder::topic("orders").build()).await.unwrap();
    tx.rollback().await.unwrap();

    let claimed = store.claim_due(chrono::Utc::now(), 10).await.unwrap();
    assert!(claimed.is_empty(), "rolled-back intent must leave no trace");

    let report = store.report().await.unwrap();
    assert_eq!(report.pending, 0);
}

#[tokio::test]
async fn committed_append_is_claimable_once() {
    let store = outbox_store().await;
    append_committed(&store, &EnvelopeBuilder::topic("orders").build()).await;

    let claimed = store.claim_due(chrono::Utc::now(), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, OutboxStatus::Publishing);

    // Already claimed; a second sweep sees nothing.
    let again = store.claim_due(chrono::Utc::now(), 10).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn drain_publishes_committed_rows_to_the_bus() {
    let store = outbox_store().await;
    let bus = Arc::new(MemoryBus::new());

    let envelope = EnvelopeBuilder::topic("orders")
        .event_type("order.created")
        .key("acme")
        .build();
    append_committed(&store, &envelope).await;

    let drainer =
        OutboxDrainer::new(Arc::new(store.clone()), bus.clone(), DrainerConfig::default());
    let published = drainer.drain(Duration::from_secs(5)).await.unwrap();
    assert_eq!(published, 1);

    let delivered = bus.get_event(envelope.event_id).await.unwrap();
    assert_eq!(delivered.event_type, "order.created");
    assert_eq!(delivered.key, "acme");

    let report = store.report().await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(report.pending, 0);
}

#[tokio::test]
async fn failed_publish_backs_off_then_goes_terminal() {
    let store = outbox_store().await;
    let bus = Arc::new(ScriptedBus::failing());
    let clock = TestClock::new();

    let config = DrainerConfig {
        max_attempts: 2,
        backoff_base: Duration::from_secs(1),
        ..DrainerConfig::default()
    };
    let drainer = OutboxDrainer::with_clock(
        Arc::new(store.clone()),
        bus,
        config,
        Arc::new(clock.clone()),
    );

    let id = append_committed(&store, &EnvelopeBuilder::topic("orders").build()).await;

    // First sweep fails the row and schedules a retry in the future.
    assert_eq!(drainer.drain(Duration::from_secs(5)).await.unwrap(), 0);
    let report = store.report().await.unwrap();
    assert_eq!(report.pending, 1);

    // The retry is not due yet, so an immediate sweep leaves it alone.
    assert_eq!(drainer.drain(Duration::from_secs(5)).await.unwrap(), 0);
    let due = store.claim_due(clock.now_utc(), 10).await.unwrap();
    assert!(due.is_empty());

    // Past the backoff window the retry runs and exhausts the budget.
    clock.advance(Duration::from_secs(10));
    assert_eq!(drainer.drain(Duration::from_secs(5)).await.unwrap(), 0);

    let report = store.report().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.pending, 0);

    let failed = store.failed_entries(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 2);
    assert!(failed[0].last_error.as_deref().unwrap_or("").contains("broker down"));

    // An operator can requeue the row for another round.
    assert!(store.requeue_failed(id).await.unwrap());
    assert_eq!(store.report().await.unwrap().pending, 1);
    assert!(!store.requeue_failed(9999).await.unwrap());
}

#[tokio::test]
async fn drain_is_bounded_by_its_timeout() {
    let store = outbox_store().await;
    let bus = Arc::new(ScriptedBus::slow(Duration::from_millis(150)));

    for _ in 0..6 {
        append_committed(&store, &EnvelopeBuilder::topic("orders").build()).await;
    }

    let drainer =
        OutboxDrainer::new(Arc::new(store.clone()), bus, DrainerConfig::default());

    let started = Instant::now();
    let published = drainer.drain(Duration::from_millis(250)).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(1), "drain overran its budget: {elapsed:?}");
    assert!(published <= 2, "published more than the budget allows: {published}");

    // Nothing may be left stuck in `publishing` after the sweep.
    let report = store.report().await.unwrap();
    assert_eq!(report.publishing, 0);
    assert_eq!(report.pending + report.published, 6);
}

#[tokio::test]
async fn stranded_claims_are_released_after_the_timeout() {
    let store = outbox_store().await;
    let bus = Arc::new(MemoryBus::new());
    let clock = TestClock::new();

    let config = DrainerConfig {
        stale_claim_timeout: Duration::from_secs(300),
        ..DrainerConfig::default()
    };
    let drainer = OutboxDrainer::with_clock(
        Arc::new(store.clone()),
        bus,
        config,
        Arc::new(clock.clone()),
    );

    // A drainer that claims a row and dies before settling leaves it
    // stuck in `publishing`.
    append_committed(&store, &EnvelopeBuilder::topic("orders").build()).await;
    let claimed = store.claim_due(clock.now_utc(), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    // A fresh claim is off limits to other sweeps.
    assert_eq!(drainer.drain(Duration::from_secs(5)).await.unwrap(), 0);
    assert_eq!(store.report().await.unwrap().publishing, 1);

    // Past the timeout the claim is presumed orphaned, released, and
    // the same sweep publishes it.
    clock.advance(Duration::from_secs(301));
    assert_eq!(drainer.drain(Duration::from_secs(5)).await.unwrap(), 1);

    let report = store.report().await.unwrap();
    assert_eq!(report.publishing, 0);
    assert_eq!(report.published, 1);
}

#[tokio::test]
async fn report_tracks_oldest_pending() {
    let store = outbox_store().await;
    append_committed(&store, &EnvelopeBuilder::topic("orders").build()).await;
    append_committed(&store, &EnvelopeBuilder::topic("payments").build()).await;

    let report = store.report().await.unwrap();
    assert_eq!(report.pending, 2);
    assert!(report.oldest_pending.is_some());
}
