//! End-to-end coverage of the in-process adapter: delivery, consumer
//! lifecycle, replay, dead-lettering, and tenancy routing.

use std::{sync::Arc, time::Duration};

use conduit_bus::{
    adapters::{MemoryBus, MemoryBusConfig},
    EventBus, NackReason, ReplayFilter, RuntimeConfig,
};
use conduit_core::{
    BusError, NamespacedStrategy, TenancyStrategy, TenantContext,
};
use conduit_testing::{CountingHandler, EnvelopeBuilder, FailingHandler};
use futures::StreamExt;
use serde_json::json;

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn publish_assigns_sequential_offsets() {
    let bus = MemoryBus::new();

    let first = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();
    let second = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();

    assert_eq!(first.offset, Some(0));
    assert_eq!(second.offset, Some(1));
}

#[tokio::test]
async fn publish_to_unknown_topic_fails_without_auto_create() {
    let bus = MemoryBus::with_config(MemoryBusConfig {
        auto_create_topics: false,
        runtime: RuntimeConfig::default(),
    });

    let err = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap_err();
    assert!(matches!(err, BusError::Publish { .. }));
}

#[tokio::test]
async fn subscriber_receives_published_events_in_order() {
    let bus = MemoryBus::new();
    let handler = Arc::new(CountingHandler::new());

    bus.subscribe("orders", "billing", handler.clone()).await.unwrap();

    for n in 0..3 {
        bus.publish(
            EnvelopeBuilder::topic("orders").payload(json!({"seq": n})).build(),
        )
        .await
        .unwrap();
    }

    wait_for(|| handler.count() == 3).await;
    let offsets: Vec<Option<u64>> =
        handler.received().iter().map(|e| e.offset).collect();
    assert_eq!(offsets, vec![Some(0), Some(1), Some(2)]);
}

#[tokio::test]
async fn second_subscription_for_same_pair_is_rejected() {
    let bus = MemoryBus::new();
    let handler = Arc::new(CountingHandler::new());

    bus.subscribe("orders", "billing", handler.clone()).await.unwrap();
    let err = bus.subscribe("orders", "billing", handler.clone()).await.unwrap_err();
    assert!(matches!(err, BusError::Subscription { .. }));

    // A different group on the same topic is fine.
    bus.subscribe("orders", "audit", handler).await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_every_consumer_loop() {
    let bus = MemoryBus::new();
    let billing = Arc::new(CountingHandler::new());
    let audit = Arc::new(CountingHandler::new());

    bus.subscribe("orders", "billing", billing.clone()).await.unwrap();
    bus.subscribe("orders", "audit", audit.clone()).await.unwrap();
    bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();
    wait_for(|| billing.count() == 1 && audit.count() == 1).await;

    bus.shutdown().await.unwrap();

    // The registry is empty again, so both pairs can resubscribe.
    bus.subscribe("orders", "billing", billing).await.unwrap();
    bus.subscribe("orders", "audit", audit).await.unwrap();
}

#[tokio::test]
async fn resubscribe_after_unsubscribe_succeeds() {
    let bus = MemoryBus::new();
    let handler = Arc::new(CountingHandler::new());

    bus.subscribe("orders", "billing", handler.clone()).await.unwrap();
    bus.unsubscribe("orders", "billing").await.unwrap();
    bus.subscribe("orders", "billing", handler).await.unwrap();
}

#[tokio::test]
async fn unsubscribe_without_subscription_fails() {
    let bus = MemoryBus::new();
    let err = bus.unsubscribe("orders", "billing").await.unwrap_err();
    assert!(matches!(err, BusError::ConsumerNotFound { .. }));
}

#[tokio::test]
async fn group_resumes_from_cursor_after_resubscribe() {
    let bus = MemoryBus::new();
    let first = Arc::new(CountingHandler::new());

    bus.subscribe("orders", "billing", first.clone()).await.unwrap();
    bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();
    wait_for(|| first.count() == 1).await;
    bus.unsubscribe("orders", "billing").await.unwrap();

    // Published while nobody is subscribed; the cursor preserves it.
    bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();

    let second = Arc::new(CountingHandler::new());
    bus.subscribe("orders", "billing", second.clone()).await.unwrap();
    wait_for(|| second.count() == 1).await;

    assert_eq!(second.received()[0].offset, Some(1));
}

#[tokio::test]
async fn read_operations_fail_on_unknown_topic() {
    let bus = MemoryBus::new();

    assert!(matches!(
        bus.get_topic_info("ghost").await.unwrap_err(),
        BusError::TopicNotFound { .. }
    ));
    assert!(matches!(
        bus.replay(ReplayFilter::topic("ghost")).await.err().unwrap(),
        BusError::TopicNotFound { .. }
    ));
    assert!(matches!(
        bus.get_consumer_info("billing", "ghost").await.unwrap_err(),
        BusError::TopicNotFound { .. }
    ));
    assert!(matches!(
        bus.get_event(conduit_core::EventId::new()).await.unwrap_err(),
        BusError::EventNotFound { .. }
    ));
}

#[tokio::test]
async fn replay_honors_offset_and_key_bounds() {
    let bus = MemoryBus::new();
    for n in 0..5 {
        let key = if n % 2 == 0 { "even" } else { "odd" };
        bus.publish(EnvelopeBuilder::topic("orders").key(key).build()).await.unwrap();
    }

    let stream = bus
        .replay(ReplayFilter::topic("orders").from_offset(1).to_offset(3))
        .await
        .unwrap();
    let bounded: Vec<_> = stream.map(|e| e.unwrap().offset.unwrap()).collect().await;
    assert_eq!(bounded, vec![1, 2, 3]);

    let stream = bus.replay(ReplayFilter::topic("orders").key("even")).await.unwrap();
    let keyed: Vec<_> = stream.map(|e| e.unwrap().offset.unwrap()).collect().await;
    assert_eq!(keyed, vec![0, 2, 4]);

    // Replays are restartable: a second scan sees the same events.
    let stream = bus.replay(ReplayFilter::topic("orders").key("even")).await.unwrap();
    assert_eq!(stream.count().await, 3);
}

#[tokio::test]
async fn permanent_failure_routes_to_dlq_and_advances() {
    let bus = MemoryBus::new();
    let failing = Arc::new(FailingHandler::permanent());
    let counting = Arc::new(CountingHandler::new());

    bus.subscribe("orders", "billing", failing).await.unwrap();
    bus.subscribe("orders", "audit", counting.clone()).await.unwrap();

    let published = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();

    wait_for(|| counting.count() == 1).await;

    // The failing group settles asynchronously; wait for its entry.
    let entry = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let entries =
                bus.get_dlq_events(Some("orders"), Some("billing"), 10).await.unwrap();
            if let Some(entry) = entries.first() {
                return entry.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("event never reached the DLQ");
    assert_eq!(entry.envelope.event_id, published.event_id);
    assert_eq!(entry.group_id, "billing");

    // The audit group was unaffected.
    let audit_dlq = bus.get_dlq_events(Some("orders"), Some("audit"), 10).await.unwrap();
    assert!(audit_dlq.is_empty());
}

#[tokio::test]
async fn replay_dlq_event_reenqueues_at_tail() {
    let bus = MemoryBus::new();
    let published = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();

    // Dead-letter it by hand through the nack surface.
    bus.subscribe("orders", "billing", Arc::new(CountingHandler::new())).await.unwrap();
    bus.unsubscribe("orders", "billing").await.unwrap();
    bus.nack(&published, "billing", NackReason::permanent("poison")).await.unwrap();

    assert_eq!(bus.get_topic_info("orders").await.unwrap().dlq_count, 1);

    let replayed = bus.replay_dlq_event(published.event_id, "billing").await.unwrap();
    assert!(replayed);

    // Same event, fresh offset at the tail; the DLQ entry is gone.
    let info = bus.get_topic_info("orders").await.unwrap();
    assert_eq!(info.dlq_count, 0);
    assert_eq!(info.event_count, 2);

    // Replaying the same entry again reports absence, not an error.
    let again = bus.replay_dlq_event(published.event_id, "billing").await.unwrap();
    assert!(!again);
}

#[tokio::test]
async fn clear_dlq_scopes_to_topic() {
    let bus = MemoryBus::new();

    for topic in ["orders", "payments"] {
        let published = bus.publish(EnvelopeBuilder::topic(topic).build()).await.unwrap();
        bus.subscribe(topic, "billing", Arc::new(CountingHandler::new())).await.unwrap();
        bus.unsubscribe(topic, "billing").await.unwrap();
        bus.nack(&published, "billing", NackReason::permanent("poison")).await.unwrap();
    }

    assert_eq!(bus.clear_dlq(Some("orders")).await.unwrap(), 1);
    assert_eq!(bus.get_topic_info("payments").await.unwrap().dlq_count, 1);
    assert_eq!(bus.clear_dlq(None).await.unwrap(), 1);
}

#[tokio::test]
async fn consumer_info_tracks_position_and_lag() {
    let bus = MemoryBus::new();
    let handler = Arc::new(CountingHandler::new());

    bus.subscribe("orders", "billing", handler.clone()).await.unwrap();
    for _ in 0..4 {
        bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();
    }
    wait_for(|| handler.count() == 4).await;

    let info = bus.get_consumer_info("billing", "orders").await.unwrap();
    assert_eq!(info.position, 4);
    assert_eq!(info.lag, 0);
}

#[tokio::test]
async fn namespaced_tenancy_isolates_tenant_streams() {
    let bus = MemoryBus::new();
    let strategy = NamespacedStrategy::default();

    let acme = Arc::new(CountingHandler::new());
    let globex = Arc::new(CountingHandler::new());

    let acme_addr = strategy.resolve("orders", &TenantContext::new("acme"));
    let globex_addr = strategy.resolve("orders", &TenantContext::new("globex"));

    bus.subscribe(&acme_addr.topic, "billing", acme.clone()).await.unwrap();
    bus.subscribe(&globex_addr.topic, "billing", globex.clone()).await.unwrap();

    bus.publish(
        EnvelopeBuilder::topic(&acme_addr.topic).tenant("acme").build(),
    )
    .await
    .unwrap();

    wait_for(|| acme.count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(globex.count(), 0, "other tenant's stream must stay empty");
    assert_eq!(acme.received()[0].tenant(), Some("acme"));
}
