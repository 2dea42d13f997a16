//! The embedded adapter against an in-memory SQLite database:
//! durable cursors, replay, dead-lettering, and introspection.

use std::{sync::Arc, time::Duration};

use conduit_bus::{adapters::SqliteBus, EventBus, NackReason, ReplayFilter};
use conduit_core::BusError;
use conduit_testing::{sqlite_test_pool, CountingHandler, EnvelopeBuilder};
use futures::StreamExt;
use serde_json::json;

async fn sqlite_bus() -> SqliteBus {
    let pool = sqlite_test_pool().await.expect("test pool");
    SqliteBus::from_pool(pool).await.expect("schema bootstrap")
}

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
async fn publish_attaches_rowid_offset() {
    let bus = sqlite_bus().await;

    let first = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();
    let second = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();

    let (a, b) = (first.offset.unwrap(), second.offset.unwrap());
    assert!(b > a, "offsets must be monotonic, got {a} then {b}");
}

#[tokio::test]
async fn subscriber_consumes_and_cursor_survives_resubscribe() {
    let bus = sqlite_bus().await;
    let first = Arc::new(CountingHandler::new());

    bus.subscribe("orders", "billing", first.clone()).await.unwrap();
    bus.publish(EnvelopeBuilder::topic("orders").payload(json!({"n": 1})).build())
        .await
        .unwrap();
    wait_for(|| first.count() == 1).await;
    bus.unsubscribe("orders", "billing").await.unwrap();

    let parked =
        bus.publish(EnvelopeBuilder::topic("orders").payload(json!({"n": 2})).build())
            .await
            .unwrap();

    let second = Arc::new(CountingHandler::new());
    bus.subscribe("orders", "billing", second.clone()).await.unwrap();
    wait_for(|| second.count() == 1).await;

    assert_eq!(second.received()[0].event_id, parked.event_id);
}

#[tokio::test]
async fn ack_is_monotonic() {
    let bus = sqlite_bus().await;
    bus.subscribe("orders", "billing", Arc::new(CountingHandler::new())).await.unwrap();
    bus.unsubscribe("orders", "billing").await.unwrap();

    let first = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();
    let second = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();

    bus.ack(&second, "billing").await.unwrap();
    // Acking an older offset afterwards must not move the cursor back.
    bus.ack(&first, "billing").await.unwrap();

    let info = bus.get_consumer_info("billing", "orders").await.unwrap();
    assert_eq!(info.position, second.offset.unwrap());
    assert_eq!(info.lag, 0);
}

#[tokio::test]
async fn read_operations_fail_on_unknown_names() {
    let bus = sqlite_bus().await;

    assert!(matches!(
        bus.get_topic_info("ghost").await.unwrap_err(),
        BusError::TopicNotFound { .. }
    ));
    assert!(matches!(
        bus.replay(ReplayFilter::topic("ghost")).await.err().unwrap(),
        BusError::TopicNotFound { .. }
    ));
    assert!(matches!(
        bus.get_event(conduit_core::EventId::new()).await.unwrap_err(),
        BusError::EventNotFound { .. }
    ));

    bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();
    assert!(matches!(
        bus.get_consumer_info("billing", "orders").await.unwrap_err(),
        BusError::ConsumerNotFound { .. }
    ));
}

#[tokio::test]
async fn get_event_round_trips_payload_and_headers() {
    let bus = sqlite_bus().await;
    let published = bus
        .publish(
            EnvelopeBuilder::topic("orders")
                .event_type("order.created")
                .key("acme")
                .header("x-request-id", "req-42")
                .payload(json!({"total": 99.5}))
                .build(),
        )
        .await
        .unwrap();

    let fetched = bus.get_event(published.event_id).await.unwrap();
    assert_eq!(fetched.event_type, "order.created");
    assert_eq!(fetched.key, "acme");
    assert_eq!(fetched.payload, json!({"total": 99.5}));
    assert_eq!(fetched.header("x-request-id"), Some("req-42"));
    assert_eq!(fetched.offset, published.offset);
}

#[tokio::test]
async fn replay_filters_by_key() {
    let bus = sqlite_bus().await;
    for key in ["acme", "globex", "acme"] {
        bus.publish(EnvelopeBuilder::topic("orders").key(key).build()).await.unwrap();
    }

    let stream = bus.replay(ReplayFilter::topic("orders").key("acme")).await.unwrap();
    let keys: Vec<String> = stream.map(|e| e.unwrap().key).collect().await;
    assert_eq!(keys, vec!["acme", "acme"]);
}

#[tokio::test]
async fn dlq_flow_survives_in_storage() {
    let bus = sqlite_bus().await;
    bus.subscribe("orders", "billing", Arc::new(CountingHandler::new())).await.unwrap();
    bus.unsubscribe("orders", "billing").await.unwrap();

    let poisoned = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();
    bus.nack(&poisoned, "billing", NackReason::permanent("schema mismatch")).await.unwrap();

    let entries = bus.get_dlq_events(Some("orders"), Some("billing"), 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, "schema mismatch");
    assert_eq!(entries[0].envelope.event_id, poisoned.event_id);

    // The permanent nack advanced the cursor past the poison event.
    let info = bus.get_consumer_info("billing", "orders").await.unwrap();
    assert_eq!(info.lag, 0);

    let replayed = bus.replay_dlq_event(poisoned.event_id, "billing").await.unwrap();
    assert!(replayed);
    assert_eq!(bus.get_topic_info("orders").await.unwrap().dlq_count, 0);
    assert_eq!(bus.get_topic_info("orders").await.unwrap().event_count, 2);

    // Same event id, fresh tail offset, visible to the group again.
    let info = bus.get_consumer_info("billing", "orders").await.unwrap();
    assert_eq!(info.lag, 1);
}

#[tokio::test]
async fn permanent_nack_settles_under_redelivery() {
    let bus = sqlite_bus().await;
    bus.subscribe("orders", "billing", Arc::new(CountingHandler::new())).await.unwrap();
    bus.unsubscribe("orders", "billing").await.unwrap();

    let poisoned = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();

    // A crash between the DLQ insert and the cursor advance redelivers
    // the event; the repeated nack must settle, not error and wedge.
    bus.nack(&poisoned, "billing", NackReason::permanent("poison")).await.unwrap();
    bus.nack(&poisoned, "billing", NackReason::permanent("poison")).await.unwrap();

    let entries = bus.get_dlq_events(Some("orders"), Some("billing"), 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(bus.get_consumer_info("billing", "orders").await.unwrap().lag, 0);
}

#[tokio::test]
async fn clear_dlq_returns_removed_count() {
    let bus = sqlite_bus().await;
    bus.subscribe("orders", "billing", Arc::new(CountingHandler::new())).await.unwrap();
    bus.unsubscribe("orders", "billing").await.unwrap();

    for _ in 0..2 {
        let e = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();
        bus.nack(&e, "billing", NackReason::permanent("poison")).await.unwrap();
    }

    assert_eq!(bus.clear_dlq(Some("orders")).await.unwrap(), 2);
    assert!(bus.get_dlq_events(Some("orders"), None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_topics_reflects_published_topics() {
    let bus = sqlite_bus().await;
    bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();
    bus.publish(EnvelopeBuilder::topic("payments").build()).await.unwrap();

    let topics = bus.list_topics().await.unwrap();
    assert_eq!(topics, vec!["orders".to_string(), "payments".to_string()]);
}
