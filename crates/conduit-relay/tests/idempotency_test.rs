//! Inbox ledger guarantees and the idempotent consumer wrapper end to
//! end against the in-process bus.

use std::{sync::Arc, time::Duration};

use conduit_bus::{adapters::MemoryBus, EventBus, EventHandler, HandlerError};
use conduit_core::EventId;
use conduit_relay::{IdempotentConsumer, InboxStore, SqliteInboxStore};
use conduit_testing::{sqlite_test_pool, CountingHandler, EnvelopeBuilder, FailingHandler};

async fn inbox_store() -> SqliteInboxStore {
    let pool = sqlite_test_pool().await.expect("test pool");
    SqliteInboxStore::new(pool).await.expect("schema bootstrap")
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
async fn mark_processed_returns_true_exactly_once() {
    let inbox = inbox_store().await;
    let event_id = EventId::new();

    assert!(inbox.mark_processed(event_id, "billing").await.unwrap());
    for _ in 0..3 {
        assert!(!inbox.mark_processed(event_id, "billing").await.unwrap());
    }
    assert!(inbox.is_processed(event_id, "billing").await.unwrap());
}

#[tokio::test]
async fn groups_are_ledgered_independently() {
    let inbox = inbox_store().await;
    let event_id = EventId::new();

    assert!(inbox.mark_processed(event_id, "billing").await.unwrap());
    assert!(inbox.mark_processed(event_id, "audit").await.unwrap());
    assert!(!inbox.is_processed(event_id, "shipping").await.unwrap());
}

#[tokio::test]
async fn purge_removes_rows_before_cutoff() {
    let inbox = inbox_store().await;
    inbox.mark_processed(EventId::new(), "billing").await.unwrap();
    inbox.mark_processed(EventId::new(), "billing").await.unwrap();

    // Nothing is older than a cutoff in the past.
    let past = chrono::Utc::now() - chrono::Duration::hours(1);
    assert_eq!(inbox.purge_older_than(past).await.unwrap(), 0);

    let future = chrono::Utc::now() + chrono::Duration::hours(1);
    assert_eq!(inbox.purge_older_than(future).await.unwrap(), 2);
}

#[tokio::test]
async fn redelivery_still_acks_after_first_completion() {
    let inbox = Arc::new(inbox_store().await);
    let inner = Arc::new(CountingHandler::new());
    let consumer = IdempotentConsumer::new(inner.clone(), inbox.clone(), "billing", 3);

    let envelope = EnvelopeBuilder::topic("orders").build();

    // First delivery processes and records completion.
    consumer.handle(&envelope).await.unwrap();
    assert!(inbox.is_processed(envelope.event_id, "billing").await.unwrap());

    // A redelivery is still an ack, not an error, even though the
    // ledger already holds the pair.
    consumer.handle(&envelope).await.unwrap();
    assert_eq!(inner.count(), 2);
}

#[tokio::test]
async fn transient_failures_recover_within_budget() {
    let bus = MemoryBus::new();
    let inbox = Arc::new(inbox_store().await);
    let inner = Arc::new(FailingHandler::transient_first(2));
    let consumer =
        Arc::new(IdempotentConsumer::new(inner.clone(), inbox.clone(), "billing", 3));

    bus.subscribe("orders", "billing", consumer).await.unwrap();
    let published = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();

    wait_for(|| inner.attempts() >= 3).await;

    // Third delivery succeeded and was ledgered; nothing dead-lettered.
    tokio::time::timeout(Duration::from_secs(2), async {
        while !inbox.is_processed(published.event_id, "billing").await.unwrap() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("event never ledgered");

    assert!(bus.get_dlq_events(Some("orders"), None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_retry_budget_routes_to_dlq() {
    let bus = MemoryBus::new();
    let inbox = Arc::new(inbox_store().await);
    let inner = Arc::new(FailingHandler::transient());
    let consumer =
        Arc::new(IdempotentConsumer::new(inner.clone(), inbox.clone(), "billing", 3));

    bus.subscribe("orders", "billing", consumer).await.unwrap();
    let published = bus.publish(EnvelopeBuilder::topic("orders").build()).await.unwrap();

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

    assert_eq!(inner.attempts(), 3, "budget of 3 means exactly 3 deliveries");
    assert_eq!(entry.envelope.event_id, published.event_id);
    assert!(entry.reason.contains("failed after 3 attempts"));
    assert!(!inbox.is_processed(published.event_id, "billing").await.unwrap());

    // The operator can push it back onto the topic for another try.
    assert!(bus.replay_dlq_event(published.event_id, "billing").await.unwrap());
}

#[tokio::test]
async fn permanent_failure_skips_the_retry_ladder() {
    let inbox = Arc::new(inbox_store().await);
    let inner = Arc::new(FailingHandler::permanent());
    let consumer = IdempotentConsumer::new(inner.clone(), inbox, "billing", 5);

    let envelope = EnvelopeBuilder::topic("orders").build();
    let err = consumer.handle(&envelope).await.unwrap_err();
    assert!(matches!(err, HandlerError::Permanent(_)));
    assert_eq!(inner.attempts(), 1);
}
