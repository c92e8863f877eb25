mod common;

use futures::StreamExt;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tickets_core::prelude::*;
use tickets_pg::{PgBroker, PgOutbox};
use tokio::time::timeout;

fn envelope(body: &str) -> Envelope {
    Envelope::builder()
        .payload(body)
        .metadata("name", "TestEvent_v1")
        .build()
        .expect("Failed to build envelope")
}

#[tokio::test]
#[serial]
async fn committed_records_are_fetched_in_order() {
    let pool = common::setup().await;
    let outbox = PgOutbox::new(pool.clone());

    let first = envelope(r#"{"n":1}"#);
    let second = envelope(r#"{"n":2}"#);
    let mut tx = outbox.begin().await.expect("Failed to begin");
    outbox.append(&mut tx, "events", &first).await.expect("Failed to append");
    outbox.append(&mut tx, "events", &second).await.expect("Failed to append");
    tx.commit().await.expect("Failed to commit");

    let records = outbox.fetch_unforwarded(10).await.expect("Failed to fetch");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].envelope.id(), first.id());
    assert_eq!(records[1].envelope.id(), second.id());
    assert_eq!(records[0].envelope.payload(), first.payload());
    assert_eq!(records[0].envelope.event_name(), Some("TestEvent_v1"));
    assert_eq!(records[0].topic, "events");

    let sequences: Vec<i64> = records.iter().map(|r| r.sequence).collect();
    outbox.mark_forwarded(&sequences).await.expect("Failed to mark");
    outbox.mark_forwarded(&sequences).await.expect("Marking twice is a no-op");
    assert!(outbox.fetch_unforwarded(10).await.expect("Failed to fetch").is_empty());

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn oversized_batch_is_capped_not_wrapped() {
    let pool = common::setup().await;
    let outbox = PgOutbox::new(pool.clone());

    let sent = envelope(r#"{"n":1}"#);
    let mut tx = outbox.begin().await.expect("Failed to begin");
    outbox.append(&mut tx, "events", &sent).await.expect("Failed to append");
    tx.commit().await.expect("Failed to commit");

    let records = outbox
        .fetch_unforwarded(usize::MAX)
        .await
        .expect("Failed to fetch");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].envelope.id(), sent.id());

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn rolled_back_records_are_never_fetched() {
    let pool = common::setup().await;
    let outbox = PgOutbox::new(pool.clone());

    let mut tx = outbox.begin().await.expect("Failed to begin");
    outbox
        .append(&mut tx, "events", &envelope("{}"))
        .await
        .expect("Failed to append");
    tx.rollback().await.expect("Failed to roll back");

    assert!(outbox.fetch_unforwarded(10).await.expect("Failed to fetch").is_empty());

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn business_writes_share_the_outbox_transaction() {
    let pool = common::setup().await;
    let outbox = PgOutbox::new(pool.clone());

    let mut tx = outbox.begin().await.expect("Failed to begin");
    sqlx::query("INSERT INTO tickets_processed_messages (handler_name, message_id) VALUES ($1, $2)")
        .bind("Business")
        .bind(uuid::Uuid::new_v4())
        .execute(&mut **tx)
        .await
        .expect("Failed to write business row");
    outbox
        .append(&mut tx, "events", &envelope("{}"))
        .await
        .expect("Failed to append");
    tx.rollback().await.expect("Failed to roll back");

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tickets_processed_messages")
        .fetch_one(&pool)
        .await
        .expect("Failed to count");
    assert_eq!(count, 0, "Business write should roll back with the outbox");
    assert!(outbox.fetch_unforwarded(10).await.expect("Failed to fetch").is_empty());

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn later_commit_waits_for_older_open_transaction() {
    let pool = common::setup().await;
    let outbox = PgOutbox::new(pool.clone());

    let older = envelope(r#"{"tx":"older"}"#);
    let newer = envelope(r#"{"tx":"newer"}"#);

    let mut slow = outbox.begin().await.expect("Failed to begin");
    outbox.append(&mut slow, "events", &older).await.expect("Failed to append");

    let mut fast = outbox.begin().await.expect("Failed to begin");
    outbox.append(&mut fast, "events", &newer).await.expect("Failed to append");
    fast.commit().await.expect("Failed to commit");

    assert!(
        outbox.fetch_unforwarded(10).await.expect("Failed to fetch").is_empty(),
        "A commit must not be visible while an older transaction is open"
    );

    slow.commit().await.expect("Failed to commit");
    let ids: Vec<_> = outbox
        .fetch_unforwarded(10)
        .await
        .expect("Failed to fetch")
        .into_iter()
        .map(|r| r.envelope.id())
        .collect();
    assert_eq!(ids, vec![older.id(), newer.id()]);

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn forwarder_publishes_to_the_pg_broker() {
    let pool = common::setup().await;
    let outbox = Arc::new(PgOutbox::new(pool.clone()));
    let broker = Arc::new(PgBroker::new(pool.clone()));

    let message = envelope(r#"{"forwarded":true}"#);
    let mut tx = outbox.begin().await.expect("Failed to begin");
    outbox.append(&mut tx, "events", &message).await.expect("Failed to append");
    tx.commit().await.expect("Failed to commit");

    let mut stream = broker
        .subscribe("events", "svc.Forwarded")
        .await
        .expect("Failed to subscribe");

    let forwarder = Forwarder::new(outbox.clone(), broker.clone(), ForwarderConfig::default());
    assert_eq!(forwarder.forward_batch().await.expect("Failed to forward"), 1);
    assert_eq!(forwarder.forward_batch().await.expect("Failed to forward"), 0);

    let delivery = timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Stream ended");
    assert_eq!(delivery.envelope().id(), message.id());
    assert_eq!(delivery.envelope().payload(), message.payload());
    delivery.ack();

    drop(stream);
    common::teardown(&pool).await;
}
