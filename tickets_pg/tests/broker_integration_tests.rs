mod common;

use futures::StreamExt;
use serial_test::serial;
use std::time::Duration;
use tickets_core::prelude::*;
use tickets_pg::{PgBroker, PgBrokerConfig};
use tokio::time::timeout;

fn fast_config() -> PgBrokerConfig {
    PgBrokerConfig {
        poll_interval: Duration::from_millis(100),
        nack_resend_sleep: Duration::from_millis(50),
        lock_retry_interval: Duration::from_millis(50),
        ..PgBrokerConfig::default()
    }
}

fn envelope(body: &str) -> Envelope {
    Envelope::builder()
        .payload(body)
        .build()
        .expect("Failed to build envelope")
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Stream ended")
}

#[tokio::test]
#[serial]
async fn subscriber_receives_messages_in_publish_order() {
    let pool = common::setup().await;
    let broker = PgBroker::with_config(pool.clone(), fast_config());

    let mut stream = broker.subscribe("topic", "group").await.expect("Failed to subscribe");

    let first = envelope("1");
    let second = envelope("2");
    broker
        .publish("topic", vec![first.clone(), second.clone()])
        .await
        .expect("Failed to publish");
    broker
        .publish("other", vec![envelope("ignored")])
        .await
        .expect("Failed to publish");

    let delivery = next(&mut stream).await;
    assert_eq!(delivery.envelope().id(), first.id());
    assert_eq!(delivery.attempt(), 1);
    assert_eq!(delivery.topic(), "topic");
    delivery.ack();

    let delivery = next(&mut stream).await;
    assert_eq!(delivery.envelope().id(), second.id());
    delivery.ack();

    drop(stream);
    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn nacked_message_is_redelivered_with_next_attempt() {
    let pool = common::setup().await;
    let broker = PgBroker::with_config(pool.clone(), fast_config());

    let message = envelope("retry me");
    broker
        .publish("topic", vec![message.clone()])
        .await
        .expect("Failed to publish");

    let mut stream = broker.subscribe("topic", "group").await.expect("Failed to subscribe");

    let delivery = next(&mut stream).await;
    assert_eq!(delivery.attempt(), 1);
    delivery.nack();

    let delivery = next(&mut stream).await;
    assert_eq!(delivery.envelope().id(), message.id());
    assert_eq!(delivery.attempt(), 2);
    delivery.ack();

    drop(stream);
    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn consumer_groups_have_independent_offsets() {
    let pool = common::setup().await;
    let broker = PgBroker::with_config(pool.clone(), fast_config());

    let message = envelope("shared");
    broker
        .publish("topic", vec![message.clone()])
        .await
        .expect("Failed to publish");

    let mut a = broker.subscribe("topic", "group-a").await.expect("Failed to subscribe");
    let mut b = broker.subscribe("topic", "group-b").await.expect("Failed to subscribe");

    let from_a = next(&mut a).await;
    let from_b = next(&mut b).await;
    assert_eq!(from_a.envelope().id(), message.id());
    assert_eq!(from_b.envelope().id(), message.id());
    from_a.ack();
    from_b.ack();

    drop(a);
    drop(b);
    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn acked_offset_survives_resubscription() {
    let pool = common::setup().await;
    let broker = PgBroker::with_config(pool.clone(), fast_config());

    let first = envelope("first");
    let second = envelope("second");
    broker
        .publish("topic", vec![first.clone(), second.clone()])
        .await
        .expect("Failed to publish");

    let mut stream = broker.subscribe("topic", "group").await.expect("Failed to subscribe");
    let delivery = next(&mut stream).await;
    assert_eq!(delivery.envelope().id(), first.id());
    delivery.ack();

    let unsettled = next(&mut stream).await;
    assert_eq!(unsettled.envelope().id(), second.id());
    drop(unsettled);
    drop(stream);

    // the second consumer waits for the first one to release the group lock
    let mut stream = broker.subscribe("topic", "group").await.expect("Failed to subscribe");
    let delivery = next(&mut stream).await;
    assert_eq!(delivery.envelope().id(), second.id());
    delivery.ack();

    drop(stream);
    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn publishing_nothing_is_a_no_op() {
    let pool = common::setup().await;
    let broker = PgBroker::new(pool.clone());

    broker.publish("topic", vec![]).await.expect("Failed to publish");

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tickets_messages")
        .fetch_one(&pool)
        .await
        .expect("Failed to count");
    assert_eq!(count, 0);

    common::teardown(&pool).await;
}
