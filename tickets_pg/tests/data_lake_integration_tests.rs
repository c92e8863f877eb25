mod common;

use serial_test::serial;
use tickets_core::prelude::*;
use tickets_pg::PgDataLake;
use uuid::Uuid;

fn event(name: &str, payload: &[u8]) -> DataLakeEvent {
    let header = MessageHeader::new();
    DataLakeEvent {
        event_id: header.id,
        header,
        event_name: name.to_string(),
        payload: payload.to_vec(),
    }
}

#[tokio::test]
#[serial]
async fn events_are_archived_once_with_exact_bytes() {
    let pool = common::setup().await;
    let lake = PgDataLake::new(pool.clone());

    // key order and spacing must survive storage
    let first = event("BookingMade_v1", br#"{ "z": 1,  "a": 2 }"#);
    let second = event("TicketPrinted_v1", br#"{"ticket_id":"x"}"#);

    lake.store_event(first.clone()).await.unwrap();
    lake.store_event(second.clone()).await.unwrap();
    lake.store_event(first.clone()).await.unwrap();

    let events = lake.events().await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_id, first.event_id);
    assert_eq!(events[0].payload, first.payload);
    assert_eq!(events[0].event_name, "BookingMade_v1");
    assert_eq!(events[0].header.idempotency_key, first.header.idempotency_key);
    assert_eq!(
        events[0].header.published_at.timestamp_micros(),
        first.header.published_at.timestamp_micros()
    );
    assert_eq!(events[1].event_id, second.event_id);

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn duplicate_id_keeps_the_first_event() {
    let pool = common::setup().await;
    let lake = PgDataLake::new(pool.clone());

    let original = event("BookingMade_v1", b"{}");
    let mut replay = original.clone();
    replay.event_name = "Other_v1".to_string();
    replay.payload = b"{\"changed\":true}".to_vec();

    lake.store_event(original.clone()).await.unwrap();
    lake.store_event(replay).await.unwrap();

    let events = lake.events().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_name, original.event_name);
    assert_eq!(events[0].payload, original.payload);
    assert_ne!(events[0].event_id, Uuid::nil());

    common::teardown(&pool).await;
}
