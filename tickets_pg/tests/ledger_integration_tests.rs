mod common;

use serial_test::serial;
use tickets_core::prelude::*;
use tickets_pg::PgProcessedMessages;
use uuid::Uuid;

#[tokio::test]
#[serial]
async fn processed_messages_are_remembered_per_handler() {
    let pool = common::setup().await;
    let ledger = PgProcessedMessages::new(pool.clone());

    let message_id = Uuid::new_v4();
    assert!(!ledger.is_processed("IssueReceipt", message_id).await.unwrap());

    ledger.mark_processed("IssueReceipt", message_id).await.unwrap();
    ledger
        .mark_processed("IssueReceipt", message_id)
        .await
        .expect("Marking twice is a no-op");

    assert!(ledger.is_processed("IssueReceipt", message_id).await.unwrap());
    assert!(!ledger.is_processed("PrintTicket", message_id).await.unwrap());
    assert!(!ledger.is_processed("IssueReceipt", Uuid::new_v4()).await.unwrap());

    common::teardown(&pool).await;
}
