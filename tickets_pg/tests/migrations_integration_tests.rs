mod common;

use serial_test::serial;
use tickets_pg::{MigrationError, Migrator};

const MIGRATION_COUNT: usize = 5;

#[tokio::test]
#[serial]
async fn test_migrator_creates_tracking_table() {
    let pool = common::get_pg_pool().await;
    common::teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    let applied = migrator.applied().await.expect("Should list applied");
    assert!(applied.is_empty(), "Fresh schema has no migrations");
    assert_eq!(
        migrator.pending().await.expect("Should list pending").len(),
        MIGRATION_COUNT
    );

    let result: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM information_schema.tables
        WHERE table_name = '_tickets_migrations'
        "#,
    )
    .fetch_one(&pool)
    .await
    .expect("Failed to query information_schema");
    assert_eq!(result.0, 1, "_tickets_migrations table should exist");

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_migrator_runs_all_migrations_once() {
    let pool = common::get_pg_pool().await;
    common::teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    let applied = migrator.run().await.expect("Should run migrations");
    assert_eq!(applied.len(), MIGRATION_COUNT);
    assert!(migrator.pending().await.expect("Should list pending").is_empty());

    let again = migrator.run().await.expect("Second run should succeed");
    assert!(again.is_empty(), "Nothing left to apply");

    let names: Vec<String> = migrator
        .applied()
        .await
        .expect("Should list applied")
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(
        names,
        vec![
            "create_outbox_table",
            "create_broker_tables",
            "create_data_lake_table",
            "create_ops_bookings_table",
            "create_processed_messages_table",
        ]
    );

    for table in [
        "tickets_outbox",
        "tickets_messages",
        "tickets_consumer_offsets",
        "tickets_data_lake",
        "read_model_ops_bookings",
        "tickets_processed_messages",
    ] {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = $1",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .expect("Failed to query information_schema");
        assert_eq!(count, 1, "{} should exist", table);
    }

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_concurrent_runs_apply_each_migration_once() {
    let pool = common::get_pg_pool().await;
    common::teardown(&pool).await;

    let first = Migrator::new(pool.clone());
    let second = Migrator::new(pool.clone());
    let (a, b) = tokio::join!(first.run(), second.run());
    let a = a.expect("First run should succeed");
    let b = b.expect("Second run should succeed");

    assert_eq!(a.len() + b.len(), MIGRATION_COUNT);
    assert!(a.is_empty() || b.is_empty(), "One run applies everything");

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_edited_migration_is_rejected() {
    let pool = common::setup().await;

    sqlx::query("UPDATE _tickets_migrations SET checksum = 'stale' WHERE version = 1")
        .execute(&pool)
        .await
        .expect("Failed to tamper with checksum");

    let err = Migrator::new(pool.clone())
        .run()
        .await
        .expect_err("Edited migration must be reported");
    assert!(matches!(
        err,
        MigrationError::ChecksumMismatch { version: 1, .. }
    ));

    common::teardown(&pool).await;
}
