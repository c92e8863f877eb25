//! Broker messages and consumer-group offsets. Offsets point at the last acknowledged
//! `(transaction_id, sequence)` of a group on a topic.

use super::Migration;

pub(super) const CREATE_BROKER_TABLES: Migration = Migration {
    version: 2,
    name: "create_broker_tables",
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS tickets_messages (
            sequence BIGSERIAL PRIMARY KEY,
            transaction_id XID8 NOT NULL DEFAULT pg_current_xact_id(),
            topic VARCHAR(255) NOT NULL,
            message_id UUID NOT NULL,
            published_at TIMESTAMPTZ NOT NULL,
            payload BYTEA NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_tickets_messages_topic_position
        ON tickets_messages (topic, transaction_id, sequence)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tickets_consumer_offsets (
            consumer_group VARCHAR(255) NOT NULL,
            topic VARCHAR(255) NOT NULL,
            last_transaction_id XID8 NOT NULL DEFAULT '0',
            last_sequence BIGINT NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (consumer_group, topic)
        )
        "#,
    ],
};
