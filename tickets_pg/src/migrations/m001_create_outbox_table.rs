//! `transaction_id` records the inserting transaction so the forwarder can read rows in
//! commit order and skip rows of transactions that are still in flight.

use super::Migration;

pub(super) const CREATE_OUTBOX_TABLE: Migration = Migration {
    version: 1,
    name: "create_outbox_table",
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS tickets_outbox (
            sequence BIGSERIAL PRIMARY KEY,
            transaction_id XID8 NOT NULL DEFAULT pg_current_xact_id(),
            topic VARCHAR(255) NOT NULL,
            message_id UUID NOT NULL,
            published_at TIMESTAMPTZ NOT NULL,
            payload BYTEA NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            forwarded_at TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_tickets_outbox_unforwarded
        ON tickets_outbox (transaction_id, sequence)
        WHERE forwarded_at IS NULL
        "#,
    ],
};
