use super::Migration;

pub(super) const CREATE_DATA_LAKE_TABLE: Migration = Migration {
    version: 3,
    name: "create_data_lake_table",
    statements: &[r#"
        CREATE TABLE IF NOT EXISTS tickets_data_lake (
            event_id UUID PRIMARY KEY,
            published_at TIMESTAMPTZ NOT NULL,
            idempotency_key VARCHAR(255) NOT NULL DEFAULT '',
            event_name VARCHAR(255) NOT NULL,
            event_payload BYTEA NOT NULL,
            stored_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
        )
        "#],
};
