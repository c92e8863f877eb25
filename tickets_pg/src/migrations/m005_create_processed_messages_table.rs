use super::Migration;

pub(super) const CREATE_PROCESSED_MESSAGES_TABLE: Migration = Migration {
    version: 5,
    name: "create_processed_messages_table",
    statements: &[r#"
        CREATE TABLE IF NOT EXISTS tickets_processed_messages (
            handler_name VARCHAR(255) NOT NULL,
            message_id UUID NOT NULL,
            processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (handler_name, message_id)
        )
        "#],
};
