//! The operations read model: one JSONB document per booking, indexed on its tickets so
//! a ticket id can be mapped back to its booking.

use super::Migration;

pub(super) const CREATE_OPS_BOOKINGS_TABLE: Migration = Migration {
    version: 4,
    name: "create_ops_bookings_table",
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS read_model_ops_bookings (
            booking_id UUID PRIMARY KEY,
            payload JSONB NOT NULL
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_read_model_ops_bookings_tickets
        ON read_model_ops_bookings USING GIN ((payload -> 'tickets'))
        "#,
    ],
};
