use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tickets_core::prelude::*;
use uuid::Uuid;

/// PostgreSQL implementation of [`DataLake`].
///
/// Payloads are stored as `BYTEA` so archived events keep their exact bytes.
#[derive(Debug, Clone)]
pub struct PgDataLake {
    pool: PgPool,
}

impl PgDataLake {
    /// Creates a data lake on `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(err: sqlx::Error) -> DataLakeError {
    DataLakeError::Backend(Box::new(err))
}

#[derive(Debug, FromRow)]
struct DataLakeRow {
    event_id: Uuid,
    published_at: DateTime<Utc>,
    idempotency_key: String,
    event_name: String,
    event_payload: Vec<u8>,
}

impl From<DataLakeRow> for DataLakeEvent {
    fn from(row: DataLakeRow) -> Self {
        Self {
            event_id: row.event_id,
            header: MessageHeader {
                id: row.event_id,
                published_at: row.published_at,
                idempotency_key: row.idempotency_key,
            },
            event_name: row.event_name,
            payload: row.event_payload,
        }
    }
}

#[async_trait]
impl DataLake for PgDataLake {
    async fn store_event(&self, event: DataLakeEvent) -> Result<(), DataLakeError> {
        sqlx::query(
            r#"
            INSERT INTO tickets_data_lake
                (event_id, published_at, idempotency_key, event_name, event_payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(event.header.published_at)
        .bind(&event.header.idempotency_key)
        .bind(&event.event_name)
        .bind(&event.payload)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn events(&self) -> Result<Vec<DataLakeEvent>, DataLakeError> {
        let rows: Vec<DataLakeRow> = sqlx::query_as(
            r#"
            SELECT event_id, published_at, idempotency_key, event_name, event_payload
            FROM tickets_data_lake
            ORDER BY stored_at, event_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.into_iter().map(DataLakeEvent::from).collect())
    }
}
