use async_trait::async_trait;
use sqlx::PgPool;
use tickets_core::prelude::*;
use uuid::Uuid;

/// PostgreSQL implementation of [`ProcessedMessages`].
#[derive(Debug, Clone)]
pub struct PgProcessedMessages {
    pool: PgPool,
}

impl PgProcessedMessages {
    /// Creates a ledger on `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(err: sqlx::Error) -> LedgerError {
    LedgerError::Backend(Box::new(err))
}

#[async_trait]
impl ProcessedMessages for PgProcessedMessages {
    async fn is_processed(&self, handler_name: &str, message_id: Uuid) -> Result<bool, LedgerError> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM tickets_processed_messages
                WHERE handler_name = $1 AND message_id = $2
            )
            "#,
        )
        .bind(handler_name)
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(exists)
    }

    async fn mark_processed(&self, handler_name: &str, message_id: Uuid) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO tickets_processed_messages (handler_name, message_id)
            VALUES ($1, $2)
            ON CONFLICT (handler_name, message_id) DO NOTHING
            "#,
        )
        .bind(handler_name)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}
