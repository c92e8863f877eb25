//! PostgreSQL outbox.
//!
//! Records are visible to the forwarder only once the inserting transaction is older than
//! every transaction still in flight, so they are read in commit order and a long-running
//! transaction never lets a later commit overtake it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres};
use tickets_core::envelope::EnvelopeBuilderError;
use tickets_core::prelude::*;
use uuid::Uuid;

/// Wrapper for a sqlx transaction that implements [`TransactionOps`].
///
/// Access to the underlying transaction is provided via `Deref` and `DerefMut`, so
/// business writes run through the same transaction as the outbox append
/// (e.g., `.execute(&mut **tx)`).
pub struct PgTransaction(sqlx::Transaction<'static, Postgres>);

impl PgTransaction {
    /// Wraps an open transaction.
    pub fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self(tx)
    }
}

#[async_trait]
impl TransactionOps for PgTransaction {
    async fn commit(self) -> Result<(), OutboxError> {
        self.0.commit().await.map_err(backend)
    }

    async fn rollback(self) -> Result<(), OutboxError> {
        self.0.rollback().await.map_err(backend)
    }
}

impl std::ops::Deref for PgTransaction {
    type Target = sqlx::Transaction<'static, Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for PgTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

fn backend(err: sqlx::Error) -> OutboxError {
    OutboxError::Backend(Box::new(err))
}

/// A stored message as read back from `tickets_outbox` or `tickets_messages`.
#[derive(Debug, FromRow)]
pub(crate) struct PgMessageRow {
    pub sequence: i64,
    pub topic: String,
    pub message_id: Uuid,
    pub published_at: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub metadata: Json<Metadata>,
}

impl PgMessageRow {
    pub(crate) fn into_envelope(self) -> Result<Envelope, EnvelopeBuilderError> {
        Envelope::builder()
            .id(self.message_id)
            .published_at(self.published_at)
            .payload(self.payload)
            .merge_metadata(self.metadata.0)
            .build()
    }
}

/// PostgreSQL implementation of [`OutboxStore`] over `tickets_outbox`.
#[derive(Debug, Clone)]
pub struct PgOutbox {
    pool: PgPool,
}

impl PgOutbox {
    /// Creates an outbox over `pool`. Run the [`Migrator`](crate::Migrator) first.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutbox {
    type Transaction = PgTransaction;

    async fn begin(&self) -> Result<Self::Transaction, OutboxError> {
        Ok(PgTransaction::new(self.pool.begin().await.map_err(backend)?))
    }

    async fn append(
        &self,
        tx: &mut Self::Transaction,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            INSERT INTO tickets_outbox (topic, message_id, published_at, payload, metadata)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(topic)
        .bind(envelope.id())
        .bind(envelope.published_at())
        .bind(envelope.payload())
        .bind(Json(envelope.metadata()))
        .execute(&mut ***tx)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn fetch_unforwarded(&self, batch_size: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows: Vec<PgMessageRow> = sqlx::query_as(
            r#"
            SELECT sequence, topic, message_id, published_at, payload, metadata
            FROM tickets_outbox
            WHERE forwarded_at IS NULL
              AND transaction_id < pg_snapshot_xmin(pg_current_snapshot())
            ORDER BY transaction_id, sequence
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let sequence = row.sequence;
                let topic = row.topic.clone();
                let envelope = row
                    .into_envelope()
                    .map_err(|e| OutboxError::Backend(Box::new(e)))?;
                Ok(OutboxRecord {
                    sequence,
                    topic,
                    envelope,
                    forwarded: false,
                })
            })
            .collect()
    }

    async fn mark_forwarded(&self, sequences: &[i64]) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            UPDATE tickets_outbox
            SET forwarded_at = NOW()
            WHERE sequence = ANY($1) AND forwarded_at IS NULL
            "#,
        )
        .bind(sequences)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}
