//! PostgreSQL storage of the operations read model.
//!
//! Each booking is one JSONB document. Updates read the document, apply the change and
//! write it back inside a `REPEATABLE READ` transaction. When two writers touch the same
//! booking, one of them fails with a serialization error (SQLSTATE `40001`) and the whole
//! read-modify-write is retried from a fresh snapshot.

use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, warn};
use sqlx::PgPool;
use sqlx::types::Json;
use std::fmt;
use tickets_core::prelude::*;
use uuid::Uuid;

/// Attempts of a read-modify-write before giving up with [`ReadModelError::Conflict`].
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

const SERIALIZATION_FAILURE: &str = "40001";

/// PostgreSQL implementation of [`OpsBookingStore`].
#[derive(Debug, Clone)]
pub struct PgOpsBookings {
    pool: PgPool,
    max_attempts: usize,
}

impl PgOpsBookings {
    /// Creates a store on `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Overrides how many times a conflicting update is attempted.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn update(
        &self,
        lookup: Lookup,
        update: &(dyn Fn(OpsBooking) -> OpsBooking + Send + Sync),
    ) -> Result<OpsBooking, ReadModelError> {
        let mut attempt = 1;
        loop {
            match self.try_update(lookup, update).await {
                Err(err) if is_serialization_failure(&err) => {
                    if attempt >= self.max_attempts {
                        warn!("Giving up on {} after {} conflicting attempts", lookup, attempt);
                        return Err(ReadModelError::Conflict(lookup.to_string()));
                    }
                    debug!("Concurrent update of {}, attempt {} failed", lookup, attempt);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_update(
        &self,
        lookup: Lookup,
        update: &(dyn Fn(OpsBooking) -> OpsBooking + Send + Sync),
    ) -> Result<OpsBooking, ReadModelError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let row: Option<(Uuid, Json<OpsBooking>)> = match lookup {
            Lookup::Booking(booking_id) => {
                sqlx::query_as(
                    "SELECT booking_id, payload FROM read_model_ops_bookings WHERE booking_id = $1",
                )
                .bind(booking_id)
                .fetch_optional(&mut *tx)
                .await
            }
            Lookup::Ticket(ticket_id) => {
                sqlx::query_as(
                    r#"
                    SELECT booking_id, payload FROM read_model_ops_bookings
                    WHERE payload -> 'tickets' ? $1
                    LIMIT 1
                    "#,
                )
                .bind(ticket_id.to_string())
                .fetch_optional(&mut *tx)
                .await
            }
        }
        .map_err(backend)?;

        let Some((booking_id, Json(booking))) = row else {
            return Err(ReadModelError::NotFound(lookup.to_string()));
        };

        let updated = update(booking).touch();
        sqlx::query("UPDATE read_model_ops_bookings SET payload = $2 WHERE booking_id = $1")
            .bind(booking_id)
            .bind(Json(&updated))
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(updated)
    }
}

#[derive(Debug, Clone, Copy)]
enum Lookup {
    Booking(Uuid),
    Ticket(Uuid),
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Booking(id) => write!(f, "booking {}", id),
            Lookup::Ticket(id) => write!(f, "ticket {}", id),
        }
    }
}

fn backend(err: sqlx::Error) -> ReadModelError {
    ReadModelError::Backend(Box::new(err))
}

fn is_serialization_failure(err: &ReadModelError) -> bool {
    let ReadModelError::Backend(source) = err else {
        return false;
    };
    source
        .downcast_ref::<sqlx::Error>()
        .and_then(|err| err.as_database_error())
        .and_then(|db| db.code())
        .is_some_and(|code| code == SERIALIZATION_FAILURE)
}

#[async_trait]
impl OpsBookingStore for PgOpsBookings {
    async fn create(&self, booking: OpsBooking) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            r#"
            INSERT INTO read_model_ops_bookings (booking_id, payload)
            VALUES ($1, $2)
            ON CONFLICT (booking_id) DO NOTHING
            "#,
        )
        .bind(booking.booking_id)
        .bind(Json(&booking))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_by_booking_id(
        &self,
        booking_id: Uuid,
        update: &(dyn Fn(OpsBooking) -> OpsBooking + Send + Sync),
    ) -> Result<OpsBooking, ReadModelError> {
        self.update(Lookup::Booking(booking_id), update).await
    }

    async fn update_by_ticket_id(
        &self,
        ticket_id: Uuid,
        update: &(dyn Fn(OpsTicket) -> OpsTicket + Send + Sync),
    ) -> Result<OpsBooking, ReadModelError> {
        let apply = move |booking: OpsBooking| booking.update_ticket(ticket_id, update);
        self.update(Lookup::Ticket(ticket_id), &apply).await
    }

    async fn find_by_id(&self, booking_id: Uuid) -> Result<OpsBooking, ReadModelError> {
        let row: Option<(Json<OpsBooking>,)> =
            sqlx::query_as("SELECT payload FROM read_model_ops_bookings WHERE booking_id = $1")
                .bind(booking_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;

        row.map(|(Json(booking),)| booking)
            .ok_or_else(|| ReadModelError::NotFound(Lookup::Booking(booking_id).to_string()))
    }

    async fn find_all(
        &self,
        receipt_issue_date: Option<NaiveDate>,
    ) -> Result<Vec<OpsBooking>, ReadModelError> {
        let rows: Vec<(Json<OpsBooking>,)> = sqlx::query_as(
            r#"
            SELECT b.payload FROM read_model_ops_bookings b
            WHERE $1::date IS NULL OR EXISTS (
                SELECT 1 FROM jsonb_each(b.payload -> 'tickets') AS ticket
                WHERE ((ticket.value ->> 'receipt_issued_at')::timestamptz AT TIME ZONE 'UTC')::date = $1
            )
            ORDER BY (b.payload ->> 'booked_at')::timestamptz DESC, b.booking_id
            "#,
        )
        .bind(receipt_issue_date)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.into_iter().map(|(Json(booking),)| booking).collect())
    }
}
