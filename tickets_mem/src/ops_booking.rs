use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use tickets_core::prelude::*;

/// An in-memory [`OpsBookingStore`].
///
/// Updates hold the store lock for the whole read-modify-write, which gives them the
/// same all-or-nothing behaviour as a serializable transaction.
#[derive(Clone, Debug, Default)]
pub struct InMemoryOpsBookings(Arc<Mutex<HashMap<Uuid, OpsBooking>>>);

impl InMemoryOpsBookings {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OpsBookingStore for InMemoryOpsBookings {
    async fn create(&self, booking: OpsBooking) -> Result<bool, ReadModelError> {
        let mut bookings = self.0.lock().await;
        if bookings.contains_key(&booking.booking_id) {
            return Ok(false);
        }
        bookings.insert(booking.booking_id, booking);
        Ok(true)
    }

    async fn update_by_booking_id(
        &self,
        booking_id: Uuid,
        update: &(dyn Fn(OpsBooking) -> OpsBooking + Send + Sync),
    ) -> Result<OpsBooking, ReadModelError> {
        let mut bookings = self.0.lock().await;
        let booking = bookings
            .get(&booking_id)
            .cloned()
            .ok_or_else(|| ReadModelError::NotFound(format!("booking {}", booking_id)))?;
        let updated = update(booking).touch();
        bookings.insert(booking_id, updated.clone());
        Ok(updated)
    }

    async fn update_by_ticket_id(
        &self,
        ticket_id: Uuid,
        update: &(dyn Fn(OpsTicket) -> OpsTicket + Send + Sync),
    ) -> Result<OpsBooking, ReadModelError> {
        let mut bookings = self.0.lock().await;
        let booking = bookings
            .values()
            .find(|b| b.has_ticket(ticket_id))
            .cloned()
            .ok_or_else(|| ReadModelError::NotFound(format!("ticket {}", ticket_id)))?;
        let updated = booking.update_ticket(ticket_id, update).touch();
        bookings.insert(updated.booking_id, updated.clone());
        Ok(updated)
    }

    async fn find_by_id(&self, booking_id: Uuid) -> Result<OpsBooking, ReadModelError> {
        self.0
            .lock()
            .await
            .get(&booking_id)
            .cloned()
            .ok_or_else(|| ReadModelError::NotFound(format!("booking {}", booking_id)))
    }

    async fn find_all(
        &self,
        receipt_issue_date: Option<NaiveDate>,
    ) -> Result<Vec<OpsBooking>, ReadModelError> {
        let bookings = self.0.lock().await;
        let mut found: Vec<OpsBooking> = bookings
            .values()
            .filter(|b| receipt_issue_date.is_none_or(|date| b.has_receipt_issued_on(date)))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.booked_at.cmp(&a.booked_at));
        Ok(found)
    }
}
