//! The operations read model: one document per booking with its tickets nested inside.
//!
//! The projector folds events into the document with field-level overwrites. Each event
//! type owns its own fields, so events of different types commute, and replaying an event
//! writes the same values again. An event arriving before its booking exists fails with
//! [`HandlerError::MissingDependency`] and is redelivered until the booking shows up.

use crate::events::{
    BookingMade, TicketBookingConfirmed, TicketPrinted, TicketReceiptIssued, TicketRefunded,
    TicketsEvent,
};
use crate::router::context::MessageContext;
use crate::router::handler::{HandlerError, HandlerResult, MessageHandler};
use crate::router::processor::EventProcessor;
use crate::router::{Router, RouterError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// A booking as seen by operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpsBooking {
    /// The booking.
    pub booking_id: Uuid,
    /// When the booking was made.
    pub booked_at: DateTime<Utc>,
    /// Tickets of the booking, by ticket id.
    #[serde(default)]
    pub tickets: BTreeMap<Uuid, OpsTicket>,
    /// Last time the document was written.
    pub last_update: DateTime<Utc>,
}

/// A ticket as seen by operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsTicket {
    /// Price paid, as a decimal string.
    pub price_amount: String,
    /// Currency of the price.
    pub price_currency: String,
    /// Customer contact.
    pub customer_email: String,
    /// When the ticket was confirmed.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// When the ticket file was generated.
    pub printed_at: Option<DateTime<Utc>>,
    /// Name of the generated file.
    pub printed_file_name: String,
    /// When the receipt was issued.
    pub receipt_issued_at: Option<DateTime<Utc>>,
    /// Receipt number.
    pub receipt_number: String,
    /// When the ticket was refunded.
    pub refunded_at: Option<DateTime<Utc>>,
}

impl OpsBooking {
    /// A booking without tickets.
    pub fn new(booking_id: Uuid, booked_at: DateTime<Utc>) -> Self {
        Self {
            booking_id,
            booked_at,
            tickets: BTreeMap::new(),
            last_update: Utc::now(),
        }
    }

    /// Applies `update` to a ticket, starting from an empty ticket if it is not known yet.
    pub fn update_ticket(
        mut self,
        ticket_id: Uuid,
        update: &(dyn Fn(OpsTicket) -> OpsTicket + Send + Sync),
    ) -> Self {
        let ticket = self.tickets.remove(&ticket_id).unwrap_or_default();
        self.tickets.insert(ticket_id, update(ticket));
        self
    }

    /// Whether the booking holds `ticket_id`.
    pub fn has_ticket(&self, ticket_id: Uuid) -> bool {
        self.tickets.contains_key(&ticket_id)
    }

    /// Whether any ticket had its receipt issued on `date` (UTC).
    pub fn has_receipt_issued_on(&self, date: NaiveDate) -> bool {
        self.tickets
            .values()
            .filter_map(|t| t.receipt_issued_at)
            .any(|issued_at| issued_at.date_naive() == date)
    }

    /// Stamps `last_update` with the current time.
    pub fn touch(mut self) -> Self {
        self.last_update = Utc::now();
        self
    }
}

/// Errors returned by read-model stores.
#[derive(Debug, thiserror::Error)]
pub enum ReadModelError {
    /// The booking (or the booking holding a ticket) does not exist.
    #[error("Read model not found: {0}")]
    NotFound(String),
    /// Concurrent writers kept conflicting until the retries ran out.
    #[error("Read model update for {0} kept conflicting")]
    Conflict(String),
    /// A stored document could not be (de)serialized.
    #[error("Read model serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The storage backend failed.
    #[error("Read model backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<ReadModelError> for HandlerError {
    fn from(err: ReadModelError) -> Self {
        match err {
            ReadModelError::NotFound(what) => {
                HandlerError::missing_dependency(format!("read model for {} does not exist yet", what))
            }
            other => HandlerError::transient(other),
        }
    }
}

/// Storage of [`OpsBooking`] documents.
///
/// Updates are a read-modify-write on the stored document executed as one transaction,
/// so concurrent updates of one booking never lose each other's fields.
#[async_trait]
pub trait OpsBookingStore: Send + Sync {
    /// Inserts the booking unless it exists. Returns whether it was inserted.
    async fn create(&self, booking: OpsBooking) -> Result<bool, ReadModelError>;

    /// Applies `update` to the booking and stores the result.
    async fn update_by_booking_id(
        &self,
        booking_id: Uuid,
        update: &(dyn Fn(OpsBooking) -> OpsBooking + Send + Sync),
    ) -> Result<OpsBooking, ReadModelError>;

    /// Applies `update` to a ticket of whichever booking holds it and stores the result.
    async fn update_by_ticket_id(
        &self,
        ticket_id: Uuid,
        update: &(dyn Fn(OpsTicket) -> OpsTicket + Send + Sync),
    ) -> Result<OpsBooking, ReadModelError>;

    /// The booking, or [`ReadModelError::NotFound`].
    async fn find_by_id(&self, booking_id: Uuid) -> Result<OpsBooking, ReadModelError>;

    /// All bookings, newest first, optionally only those with a receipt issued on a date.
    async fn find_all(
        &self,
        receipt_issue_date: Option<NaiveDate>,
    ) -> Result<Vec<OpsBooking>, ReadModelError>;
}

#[async_trait]
impl<T: OpsBookingStore + ?Sized> OpsBookingStore for Arc<T> {
    async fn create(&self, booking: OpsBooking) -> Result<bool, ReadModelError> {
        (**self).create(booking).await
    }

    async fn update_by_booking_id(
        &self,
        booking_id: Uuid,
        update: &(dyn Fn(OpsBooking) -> OpsBooking + Send + Sync),
    ) -> Result<OpsBooking, ReadModelError> {
        (**self).update_by_booking_id(booking_id, update).await
    }

    async fn update_by_ticket_id(
        &self,
        ticket_id: Uuid,
        update: &(dyn Fn(OpsTicket) -> OpsTicket + Send + Sync),
    ) -> Result<OpsBooking, ReadModelError> {
        (**self).update_by_ticket_id(ticket_id, update).await
    }

    async fn find_by_id(&self, booking_id: Uuid) -> Result<OpsBooking, ReadModelError> {
        (**self).find_by_id(booking_id).await
    }

    async fn find_all(
        &self,
        receipt_issue_date: Option<NaiveDate>,
    ) -> Result<Vec<OpsBooking>, ReadModelError> {
        (**self).find_all(receipt_issue_date).await
    }
}

/// Folds ticketing events into an [`OpsBookingStore`].
pub struct OpsBookingProjector<S> {
    store: S,
}

impl<S: OpsBookingStore + 'static> OpsBookingProjector<S> {
    /// Creates a projector writing to `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Registers one handler per projected event on `router`.
    pub fn register(
        self: Arc<Self>,
        processor: &EventProcessor<TicketsEvent>,
        router: &mut Router,
    ) -> Result<(), RouterError> {
        processor.add_handler::<BookingMade, _>(
            router,
            "ops_read_model.OnBookingMade",
            self.clone(),
        )?;
        processor.add_handler::<TicketBookingConfirmed, _>(
            router,
            "ops_read_model.OnTicketBookingConfirmed",
            self.clone(),
        )?;
        processor.add_handler::<TicketRefunded, _>(
            router,
            "ops_read_model.OnTicketRefunded",
            self.clone(),
        )?;
        processor.add_handler::<TicketPrinted, _>(
            router,
            "ops_read_model.OnTicketPrinted",
            self.clone(),
        )?;
        processor.add_handler::<TicketReceiptIssued, _>(
            router,
            "ops_read_model.OnTicketReceiptIssued",
            self,
        )?;
        Ok(())
    }
}

#[async_trait]
impl<S: OpsBookingStore> MessageHandler<BookingMade> for OpsBookingProjector<S> {
    async fn handle(&self, _ctx: &MessageContext, event: BookingMade) -> HandlerResult {
        let booking = OpsBooking::new(event.booking_id, event.header.published_at);
        if !self.store.create(booking).await? {
            debug!(
                "Read model for booking {} already exists, keeping it",
                event.booking_id
            );
        }
        Ok(vec![])
    }
}

#[async_trait]
impl<S: OpsBookingStore> MessageHandler<TicketBookingConfirmed> for OpsBookingProjector<S> {
    async fn handle(&self, _ctx: &MessageContext, event: TicketBookingConfirmed) -> HandlerResult {
        let ticket_id = event.ticket_id;
        let booking_id = event.booking_id;
        let confirm = move |ticket: OpsTicket| OpsTicket {
            price_amount: event.price.amount.clone(),
            price_currency: event.price.currency.clone(),
            customer_email: event.customer_email.clone(),
            confirmed_at: Some(event.header.published_at),
            ..ticket
        };
        self.store
            .update_by_booking_id(booking_id, &|booking: OpsBooking| {
                booking.update_ticket(ticket_id, &confirm)
            })
            .await?;
        Ok(vec![])
    }
}

#[async_trait]
impl<S: OpsBookingStore> MessageHandler<TicketRefunded> for OpsBookingProjector<S> {
    async fn handle(&self, _ctx: &MessageContext, event: TicketRefunded) -> HandlerResult {
        let refunded_at = event.header.published_at;
        self.store
            .update_by_ticket_id(event.ticket_id, &move |ticket: OpsTicket| OpsTicket {
                refunded_at: Some(refunded_at),
                ..ticket
            })
            .await?;
        Ok(vec![])
    }
}

#[async_trait]
impl<S: OpsBookingStore> MessageHandler<TicketPrinted> for OpsBookingProjector<S> {
    async fn handle(&self, _ctx: &MessageContext, event: TicketPrinted) -> HandlerResult {
        let printed_at = event.header.published_at;
        let file_name = event.file_name;
        self.store
            .update_by_ticket_id(event.ticket_id, &move |ticket: OpsTicket| OpsTicket {
                printed_at: Some(printed_at),
                printed_file_name: file_name.clone(),
                ..ticket
            })
            .await?;
        Ok(vec![])
    }
}

#[async_trait]
impl<S: OpsBookingStore> MessageHandler<TicketReceiptIssued> for OpsBookingProjector<S> {
    async fn handle(&self, _ctx: &MessageContext, event: TicketReceiptIssued) -> HandlerResult {
        let issued_at = event.issued_at;
        let receipt_number = event.receipt_number;
        self.store
            .update_by_ticket_id(event.ticket_id, &move |ticket: OpsTicket| OpsTicket {
                receipt_issued_at: Some(issued_at),
                receipt_number: receipt_number.clone(),
                ..ticket
            })
            .await?;
        Ok(vec![])
    }
}
