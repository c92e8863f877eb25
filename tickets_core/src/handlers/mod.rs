//! Business handlers of the ticketing service and the collaborators they call.
//!
//! Collaborators are external services reached through narrow traits. Every call carries
//! an idempotency key so that a redelivered message does not repeat its side effect.

mod commands;
mod events;

pub use commands::RefundTicketHandler;
pub use events::{
    AppendToTracker, BookPlaceInDeadNation, IssueReceipt, PrintTicket, RemoveCanceledTicket,
    StoreTicket, TicketRefundToSheet,
};

use crate::events::{
    BookingMade, Money, RefundTicket, TicketBookingCanceled, TicketBookingConfirmed,
    TicketsCommand, TicketsEvent,
};
use crate::router::handler::BoxError;
use crate::router::processor::{CommandProcessor, EventProcessor};
use crate::router::{Router, RouterError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Sheet tracking tickets that still have to be printed.
pub const TICKETS_TO_PRINT_SHEET: &str = "tickets-to-print";
/// Sheet tracking tickets that have to be refunded.
pub const TICKETS_TO_REFUND_SHEET: &str = "tickets-to-refund";

/// Request to issue a receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueReceiptRequest {
    /// Deduplication key of the call.
    pub idempotency_key: String,
    /// The ticket.
    pub ticket_id: Uuid,
    /// Price on the receipt.
    pub price: Money,
}

/// An issued receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueReceiptResponse {
    /// Receipt number.
    pub receipt_number: String,
    /// When it was issued.
    pub issued_at: DateTime<Utc>,
}

/// Issues and voids receipts.
#[async_trait]
pub trait ReceiptsService: Send + Sync {
    /// Issues a receipt. Issuing twice with the same key returns the first receipt.
    async fn issue_receipt(&self, request: IssueReceiptRequest)
    -> Result<IssueReceiptResponse, BoxError>;

    /// Voids the receipt of a ticket.
    async fn void_receipt(&self, ticket_id: Uuid, idempotency_key: &str) -> Result<(), BoxError>;
}

/// Refunds payments.
#[async_trait]
pub trait PaymentsService: Send + Sync {
    /// Refunds the payment of a ticket.
    async fn refund_payment(&self, ticket_id: Uuid, idempotency_key: &str) -> Result<(), BoxError>;
}

/// Stores generated files.
#[async_trait]
pub trait FileApi: Send + Sync {
    /// Uploads a file, overwriting any file with the same id.
    async fn upload_file(&self, file_id: &str, content: &str) -> Result<(), BoxError>;
}

/// Appends rows to shared spreadsheets.
#[async_trait]
pub trait SpreadsheetsApi: Send + Sync {
    /// Appends one row to `sheet_name`.
    async fn append_row(&self, sheet_name: &str, row: Vec<String>) -> Result<(), BoxError>;
}

/// A reservation on the Dead Nation booking provider.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadNationBooking {
    /// The booking on our side, used as the idempotency key.
    pub booking_id: Uuid,
    /// Customer contact.
    pub customer_email: String,
    /// Event id on the provider.
    pub dead_nation_event_id: Uuid,
    /// Number of places.
    pub number_of_tickets: u32,
}

/// The Dead Nation booking provider.
#[async_trait]
pub trait DeadNationApi: Send + Sync {
    /// Books places on the provider.
    async fn book_in_dead_nation(&self, booking: DeadNationBooking) -> Result<(), BoxError>;
}

/// A confirmed ticket.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    /// The ticket.
    pub ticket_id: Uuid,
    /// Price paid.
    pub price: Money,
    /// Customer contact.
    pub customer_email: String,
}

/// Write model of tickets.
#[async_trait]
pub trait TicketRepository: Send + Sync {
    /// Stores a ticket, replacing a stored one with the same id.
    async fn add(&self, ticket: Ticket) -> Result<(), BoxError>;

    /// Removes a ticket. Removing an unknown ticket is a no-op.
    async fn remove(&self, ticket_id: Uuid) -> Result<(), BoxError>;
}

/// A show tickets are sold for.
#[derive(Debug, Clone, PartialEq)]
pub struct Show {
    /// The show.
    pub show_id: Uuid,
    /// The matching event on Dead Nation, for shows sold there.
    pub dead_nation_id: Option<Uuid>,
    /// Capacity.
    pub number_of_tickets: u32,
    /// Title.
    pub title: String,
}

/// Read access to shows.
#[async_trait]
pub trait ShowRepository: Send + Sync {
    /// The show, if it exists.
    async fn show_by_id(&self, show_id: Uuid) -> Result<Option<Show>, BoxError>;
}

/// Everything the business handlers talk to.
#[derive(Clone)]
pub struct Collaborators {
    /// Receipts.
    pub receipts: Arc<dyn ReceiptsService>,
    /// Payments.
    pub payments: Arc<dyn PaymentsService>,
    /// File storage.
    pub files: Arc<dyn FileApi>,
    /// Spreadsheets.
    pub spreadsheets: Arc<dyn SpreadsheetsApi>,
    /// Dead Nation.
    pub dead_nation: Arc<dyn DeadNationApi>,
    /// Tickets write model.
    pub tickets: Arc<dyn TicketRepository>,
    /// Shows.
    pub shows: Arc<dyn ShowRepository>,
}

impl Collaborators {
    /// Registers every business handler on `router`.
    pub fn register(
        &self,
        events: &EventProcessor<TicketsEvent>,
        commands: &CommandProcessor<TicketsCommand>,
        router: &mut Router,
    ) -> Result<(), RouterError> {
        events.add_named::<TicketBookingConfirmed, _>(
            router,
            StoreTicket::new(self.tickets.clone()),
        )?;
        events.add_named::<TicketBookingConfirmed, _>(
            router,
            AppendToTracker::new(self.spreadsheets.clone()),
        )?;
        events.add_named::<TicketBookingConfirmed, _>(
            router,
            PrintTicket::new(self.files.clone()),
        )?;
        events.add_named::<TicketBookingCanceled, _>(
            router,
            TicketRefundToSheet::new(self.spreadsheets.clone()),
        )?;
        events.add_named::<TicketBookingConfirmed, _>(
            router,
            IssueReceipt::new(self.receipts.clone()),
        )?;
        events.add_named::<TicketBookingCanceled, _>(
            router,
            RemoveCanceledTicket::new(self.tickets.clone()),
        )?;
        events.add_named::<BookingMade, _>(
            router,
            BookPlaceInDeadNation::new(self.shows.clone(), self.dead_nation.clone()),
        )?;
        commands.add_named::<RefundTicket, _>(
            router,
            RefundTicketHandler::new(self.receipts.clone(), self.payments.clone()),
        )?;
        Ok(())
    }
}
