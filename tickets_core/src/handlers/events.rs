use super::{
    DeadNationApi, DeadNationBooking, FileApi, IssueReceiptRequest, ReceiptsService,
    ShowRepository, SpreadsheetsApi, TICKETS_TO_PRINT_SHEET, TICKETS_TO_REFUND_SHEET, Ticket,
    TicketRepository,
};
use crate::events::{
    BookingMade, MessageHeader, Money, TicketBookingCanceled, TicketBookingConfirmed,
    TicketPrinted, TicketReceiptIssued, TicketsEvent,
};
use crate::router::context::MessageContext;
use crate::router::handler::{HandlerError, HandlerResult, MessageHandler, OutgoingMessage};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use tickets_derive::HandlerName;
use uuid::Uuid;

fn ticket_row(ticket_id: Uuid, customer_email: &str, price: &Money) -> Vec<String> {
    vec![
        ticket_id.to_string(),
        customer_email.to_string(),
        price.amount.clone(),
        price.currency.clone(),
    ]
}

/// Stores confirmed tickets in the write model.
#[derive(HandlerName)]
pub struct StoreTicket {
    tickets: Arc<dyn TicketRepository>,
}

impl StoreTicket {
    /// Creates the handler.
    pub fn new(tickets: Arc<dyn TicketRepository>) -> Self {
        Self { tickets }
    }
}

#[async_trait]
impl MessageHandler<TicketBookingConfirmed> for StoreTicket {
    async fn handle(&self, _ctx: &MessageContext, event: TicketBookingConfirmed) -> HandlerResult {
        self.tickets
            .add(Ticket {
                ticket_id: event.ticket_id,
                price: event.price,
                customer_email: event.customer_email,
            })
            .await
            .map_err(HandlerError::transient)?;
        Ok(vec![])
    }
}

/// Adds confirmed tickets to the print tracking sheet.
#[derive(HandlerName)]
pub struct AppendToTracker {
    spreadsheets: Arc<dyn SpreadsheetsApi>,
}

impl AppendToTracker {
    /// Creates the handler.
    pub fn new(spreadsheets: Arc<dyn SpreadsheetsApi>) -> Self {
        Self { spreadsheets }
    }
}

#[async_trait]
impl MessageHandler<TicketBookingConfirmed> for AppendToTracker {
    async fn handle(&self, _ctx: &MessageContext, event: TicketBookingConfirmed) -> HandlerResult {
        debug!("Appending ticket {} to the tracker", event.ticket_id);
        self.spreadsheets
            .append_row(
                TICKETS_TO_PRINT_SHEET,
                ticket_row(event.ticket_id, &event.customer_email, &event.price),
            )
            .await
            .map_err(HandlerError::transient)?;
        Ok(vec![])
    }
}

/// Generates the ticket file and announces it with `TicketPrinted_v1`.
#[derive(HandlerName)]
pub struct PrintTicket {
    files: Arc<dyn FileApi>,
}

impl PrintTicket {
    /// Creates the handler.
    pub fn new(files: Arc<dyn FileApi>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl MessageHandler<TicketBookingConfirmed> for PrintTicket {
    async fn handle(&self, _ctx: &MessageContext, event: TicketBookingConfirmed) -> HandlerResult {
        let file_name = format!("{}-ticket.html", event.ticket_id);
        let content = format!(
            "<html><head><title>Ticket</title></head><body><h1>Ticket {}</h1><p>Price: {} {}</p></body></html>",
            event.ticket_id, event.price.amount, event.price.currency
        );

        self.files
            .upload_file(&file_name, &content)
            .await
            .map_err(HandlerError::transient)?;

        let printed = TicketPrinted {
            header: MessageHeader::with_idempotency_key(event.header.idempotency_key),
            ticket_id: event.ticket_id,
            file_name,
        };
        Ok(vec![OutgoingMessage::event(&TicketsEvent::from(printed))?])
    }
}

/// Issues a receipt and announces it with `TicketReceiptIssued_v1`.
#[derive(HandlerName)]
pub struct IssueReceipt {
    receipts: Arc<dyn ReceiptsService>,
}

impl IssueReceipt {
    /// Creates the handler.
    pub fn new(receipts: Arc<dyn ReceiptsService>) -> Self {
        Self { receipts }
    }
}

#[async_trait]
impl MessageHandler<TicketBookingConfirmed> for IssueReceipt {
    async fn handle(&self, _ctx: &MessageContext, event: TicketBookingConfirmed) -> HandlerResult {
        if event.price.currency.is_empty() {
            return Err(HandlerError::permanent(format!(
                "ticket {} has a price without currency",
                event.ticket_id
            )));
        }

        let receipt = self
            .receipts
            .issue_receipt(IssueReceiptRequest {
                idempotency_key: format!("{}{}", event.header.idempotency_key, event.ticket_id),
                ticket_id: event.ticket_id,
                price: event.price,
            })
            .await
            .map_err(HandlerError::transient)?;

        let issued = TicketReceiptIssued {
            header: MessageHeader::with_idempotency_key(event.header.idempotency_key),
            ticket_id: event.ticket_id,
            receipt_number: receipt.receipt_number,
            issued_at: receipt.issued_at,
        };
        Ok(vec![OutgoingMessage::event(&TicketsEvent::from(issued))?])
    }
}

/// Adds canceled tickets to the refund tracking sheet.
#[derive(HandlerName)]
pub struct TicketRefundToSheet {
    spreadsheets: Arc<dyn SpreadsheetsApi>,
}

impl TicketRefundToSheet {
    /// Creates the handler.
    pub fn new(spreadsheets: Arc<dyn SpreadsheetsApi>) -> Self {
        Self { spreadsheets }
    }
}

#[async_trait]
impl MessageHandler<TicketBookingCanceled> for TicketRefundToSheet {
    async fn handle(&self, _ctx: &MessageContext, event: TicketBookingCanceled) -> HandlerResult {
        self.spreadsheets
            .append_row(
                TICKETS_TO_REFUND_SHEET,
                ticket_row(event.ticket_id, &event.customer_email, &event.price),
            )
            .await
            .map_err(HandlerError::transient)?;
        Ok(vec![])
    }
}

/// Removes canceled tickets from the write model.
#[derive(HandlerName)]
pub struct RemoveCanceledTicket {
    tickets: Arc<dyn TicketRepository>,
}

impl RemoveCanceledTicket {
    /// Creates the handler.
    pub fn new(tickets: Arc<dyn TicketRepository>) -> Self {
        Self { tickets }
    }
}

#[async_trait]
impl MessageHandler<TicketBookingCanceled> for RemoveCanceledTicket {
    async fn handle(&self, _ctx: &MessageContext, event: TicketBookingCanceled) -> HandlerResult {
        self.tickets
            .remove(event.ticket_id)
            .await
            .map_err(HandlerError::transient)?;
        Ok(vec![])
    }
}

/// Books the places on Dead Nation for shows sold there.
#[derive(HandlerName)]
pub struct BookPlaceInDeadNation {
    shows: Arc<dyn ShowRepository>,
    dead_nation: Arc<dyn DeadNationApi>,
}

impl BookPlaceInDeadNation {
    /// Creates the handler.
    pub fn new(shows: Arc<dyn ShowRepository>, dead_nation: Arc<dyn DeadNationApi>) -> Self {
        Self { shows, dead_nation }
    }
}

#[async_trait]
impl MessageHandler<BookingMade> for BookPlaceInDeadNation {
    async fn handle(&self, _ctx: &MessageContext, event: BookingMade) -> HandlerResult {
        let show = self
            .shows
            .show_by_id(event.show_id)
            .await
            .map_err(HandlerError::transient)?
            .ok_or_else(|| {
                HandlerError::permanent(format!(
                    "show {} of booking {} does not exist",
                    event.show_id, event.booking_id
                ))
            })?;

        let Some(dead_nation_event_id) = show.dead_nation_id else {
            debug!("Show {} is not sold on Dead Nation", show.show_id);
            return Ok(vec![]);
        };

        info!(
            "Booking {} places on Dead Nation for booking {}",
            event.number_of_tickets, event.booking_id
        );
        self.dead_nation
            .book_in_dead_nation(DeadNationBooking {
                booking_id: event.booking_id,
                customer_email: event.customer_email,
                dead_nation_event_id,
                number_of_tickets: event.number_of_tickets,
            })
            .await
            .map_err(HandlerError::transient)?;
        Ok(vec![])
    }
}
