//! The ticketing events and commands exchanged through the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tickets_derive::MessageData;
use uuid::Uuid;

/// Header shared by every event and command payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Id of the event, used as the archive key.
    pub id: Uuid,
    /// When the event was published.
    pub published_at: DateTime<Utc>,
    /// Key forwarded to external collaborators so retried calls are deduplicated.
    #[serde(default)]
    pub idempotency_key: String,
}

impl MessageHeader {
    /// A header with a fresh id and random idempotency key, published now.
    pub fn new() -> Self {
        Self::with_idempotency_key(Uuid::new_v4().to_string())
    }

    /// A header with a fresh id, published now.
    pub fn with_idempotency_key(idempotency_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            published_at: Utc::now(),
            idempotency_key: idempotency_key.into(),
        }
    }
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// An amount of money. The amount is kept as its decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Decimal amount, such as `"49.90"`.
    pub amount: String,
    /// ISO currency code.
    pub currency: String,
}

/// A customer booked places for a show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingMade {
    /// Common header.
    pub header: MessageHeader,
    /// How many places were booked.
    pub number_of_tickets: u32,
    /// The booking.
    pub booking_id: Uuid,
    /// Customer contact.
    pub customer_email: String,
    /// The show the places belong to.
    pub show_id: Uuid,
}

/// A ticket of a booking was confirmed and paid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketBookingConfirmed {
    /// Common header.
    pub header: MessageHeader,
    /// The ticket.
    pub ticket_id: Uuid,
    /// Customer contact.
    pub customer_email: String,
    /// Ticket price.
    pub price: Money,
    /// The booking.
    pub booking_id: Uuid,
}

/// A ticket booking was canceled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketBookingCanceled {
    /// Common header.
    pub header: MessageHeader,
    /// The ticket.
    pub ticket_id: Uuid,
    /// Customer contact.
    pub customer_email: String,
    /// Ticket price.
    pub price: Money,
}

/// A ticket was refunded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketRefunded {
    /// Common header.
    pub header: MessageHeader,
    /// The ticket.
    pub ticket_id: Uuid,
}

/// A ticket file was generated and uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketPrinted {
    /// Common header.
    pub header: MessageHeader,
    /// The ticket.
    pub ticket_id: Uuid,
    /// Name of the uploaded file.
    pub file_name: String,
}

/// A receipt was issued for a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketReceiptIssued {
    /// Common header.
    pub header: MessageHeader,
    /// The ticket.
    pub ticket_id: Uuid,
    /// Number assigned by the receipts service.
    pub receipt_number: String,
    /// When the receipt was issued.
    pub issued_at: DateTime<Utc>,
}

/// Every event published by the ticketing service.
#[derive(Debug, Clone, PartialEq, MessageData)]
pub enum TicketsEvent {
    /// `BookingMade_v1`
    #[message(name = "BookingMade_v1")]
    BookingMade(BookingMade),
    /// `TicketBookingConfirmed_v1`
    #[message(name = "TicketBookingConfirmed_v1")]
    TicketBookingConfirmed(TicketBookingConfirmed),
    /// `TicketBookingCanceled_v1`
    #[message(name = "TicketBookingCanceled_v1")]
    TicketBookingCanceled(TicketBookingCanceled),
    /// `TicketRefunded_v1`
    #[message(name = "TicketRefunded_v1")]
    TicketRefunded(TicketRefunded),
    /// `TicketPrinted_v1`
    #[message(name = "TicketPrinted_v1")]
    TicketPrinted(TicketPrinted),
    /// `TicketReceiptIssued_v1`
    #[message(name = "TicketReceiptIssued_v1")]
    TicketReceiptIssued(TicketReceiptIssued),
}

impl TicketsEvent {
    /// The header of the wrapped event.
    pub fn header(&self) -> &MessageHeader {
        match self {
            TicketsEvent::BookingMade(e) => &e.header,
            TicketsEvent::TicketBookingConfirmed(e) => &e.header,
            TicketsEvent::TicketBookingCanceled(e) => &e.header,
            TicketsEvent::TicketRefunded(e) => &e.header,
            TicketsEvent::TicketPrinted(e) => &e.header,
            TicketsEvent::TicketReceiptIssued(e) => &e.header,
        }
    }
}

/// Asks for a ticket to be refunded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundTicket {
    /// Common header.
    pub header: MessageHeader,
    /// The ticket.
    pub ticket_id: Uuid,
}

/// Every command handled by the ticketing service.
#[derive(Debug, Clone, PartialEq, MessageData)]
pub enum TicketsCommand {
    /// `RefundTicket`
    #[message(name = "RefundTicket")]
    RefundTicket(RefundTicket),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DecodeError, MessageData, NamedMessage};

    fn confirmed() -> TicketBookingConfirmed {
        TicketBookingConfirmed {
            header: MessageHeader::with_idempotency_key("key-1"),
            ticket_id: Uuid::new_v4(),
            customer_email: "email@example.com".to_string(),
            price: Money {
                amount: "50.30".to_string(),
                currency: "EUR".to_string(),
            },
            booking_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn wire_names_carry_the_version_suffix() {
        assert_eq!(BookingMade::NAME, "BookingMade_v1");
        assert_eq!(TicketReceiptIssued::NAME, "TicketReceiptIssued_v1");
        assert_eq!(RefundTicket::NAME, "RefundTicket");
        assert_eq!(TicketsEvent::message_names().len(), 6);
    }

    #[test]
    fn decode_picks_the_variant_by_name() {
        let event = TicketsEvent::from(confirmed());
        let payload = event.encode().unwrap();

        let decoded = TicketsEvent::decode("TicketBookingConfirmed_v1", &payload).unwrap();

        assert_eq!(decoded, event);
        assert_eq!(decoded.message_name(), "TicketBookingConfirmed_v1");
        assert_eq!(decoded.header().idempotency_key, "key-1");
    }

    #[test]
    fn decode_rejects_unknown_names_and_bad_payloads() {
        assert!(matches!(
            TicketsEvent::decode("TicketLost_v1", b"{}"),
            Err(DecodeError::UnknownMessage(name)) if name == "TicketLost_v1"
        ));
        assert!(matches!(
            TicketsEvent::decode("BookingMade_v1", b"{\"booking_id\": 1}"),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn try_from_reports_the_variant_found() {
        let event = TicketsEvent::from(confirmed());
        let err = TicketPrinted::try_from(event).unwrap_err();
        assert_eq!(err.expected, "TicketPrinted_v1");
        assert_eq!(err.found, "TicketBookingConfirmed_v1");
    }

    #[test]
    fn header_tolerates_missing_idempotency_key() {
        let json = r#"{
            "header": {"id": "8a2b6f0e-3f5e-4c1a-9d1e-0c2f7a1b2c3d", "published_at": "2024-01-01T10:00:00Z"},
            "ticket_id": "1b4e28ba-2fa1-11d2-883f-0016d3cca427"
        }"#;
        let decoded = TicketsEvent::decode("TicketRefunded_v1", json.as_bytes()).unwrap();
        assert_eq!(decoded.header().idempotency_key, "");
    }
}
