use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use tickets_core::handlers::{
    Collaborators, DeadNationApi, DeadNationBooking, FileApi, IssueReceiptRequest,
    IssueReceiptResponse, PaymentsService, ReceiptsService, Show, ShowRepository,
    SpreadsheetsApi, Ticket, TicketRepository,
};
use tickets_core::router::handler::BoxError;

/// A receipts service remembering issued receipts by idempotency key.
#[derive(Clone, Debug, Default)]
pub struct ReceiptsServiceStub {
    issued: Arc<Mutex<HashMap<String, (IssueReceiptRequest, IssueReceiptResponse)>>>,
    voided: Arc<Mutex<Vec<(Uuid, String)>>>,
}

impl ReceiptsServiceStub {
    /// Requests that issued a receipt, one per idempotency key.
    pub async fn issued(&self) -> Vec<IssueReceiptRequest> {
        self.issued
            .lock()
            .await
            .values()
            .map(|(request, _)| request.clone())
            .collect()
    }

    /// Voided tickets with the key of each call.
    pub async fn voided(&self) -> Vec<(Uuid, String)> {
        self.voided.lock().await.clone()
    }
}

#[async_trait]
impl ReceiptsService for ReceiptsServiceStub {
    async fn issue_receipt(
        &self,
        request: IssueReceiptRequest,
    ) -> Result<IssueReceiptResponse, BoxError> {
        let mut issued = self.issued.lock().await;
        if let Some((_, response)) = issued.get(&request.idempotency_key) {
            return Ok(response.clone());
        }
        let response = IssueReceiptResponse {
            receipt_number: format!("receipt-{}", issued.len() + 1),
            issued_at: Utc::now(),
        };
        issued.insert(
            request.idempotency_key.clone(),
            (request, response.clone()),
        );
        Ok(response)
    }

    async fn void_receipt(&self, ticket_id: Uuid, idempotency_key: &str) -> Result<(), BoxError> {
        let mut voided = self.voided.lock().await;
        if !voided.iter().any(|(_, key)| key == idempotency_key) {
            voided.push((ticket_id, idempotency_key.to_string()));
        }
        Ok(())
    }
}

/// A payments service recording refunds.
#[derive(Clone, Debug, Default)]
pub struct PaymentsServiceStub {
    refunds: Arc<Mutex<Vec<(Uuid, String)>>>,
}

impl PaymentsServiceStub {
    /// Refunded tickets with the key of each call, one per key.
    pub async fn refunds(&self) -> Vec<(Uuid, String)> {
        self.refunds.lock().await.clone()
    }
}

#[async_trait]
impl PaymentsService for PaymentsServiceStub {
    async fn refund_payment(&self, ticket_id: Uuid, idempotency_key: &str) -> Result<(), BoxError> {
        let mut refunds = self.refunds.lock().await;
        if !refunds.iter().any(|(_, key)| key == idempotency_key) {
            refunds.push((ticket_id, idempotency_key.to_string()));
        }
        Ok(())
    }
}

/// A file store keeping files in a map.
#[derive(Clone, Debug, Default)]
pub struct FilesApiStub {
    files: Arc<Mutex<HashMap<String, String>>>,
}

impl FilesApiStub {
    /// Content of an uploaded file.
    pub async fn file(&self, file_id: &str) -> Option<String> {
        self.files.lock().await.get(file_id).cloned()
    }
}

#[async_trait]
impl FileApi for FilesApiStub {
    async fn upload_file(&self, file_id: &str, content: &str) -> Result<(), BoxError> {
        self.files
            .lock()
            .await
            .insert(file_id.to_string(), content.to_string());
        Ok(())
    }
}

/// A spreadsheets API recording appended rows.
#[derive(Clone, Debug, Default)]
pub struct SpreadsheetsApiStub {
    rows: Arc<Mutex<HashMap<String, Vec<Vec<String>>>>>,
}

impl SpreadsheetsApiStub {
    /// Rows appended to `sheet_name`, in order.
    pub async fn rows(&self, sheet_name: &str) -> Vec<Vec<String>> {
        self.rows
            .lock()
            .await
            .get(sheet_name)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SpreadsheetsApi for SpreadsheetsApiStub {
    async fn append_row(&self, sheet_name: &str, row: Vec<String>) -> Result<(), BoxError> {
        self.rows
            .lock()
            .await
            .entry(sheet_name.to_string())
            .or_default()
            .push(row);
        Ok(())
    }
}

/// A Dead Nation API recording one booking per booking id.
#[derive(Clone, Debug, Default)]
pub struct DeadNationStub {
    bookings: Arc<Mutex<Vec<DeadNationBooking>>>,
}

impl DeadNationStub {
    /// Bookings placed so far.
    pub async fn bookings(&self) -> Vec<DeadNationBooking> {
        self.bookings.lock().await.clone()
    }
}

#[async_trait]
impl DeadNationApi for DeadNationStub {
    async fn book_in_dead_nation(&self, booking: DeadNationBooking) -> Result<(), BoxError> {
        let mut bookings = self.bookings.lock().await;
        if !bookings.iter().any(|b| b.booking_id == booking.booking_id) {
            bookings.push(booking);
        }
        Ok(())
    }
}

/// An in-memory tickets write model.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTickets(Arc<Mutex<HashMap<Uuid, Ticket>>>);

impl InMemoryTickets {
    /// The stored ticket.
    pub async fn get(&self, ticket_id: Uuid) -> Option<Ticket> {
        self.0.lock().await.get(&ticket_id).cloned()
    }
}

#[async_trait]
impl TicketRepository for InMemoryTickets {
    async fn add(&self, ticket: Ticket) -> Result<(), BoxError> {
        self.0.lock().await.insert(ticket.ticket_id, ticket);
        Ok(())
    }

    async fn remove(&self, ticket_id: Uuid) -> Result<(), BoxError> {
        self.0.lock().await.remove(&ticket_id);
        Ok(())
    }
}

/// An in-memory catalogue of shows.
#[derive(Clone, Debug, Default)]
pub struct InMemoryShows(Arc<Mutex<HashMap<Uuid, Show>>>);

impl InMemoryShows {
    /// Adds or replaces a show.
    pub async fn insert(&self, show: Show) {
        self.0.lock().await.insert(show.show_id, show);
    }
}

#[async_trait]
impl ShowRepository for InMemoryShows {
    async fn show_by_id(&self, show_id: Uuid) -> Result<Option<Show>, BoxError> {
        Ok(self.0.lock().await.get(&show_id).cloned())
    }
}

/// Every collaborator stubbed in memory, with handles to inspect the calls.
#[derive(Clone, Debug, Default)]
pub struct StubCollaborators {
    /// Receipts.
    pub receipts: ReceiptsServiceStub,
    /// Payments.
    pub payments: PaymentsServiceStub,
    /// File storage.
    pub files: FilesApiStub,
    /// Spreadsheets.
    pub spreadsheets: SpreadsheetsApiStub,
    /// Dead Nation.
    pub dead_nation: DeadNationStub,
    /// Tickets write model.
    pub tickets: InMemoryTickets,
    /// Shows.
    pub shows: InMemoryShows,
}

impl StubCollaborators {
    /// Creates empty stubs.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stubs as the collaborators the business handlers expect.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            receipts: Arc::new(self.receipts.clone()),
            payments: Arc::new(self.payments.clone()),
            files: Arc::new(self.files.clone()),
            spreadsheets: Arc::new(self.spreadsheets.clone()),
            dead_nation: Arc::new(self.dead_nation.clone()),
            tickets: Arc::new(self.tickets.clone()),
            shows: Arc::new(self.shows.clone()),
        }
    }
}
