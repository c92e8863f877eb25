use super::{PaymentsService, ReceiptsService};
use crate::events::{MessageHeader, RefundTicket, TicketRefunded, TicketsEvent};
use crate::router::context::MessageContext;
use crate::router::handler::{HandlerError, HandlerResult, MessageHandler, OutgoingMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tickets_derive::HandlerName;

/// Voids the receipt, refunds the payment and announces `TicketRefunded_v1`.
///
/// Both calls reuse the command's idempotency key, so a redelivered command is safe.
#[derive(HandlerName)]
pub struct RefundTicketHandler {
    receipts: Arc<dyn ReceiptsService>,
    payments: Arc<dyn PaymentsService>,
}

impl RefundTicketHandler {
    /// Creates the handler.
    pub fn new(receipts: Arc<dyn ReceiptsService>, payments: Arc<dyn PaymentsService>) -> Self {
        Self { receipts, payments }
    }
}

#[async_trait]
impl MessageHandler<RefundTicket> for RefundTicketHandler {
    async fn handle(&self, _ctx: &MessageContext, command: RefundTicket) -> HandlerResult {
        let key = command.header.idempotency_key;

        self.receipts
            .void_receipt(command.ticket_id, &key)
            .await
            .map_err(HandlerError::transient)?;
        self.payments
            .refund_payment(command.ticket_id, &key)
            .await
            .map_err(HandlerError::transient)?;

        let refunded = TicketRefunded {
            header: MessageHeader::with_idempotency_key(key),
            ticket_id: command.ticket_id,
        };
        Ok(vec![OutgoingMessage::event(&TicketsEvent::from(refunded))?])
    }
}
