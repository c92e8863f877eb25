//! Processed-message ledger for handlers whose effect is not naturally idempotent.

use crate::envelope::Envelope;
use crate::router::context::MessageContext;
use crate::router::handler::{BoxError, Handler, HandlerError, HandlerResult};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use uuid::Uuid;

/// Errors returned by ledgers.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The storage backend failed.
    #[error("Ledger backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Remembers which messages a handler already processed.
#[async_trait]
pub trait ProcessedMessages: Send + Sync {
    /// Whether `handler_name` already processed `message_id`.
    async fn is_processed(&self, handler_name: &str, message_id: Uuid) -> Result<bool, LedgerError>;

    /// Records that `handler_name` processed `message_id`. Recording twice is a no-op.
    async fn mark_processed(&self, handler_name: &str, message_id: Uuid) -> Result<(), LedgerError>;
}

#[async_trait]
impl<T: ProcessedMessages + ?Sized> ProcessedMessages for Arc<T> {
    async fn is_processed(&self, handler_name: &str, message_id: Uuid) -> Result<bool, LedgerError> {
        (**self).is_processed(handler_name, message_id).await
    }

    async fn mark_processed(&self, handler_name: &str, message_id: Uuid) -> Result<(), LedgerError> {
        (**self).mark_processed(handler_name, message_id).await
    }
}

/// Skips messages the wrapped handler already processed.
///
/// The message is marked once the router published the handler's follow-up messages, so
/// a delivery nacked because its follow-ups could not be published runs the handler
/// again. A crash before marking also means the handler runs again: the guarantee is
/// "at most one success", not "at most one call".
pub struct Deduplicate<H, L> {
    handler: H,
    ledger: Arc<L>,
}

impl<H, L> Deduplicate<H, L> {
    /// Wraps `handler`, recording in `ledger`.
    pub fn new(handler: H, ledger: L) -> Self {
        Self {
            handler,
            ledger: Arc::new(ledger),
        }
    }
}

#[async_trait]
impl<H, L> Handler for Deduplicate<H, L>
where
    H: Handler,
    L: ProcessedMessages + 'static,
{
    async fn handle(&self, ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        let handler_name = ctx.handler_name().to_string();
        let message_id = envelope.id();

        if self
            .ledger
            .is_processed(&handler_name, message_id)
            .await
            .map_err(HandlerError::transient)?
        {
            debug!(
                "Message {} already processed by {}, skipping",
                message_id, handler_name
            );
            return Ok(vec![]);
        }

        let messages = self.handler.handle(ctx.clone(), envelope).await?;

        let ledger = Arc::clone(&self.ledger);
        ctx.after_publish(Box::new(move || {
            Box::pin(async move {
                ledger
                    .mark_processed(&handler_name, message_id)
                    .await
                    .map_err(BoxError::from)
            })
        }))
        .await;

        Ok(messages)
    }
}
