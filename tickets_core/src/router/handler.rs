//! Handler contract, the failure taxonomy and the typed-handler adapter.

use super::context::MessageContext;
use crate::broker::{COMMANDS_TOPIC, EVENTS_TOPIC};
use crate::envelope::{Envelope, Metadata};
use crate::message::{MessageData, NamedMessage};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;

/// A boxed, thread-safe error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of handling one message: follow-up messages to publish, or a classified failure.
pub type HandlerResult = Result<Vec<OutgoingMessage>, HandlerError>;

/// Why a handler failed, which decides whether the message is acknowledged or redelivered.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Infrastructure hiccup (I/O, timeout, dependency down). Retried, then nacked.
    #[error("Transient failure: {0}")]
    Transient(#[source] BoxError),

    /// The message violates a business precondition and can never succeed.
    /// Acknowledged without processing and alerted.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// Undecodable payload or unexpected type. Acknowledged after logging the payload.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A referenced aggregate does not exist yet. Nacked so it is redelivered later.
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// The handler panicked. Treated as transient.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Wraps any error as transient.
    pub fn transient(err: impl Into<BoxError>) -> Self {
        Self::Transient(err.into())
    }

    /// Creates a permanent failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    /// Creates a malformed-message failure.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }

    /// Creates a missing-dependency failure.
    pub fn missing_dependency(reason: impl Into<String>) -> Self {
        Self::MissingDependency(reason.into())
    }

    /// Whether retrying or redelivering can make the message succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::MissingDependency(_) | Self::Panicked(_)
        )
    }

    /// Short label used in logs and alerts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Malformed(_) => "malformed",
            Self::MissingDependency(_) => "missing_dependency",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// A message a handler wants published once it succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Destination topic.
    pub topic: String,
    /// The message.
    pub envelope: Envelope,
}

impl OutgoingMessage {
    /// Creates an outgoing message for an arbitrary topic.
    pub fn new(topic: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            topic: topic.into(),
            envelope,
        }
    }

    /// Encodes a typed event for the `events` topic.
    pub fn event<M: MessageData>(message: &M) -> Result<Self, HandlerError> {
        Self::typed(EVENTS_TOPIC, message)
    }

    /// Encodes a typed command for the `commands` topic.
    pub fn command<M: MessageData>(message: &M) -> Result<Self, HandlerError> {
        Self::typed(COMMANDS_TOPIC, message)
    }

    fn typed<M: MessageData>(topic: &str, message: &M) -> Result<Self, HandlerError> {
        let envelope = Envelope::from_message(message)
            .map_err(|e| HandlerError::permanent(format!("cannot encode {}: {}", message.message_name(), e)))?
            .build()
            .map_err(|e| HandlerError::permanent(e.to_string()))?;
        Ok(Self::new(topic, envelope))
    }

    /// Fills in metadata entries that are absent, keeping the ones already set.
    pub fn with_default_metadata(self, defaults: Metadata) -> Self {
        Self {
            topic: self.topic,
            envelope: self.envelope.with_default_metadata(defaults),
        }
    }
}

/// Handles one raw message.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes the message. The same message may be handed over more than once.
    async fn handle(&self, ctx: MessageContext, envelope: &Envelope) -> HandlerResult;
}

#[async_trait]
impl<T: Handler + ?Sized> Handler for Arc<T> {
    async fn handle(&self, ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        (**self).handle(ctx, envelope).await
    }
}

/// Handles one decoded message of type `E`.
#[async_trait]
pub trait MessageHandler<E: Send + 'static>: Send + Sync {
    /// Processes the decoded message.
    async fn handle(&self, ctx: &MessageContext, message: E) -> HandlerResult;
}

#[async_trait]
impl<E, T> MessageHandler<E> for Arc<T>
where
    E: Send + 'static,
    T: MessageHandler<E> + ?Sized,
{
    async fn handle(&self, ctx: &MessageContext, message: E) -> HandlerResult {
        (**self).handle(ctx, message).await
    }
}

/// What to do with a message whose name differs from the handler's message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    /// Treat it as malformed. Used on per-type topics where only one type is expected.
    Reject,
    /// Acknowledge it silently. Used on shared topics such as `commands`.
    Skip,
}

/// Adapts a [`MessageHandler`] for one payload type of catalogue `M` into a raw [`Handler`].
pub struct Decoded<M, E, H> {
    handler: H,
    on_mismatch: Mismatch,
    _marker: PhantomData<fn() -> (M, E)>,
}

impl<M, E, H> Decoded<M, E, H> {
    /// Wraps `handler`.
    pub fn new(handler: H, on_mismatch: Mismatch) -> Self {
        Self {
            handler,
            on_mismatch,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<M, E, H> Handler for Decoded<M, E, H>
where
    M: MessageData,
    E: TryFrom<M> + NamedMessage + Send + 'static,
    H: MessageHandler<E>,
{
    async fn handle(&self, ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        let Some(name) = envelope.event_name() else {
            return Err(HandlerError::malformed("message has no name"));
        };

        if name != E::NAME {
            return match self.on_mismatch {
                Mismatch::Skip => {
                    log::debug!(
                        "Skipping '{}' in handler {}: expects '{}'",
                        name,
                        ctx.handler_name(),
                        E::NAME
                    );
                    Ok(vec![])
                }
                Mismatch::Reject => Err(HandlerError::malformed(format!(
                    "expected '{}', got '{}'",
                    E::NAME,
                    name
                ))),
            };
        }

        let message =
            M::decode(name, envelope.payload()).map_err(|e| HandlerError::malformed(e.to_string()))?;
        let message = <E as TryFrom<M>>::try_from(message)
            .map_err(|_| HandlerError::malformed(format!("'{}' did not decode to its own type", name)))?;

        self.handler.handle(&ctx, message).await
    }
}
