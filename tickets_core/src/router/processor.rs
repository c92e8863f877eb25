//! Typed registration of handlers on the event and command topics.

use super::handler::{Decoded, MessageHandler, Mismatch};
use super::{Router, RouterError};
use crate::broker::{COMMANDS_TOPIC, Subscriber, event_topic};
use crate::message::{HandlerName, MessageData, NamedMessage};
use std::marker::PhantomData;
use std::sync::Arc;

/// Registers handlers for the events of catalogue `M`.
///
/// Each handler consumes the per-type topic `events.<EventName>` of the payload type it
/// handles. Anything else arriving there is treated as malformed.
pub struct EventProcessor<M> {
    subscriber: Arc<dyn Subscriber>,
    _catalogue: PhantomData<fn() -> M>,
}

impl<M: MessageData> EventProcessor<M> {
    /// Creates a processor subscribing through `subscriber`.
    pub fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            subscriber,
            _catalogue: PhantomData,
        }
    }

    /// Registers `handler` for the events of type `E` under `name`.
    pub fn add_handler<E, H>(
        &self,
        router: &mut Router,
        name: impl Into<String>,
        handler: H,
    ) -> Result<(), RouterError>
    where
        E: TryFrom<M> + NamedMessage + Send + 'static,
        H: MessageHandler<E> + 'static,
    {
        router.add_handler(
            name,
            event_topic(E::NAME),
            self.subscriber.clone(),
            Decoded::<M, E, H>::new(handler, Mismatch::Reject),
        )?;
        Ok(())
    }

    /// Registers `handler` under the name it derives.
    pub fn add_named<E, H>(&self, router: &mut Router, handler: H) -> Result<(), RouterError>
    where
        E: TryFrom<M> + NamedMessage + Send + 'static,
        H: MessageHandler<E> + HandlerName + 'static,
    {
        let name = handler.handler_name();
        self.add_handler::<E, H>(router, name, handler)
    }
}

/// Registers handlers for the commands of catalogue `M`.
///
/// All commands share the `commands` topic; a handler skips commands of other types.
pub struct CommandProcessor<M> {
    subscriber: Arc<dyn Subscriber>,
    _catalogue: PhantomData<fn() -> M>,
}

impl<M: MessageData> CommandProcessor<M> {
    /// Creates a processor subscribing through `subscriber`.
    pub fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            subscriber,
            _catalogue: PhantomData,
        }
    }

    /// Registers `handler` for the commands of type `C` under `name`.
    pub fn add_handler<C, H>(
        &self,
        router: &mut Router,
        name: impl Into<String>,
        handler: H,
    ) -> Result<(), RouterError>
    where
        C: TryFrom<M> + NamedMessage + Send + 'static,
        H: MessageHandler<C> + 'static,
    {
        router.add_handler(
            name,
            COMMANDS_TOPIC,
            self.subscriber.clone(),
            Decoded::<M, C, H>::new(handler, Mismatch::Skip),
        )?;
        Ok(())
    }

    /// Registers `handler` under the name it derives.
    pub fn add_named<C, H>(&self, router: &mut Router, handler: H) -> Result<(), RouterError>
    where
        C: TryFrom<M> + NamedMessage + Send + 'static,
        H: MessageHandler<C> + HandlerName + 'static,
    {
        let name = handler.handler_name();
        self.add_handler::<C, H>(router, name, handler)
    }
}
