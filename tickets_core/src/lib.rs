//! # Tickets core
//!
//! Contracts and engine of the ticketing messaging pipeline: the transactional outbox and
//! its forwarder, the broker traits, the router with its middleware chain, the events
//! splitter and data lake sink, and the operations read-model projector.

#![deny(missing_docs)]

extern crate self as tickets_core;

pub mod broker;
pub mod bus;
pub mod envelope;
pub mod events;
pub mod forwarder;
pub mod handlers;
pub mod ledger;
mod message;
pub mod ops_booking;
pub mod outbox;
pub mod retry;
pub mod router;
pub mod shutdown;
pub mod splitter;

#[doc(hidden)]
pub use serde_json;

pub use message::{DecodeError, HandlerName, MessageData, NamedMessage, UnexpectedMessage};
pub use tickets_derive::{HandlerName, MessageData};

pub mod prelude {
    //! The prelude module for the `tickets_core` crate.
    pub use super::broker::{
        BrokerError, COMMANDS_TOPIC, DEAD_LETTER_TOPIC, Delivery, DeliveryStream, EVENTS_TOPIC,
        Outcome, Publisher, Subscriber, consumer_group, event_topic,
    };
    pub use super::bus::{CommandBus, EventBus};
    pub use super::envelope::{Envelope, EnvelopeBuilder, Metadata};
    pub use super::events::{MessageHeader, Money, TicketsCommand, TicketsEvent};
    pub use super::forwarder::{Forwarder, ForwarderConfig, ForwarderError};
    pub use super::ledger::{Deduplicate, LedgerError, ProcessedMessages};
    pub use super::ops_booking::{
        OpsBooking, OpsBookingProjector, OpsBookingStore, OpsTicket, ReadModelError,
    };
    pub use super::outbox::{
        OutboxError, OutboxEventBus, OutboxRecord, OutboxStore, TransactionOps,
    };
    pub use super::retry::RetryConfig;
    pub use super::router::context::MessageContext;
    pub use super::router::handler::{
        Handler, HandlerError, HandlerResult, MessageHandler, OutgoingMessage,
    };
    pub use super::router::middleware::Middleware;
    pub use super::router::processor::{CommandProcessor, EventProcessor};
    pub use super::router::{
        Alert, AlertCallback, AlertKind, ExhaustedPolicy, Router, RouterConfig, RouterError,
    };
    pub use super::shutdown::{Readiness, Shutdown, ShutdownTrigger, shutdown_channel};
    pub use super::splitter::{DataLake, DataLakeError, DataLakeEvent, DataLakeSink, EventsSplitter};
    pub use super::{DecodeError, HandlerName, MessageData, NamedMessage};
}
