//! Broker contracts: publishing, consumer-group subscriptions and per-delivery acknowledgement.
//!
//! A [`Subscriber`] hands out [`Delivery`] values one at a time over a stream. The broker
//! waits for each delivery to be settled before moving its consumer position, so ordering
//! is preserved within one `(consumer group, topic)` subscription.

use crate::envelope::Envelope;
use async_trait::async_trait;
use futures_core::Stream;
use std::pin::Pin;
use tokio::sync::oneshot;

/// Ingress topic for every domain event.
pub const EVENTS_TOPIC: &str = "events";
/// Topic for commands.
pub const COMMANDS_TOPIC: &str = "commands";
/// Topic receiving messages parked after exhausting their retries.
pub const DEAD_LETTER_TOPIC: &str = "dead_letter";

/// The per-type topic an event is split into, `events.<EventName>`.
pub fn event_topic(event_name: &str) -> String {
    format!("{}.{}", EVENTS_TOPIC, event_name)
}

/// The durable consumer group of a handler, `<service>.<handler>`.
pub fn consumer_group(service_name: &str, handler_name: &str) -> String {
    format!("{}.{}", service_name, handler_name)
}

/// Errors returned by broker implementations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The underlying storage or connection failed.
    #[error("Broker backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A message could not be serialized for the wire.
    #[error("Broker serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The broker was closed.
    #[error("Broker is closed")]
    Closed,
}

/// Publishes messages to a topic.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes all messages, in order. Either every message is accepted or an error is
    /// returned.
    async fn publish(&self, topic: &str, messages: Vec<Envelope>) -> Result<(), BrokerError>;
}

/// A stream of deliveries for one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Subscribes a consumer group to a topic.
///
/// Consumers sharing a group share the topic: each message is delivered to one of them.
/// Dropping the stream ends the subscription and hands any unsettled message back.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Opens a subscription starting at the group's persisted position.
    async fn subscribe(&self, topic: &str, consumer_group: &str)
    -> Result<DeliveryStream, BrokerError>;
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Remove the message from the group's queue.
    Ack,
    /// Redeliver the message.
    Nack,
}

/// Lifecycle of a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Handed to the consumer, not yet picked up.
    Received,
    /// The handler chain is running.
    Processing,
    /// Acknowledged.
    Acked,
    /// Negatively acknowledged; the broker will redeliver.
    Nacked,
}

/// One message handed to a consumer, waiting to be settled.
///
/// Dropping an unsettled delivery negatively acknowledges it, so a crashed or cancelled
/// consumer never loses a message.
#[derive(Debug)]
pub struct Delivery {
    topic: String,
    envelope: Envelope,
    attempt: u32,
    state: DeliveryState,
    reply: Option<oneshot::Sender<Outcome>>,
}

impl Delivery {
    /// Creates a delivery and the receiver the broker awaits for its outcome.
    ///
    /// `attempt` counts deliveries of this message to this group, starting at 1.
    pub fn new(
        topic: impl Into<String>,
        envelope: Envelope,
        attempt: u32,
    ) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let delivery = Self {
            topic: topic.into(),
            envelope,
            attempt,
            state: DeliveryState::Received,
            reply: Some(tx),
        };
        (delivery, rx)
    }

    /// The topic the message was read from.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The delivered message.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// How many times this message was delivered to this group, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Marks the delivery as being processed.
    pub fn start_processing(&mut self) {
        if self.state == DeliveryState::Received {
            self.state = DeliveryState::Processing;
        }
    }

    /// Acknowledges the delivery.
    pub fn ack(mut self) {
        self.settle(Outcome::Ack);
    }

    /// Negatively acknowledges the delivery.
    pub fn nack(mut self) {
        self.settle(Outcome::Nack);
    }

    fn settle(&mut self, outcome: Outcome) {
        if let Some(reply) = self.reply.take() {
            self.state = match outcome {
                Outcome::Ack => DeliveryState::Acked,
                Outcome::Nack => DeliveryState::Nacked,
            };
            // the broker side may be gone during shutdown
            let _ = reply.send(outcome);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.settle(Outcome::Nack);
    }
}

/// Awaits the outcome of a delivery. A vanished consumer counts as a nack.
pub async fn await_outcome(rx: oneshot::Receiver<Outcome>) -> Outcome {
    rx.await.unwrap_or(Outcome::Nack)
}
