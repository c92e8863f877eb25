//! Typed publishing of events and commands straight to a broker.

use crate::broker::{BrokerError, COMMANDS_TOPIC, EVENTS_TOPIC, Publisher};
use crate::envelope::{CORRELATION_ID_KEY, Envelope, Metadata};
use crate::message::MessageData;
use crate::router::context::inject_trace_context;
use opentelemetry::Context as TraceContext;
use std::sync::Arc;

fn encode<M: MessageData>(message: &M, metadata: Metadata) -> Result<Envelope, BrokerError> {
    Envelope::from_message(message)?
        .merge_metadata(metadata)
        .build()
        .map_err(|e| BrokerError::Backend(Box::new(e)))
}

/// Correlation id plus the W3C headers of the current trace context.
fn correlation(correlation_id: Option<&str>) -> Metadata {
    let mut metadata = inject_trace_context(&TraceContext::current());
    if let Some(id) = correlation_id {
        metadata.insert(CORRELATION_ID_KEY.to_string(), id.to_string());
    }
    metadata
}

/// Publishes typed events to the `events` topic.
#[derive(Clone)]
pub struct EventBus {
    publisher: Arc<dyn Publisher>,
}

impl EventBus {
    /// Creates a bus over `publisher`.
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Publishes `event`, returning the envelope that was sent.
    pub async fn publish<M: MessageData>(
        &self,
        event: &M,
        correlation_id: Option<&str>,
    ) -> Result<Envelope, BrokerError> {
        let envelope = encode(event, correlation(correlation_id))?;
        self.publisher
            .publish(EVENTS_TOPIC, vec![envelope.clone()])
            .await?;
        Ok(envelope)
    }
}

/// Sends typed commands to the `commands` topic.
#[derive(Clone)]
pub struct CommandBus {
    publisher: Arc<dyn Publisher>,
}

impl CommandBus {
    /// Creates a bus over `publisher`.
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Sends `command`, returning the envelope that was sent.
    pub async fn send<M: MessageData>(
        &self,
        command: &M,
        correlation_id: Option<&str>,
    ) -> Result<Envelope, BrokerError> {
        let envelope = encode(command, correlation(correlation_id))?;
        self.publisher
            .publish(COMMANDS_TOPIC, vec![envelope.clone()])
            .await?;
        Ok(envelope)
    }
}
