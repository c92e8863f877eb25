//! Consumers of the `events` ingress topic: the splitter that fans events out to per-type
//! topics, and the sink that archives every event in the data lake.
//!
//! Both run on their own consumer group, so one falling behind never blocks the other.

use crate::broker::event_topic;
use crate::envelope::Envelope;
use crate::events::MessageHeader;
use crate::router::context::MessageContext;
use crate::router::handler::{Handler, HandlerError, HandlerResult, OutgoingMessage};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Name of the splitter handler.
pub const EVENTS_SPLITTER: &str = "events_splitter";
/// Name of the data lake handler.
pub const STORE_TO_DATA_LAKE: &str = "store_to_data_lake";

/// Republishes every event unchanged to `events.<EventName>`.
///
/// Routing reads the `name` metadata only. The payload is never decoded, so schema changes
/// cannot break the splitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventsSplitter;

#[async_trait]
impl Handler for EventsSplitter {
    async fn handle(&self, _ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        let Some(name) = envelope.event_name() else {
            return Err(HandlerError::permanent("cannot get event name from message"));
        };
        Ok(vec![OutgoingMessage::new(event_topic(name), envelope.clone())])
    }
}

/// Errors returned by data lake stores.
#[derive(Debug, thiserror::Error)]
pub enum DataLakeError {
    /// The storage backend failed.
    #[error("Data lake backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// An archived event.
#[derive(Debug, Clone, PartialEq)]
pub struct DataLakeEvent {
    /// Id taken from the event header.
    pub event_id: Uuid,
    /// The event header.
    pub header: MessageHeader,
    /// The event name.
    pub event_name: String,
    /// The raw payload, byte for byte.
    pub payload: Vec<u8>,
}

/// Append-only archive of events.
#[async_trait]
pub trait DataLake: Send + Sync {
    /// Stores an event. Storing an event id that already exists is a no-op.
    async fn store_event(&self, event: DataLakeEvent) -> Result<(), DataLakeError>;

    /// Every archived event, oldest first.
    async fn events(&self) -> Result<Vec<DataLakeEvent>, DataLakeError>;
}

#[derive(Deserialize)]
struct HeaderOnly {
    header: MessageHeader,
}

/// Archives every event in a [`DataLake`].
pub struct DataLakeSink {
    data_lake: Arc<dyn DataLake>,
}

impl DataLakeSink {
    /// Creates a sink writing to `data_lake`.
    pub fn new(data_lake: Arc<dyn DataLake>) -> Self {
        Self { data_lake }
    }
}

#[async_trait]
impl Handler for DataLakeSink {
    async fn handle(&self, _ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        let Some(name) = envelope.event_name() else {
            return Err(HandlerError::permanent("cannot get event name from message"));
        };
        let HeaderOnly { header } = serde_json::from_slice(envelope.payload())
            .map_err(|e| HandlerError::malformed(format!("cannot unmarshal event header: {}", e)))?;

        debug!(
            "Storing event {} ({}) in the data lake message_id={}",
            header.id,
            name,
            envelope.id()
        );
        self.data_lake
            .store_event(DataLakeEvent {
                event_id: header.id,
                header,
                event_name: name.to_string(),
                payload: envelope.payload().to_vec(),
            })
            .await
            .map_err(HandlerError::transient)?;

        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::NAME_KEY;

    fn ctx() -> MessageContext {
        MessageContext::new("events", EVENTS_SPLITTER, 1)
    }

    #[tokio::test]
    async fn splitter_routes_by_name_without_decoding() {
        let envelope = Envelope::builder()
            .payload("not even json")
            .metadata(NAME_KEY, "TicketPrinted_v1")
            .build()
            .unwrap();

        let out = EventsSplitter.handle(ctx(), &envelope).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "events.TicketPrinted_v1");
        assert_eq!(out[0].envelope, envelope);
    }

    #[tokio::test]
    async fn splitter_rejects_unnamed_events_permanently() {
        let envelope = Envelope::builder().payload("{}").build().unwrap();

        let result = EventsSplitter.handle(ctx(), &envelope).await;

        assert!(matches!(result, Err(HandlerError::Permanent(_))));
    }
}
