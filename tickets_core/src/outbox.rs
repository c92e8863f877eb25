//! The transactional outbox.
//!
//! A message is appended to the outbox through the same transaction as the business write
//! that produced it, so the message exists if and only if the write committed. The
//! [`Forwarder`](crate::forwarder::Forwarder) later moves committed records to the broker.

use crate::broker::EVENTS_TOPIC;
use crate::envelope::{CORRELATION_ID_KEY, Envelope};
use crate::message::MessageData;
use crate::router::context::inject_trace_context;
use async_trait::async_trait;
use opentelemetry::Context as TraceContext;

/// A message stored in the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// Position of the record in commit order.
    pub sequence: i64,
    /// Topic the record is forwarded to.
    pub topic: String,
    /// The message.
    pub envelope: Envelope,
    /// Whether the record was already published.
    pub forwarded: bool,
}

/// Errors returned by outbox stores.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// The storage backend failed.
    #[error("Outbox backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A record could not be (de)serialized.
    #[error("Outbox serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Commit and rollback of a store transaction.
#[async_trait]
pub trait TransactionOps: Send {
    /// Commits every write made through the transaction.
    async fn commit(self) -> Result<(), OutboxError>;

    /// Discards every write made through the transaction.
    async fn rollback(self) -> Result<(), OutboxError>;
}

/// Storage of outbox records.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// The caller's transaction. Business writes and appends go through it.
    type Transaction: TransactionOps;

    /// Starts a transaction.
    async fn begin(&self) -> Result<Self::Transaction, OutboxError>;

    /// Appends a record inside `tx`. It becomes visible once `tx` commits.
    async fn append(
        &self,
        tx: &mut Self::Transaction,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<(), OutboxError>;

    /// Up to `batch_size` committed, unforwarded records in commit order.
    async fn fetch_unforwarded(&self, batch_size: usize) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// Marks records as forwarded. Marking a forwarded record again is a no-op.
    async fn mark_forwarded(&self, sequences: &[i64]) -> Result<(), OutboxError>;
}

/// Publishes typed events into an outbox transaction.
///
/// Events carry the trace context of the caller: the one given through
/// [`with_trace_context`](Self::with_trace_context), or else the current one.
pub struct OutboxEventBus<'a, S: OutboxStore> {
    store: &'a S,
    correlation_id: Option<String>,
    trace: Option<TraceContext>,
}

impl<'a, S: OutboxStore> OutboxEventBus<'a, S> {
    /// Creates a bus writing into `store`.
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            correlation_id: None,
            trace: None,
        }
    }

    /// Stamps every published event with `correlation_id`.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Propagates `trace` instead of the current trace context.
    pub fn with_trace_context(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Appends `event` to the `events` topic inside `tx`.
    pub async fn publish<M: MessageData>(
        &self,
        tx: &mut S::Transaction,
        event: &M,
    ) -> Result<Envelope, OutboxError> {
        let trace_headers = match &self.trace {
            Some(trace) => inject_trace_context(trace),
            None => inject_trace_context(&TraceContext::current()),
        };
        let mut builder = Envelope::from_message(event)?.merge_metadata(trace_headers);
        if let Some(correlation_id) = &self.correlation_id {
            builder = builder.metadata(CORRELATION_ID_KEY, correlation_id.as_str());
        }
        let envelope = builder
            .build()
            .map_err(|e| OutboxError::Backend(Box::new(e)))?;
        self.store.append(tx, EVENTS_TOPIC, &envelope).await?;
        Ok(envelope)
    }
}
