//! The processing context that travels alongside a message through the middleware chain.

use super::handler::BoxError;
use crate::envelope::Metadata;
use futures::future::BoxFuture;
use opentelemetry::Context as TraceContext;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TraceContextExt;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Work deferred until the follow-up messages of a delivery are published.
pub type AfterPublish = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

#[derive(Clone, Default)]
struct AfterPublishHooks(Arc<Mutex<Vec<AfterPublish>>>);

impl fmt::Debug for AfterPublishHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AfterPublishHooks")
    }
}

/// Per-delivery context handed to middleware and handlers.
///
/// Middleware enrich it on the way in (trace context, correlation id, retry attempt) by
/// building a new value; a context is never shared between deliveries. Clones of one
/// context share its after-publish hooks.
#[derive(Debug, Clone)]
pub struct MessageContext {
    topic: String,
    handler_name: String,
    delivery_attempt: u32,
    retry_attempt: u32,
    correlation_id: Option<String>,
    trace: TraceContext,
    after_publish: AfterPublishHooks,
}

impl MessageContext {
    /// Creates the context for one delivery.
    pub fn new(topic: impl Into<String>, handler_name: impl Into<String>, delivery_attempt: u32) -> Self {
        Self {
            topic: topic.into(),
            handler_name: handler_name.into(),
            delivery_attempt,
            retry_attempt: 0,
            correlation_id: None,
            trace: TraceContext::new(),
            after_publish: AfterPublishHooks::default(),
        }
    }

    /// The topic the message was consumed from.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The name of the handler processing the message.
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// How many times the broker delivered this message to the handler's group.
    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    /// In-process retry number, `0` on the first call.
    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    /// The correlation id, once the correlation middleware ran.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The trace context, once the tracing middleware ran.
    pub fn trace_context(&self) -> &TraceContext {
        &self.trace
    }

    /// The hex trace id of the current span, if the message carried a valid trace context.
    pub fn trace_id(&self) -> Option<String> {
        let span = self.trace.span();
        let span_context = span.span_context();
        span_context
            .is_valid()
            .then(|| span_context.trace_id().to_string())
    }

    /// Returns a copy with the given correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Returns a copy with the given trace context.
    pub fn with_trace_context(mut self, trace: TraceContext) -> Self {
        self.trace = trace;
        self
    }

    /// Registers work to run once the router published the delivery's follow-up messages,
    /// right before the delivery is acknowledged. Hooks never run for a failed delivery.
    pub async fn after_publish(&self, hook: AfterPublish) {
        self.after_publish.0.lock().await.push(hook);
    }

    pub(crate) async fn take_after_publish(&self) -> Vec<AfterPublish> {
        std::mem::take(&mut *self.after_publish.0.lock().await)
    }

    pub(crate) fn with_retry_attempt(mut self, retry_attempt: u32) -> Self {
        self.retry_attempt = retry_attempt;
        self
    }

    /// The W3C trace headers for the current span, empty when there is no valid span.
    pub fn trace_headers(&self) -> Metadata {
        inject_trace_context(&self.trace)
    }
}

/// The W3C trace headers of `trace`, empty when it has no valid span.
pub fn inject_trace_context(trace: &TraceContext) -> Metadata {
    let mut carrier = Metadata::new();
    TraceContextPropagator::new().inject_context(trace, &mut carrier);
    carrier.retain(|_, value| !value.is_empty());
    carrier
}

/// Extracts the W3C trace context carried in message metadata.
pub fn extract_trace_context(metadata: &Metadata) -> TraceContext {
    TraceContextPropagator::new().extract(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::TRACEPARENT_KEY;

    const TRACEPARENT: &str = "00-4bf92f3577b34a6a0ba1fa7e0e2f4f1c-00f067aa0ba902b7-01";

    #[test]
    fn trace_id_is_none_without_parent() {
        let ctx = MessageContext::new("events", "events_splitter", 1);
        assert_eq!(ctx.trace_id(), None);
        assert!(ctx.trace_headers().is_empty());
    }

    #[test]
    fn extracted_trace_context_round_trips_to_headers() {
        let mut metadata = Metadata::new();
        metadata.insert(TRACEPARENT_KEY.to_string(), TRACEPARENT.to_string());

        let ctx = MessageContext::new("events", "events_splitter", 1)
            .with_trace_context(extract_trace_context(&metadata));

        assert_eq!(
            ctx.trace_id().as_deref(),
            Some("4bf92f3577b34a6a0ba1fa7e0e2f4f1c")
        );
        assert_eq!(
            ctx.trace_headers().get(TRACEPARENT_KEY).map(String::as_str),
            Some(TRACEPARENT)
        );
    }

    #[test]
    fn correlation_id_is_attached() {
        let ctx = MessageContext::new("events", "h", 1).with_correlation_id("corr-1");
        assert_eq!(ctx.correlation_id(), Some("corr-1"));
        assert_eq!(ctx.handler_name(), "h");
        assert_eq!(ctx.delivery_attempt(), 1);
    }

    #[tokio::test]
    async fn clones_share_after_publish_hooks() {
        let ctx = MessageContext::new("events", "h", 1);
        ctx.clone()
            .with_correlation_id("corr-1")
            .after_publish(Box::new(|| Box::pin(async { Ok(()) })))
            .await;

        assert_eq!(ctx.take_after_publish().await.len(), 1);
        assert!(ctx.take_after_publish().await.is_empty());
    }
}
