//! Cross-cutting middleware applied uniformly to every handler.
//!
//! A middleware wraps a handler into another handler of the same shape. The router applies
//! them in registration order, the first one being the outermost. The standard chain is
//! [`standard_middlewares`]: recoverer, retry, tracing, correlation id, logging, metrics.

use super::context::{MessageContext, extract_trace_context};
use super::handler::{Handler, HandlerError, HandlerResult};
use crate::envelope::{CORRELATION_ID_KEY, Envelope, Metadata};
use crate::retry::{RetryConfig, calculate_retry_delay};
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{Status, TraceContextExt, Tracer};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Wraps a handler into a new handler.
pub trait Middleware: Send + Sync {
    /// Returns `next` decorated with this middleware.
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler>;
}

/// The chain every router uses unless configured otherwise.
pub fn standard_middlewares(retry: RetryConfig) -> Vec<Arc<dyn Middleware>> {
    vec![
        Arc::new(Recoverer),
        Arc::new(Retry::new(retry)),
        Arc::new(Tracing),
        Arc::new(CorrelationId),
        Arc::new(Logging),
        Arc::new(Metrics),
    ]
}

/// Converts a panicking handler into a [`HandlerError::Panicked`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Recoverer;

impl Middleware for Recoverer {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(RecovererHandler { next })
    }
}

struct RecovererHandler {
    next: Arc<dyn Handler>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[async_trait]
impl Handler for RecovererHandler {
    async fn handle(&self, ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        let handler_name = ctx.handler_name().to_string();
        match AssertUnwindSafe(self.next.handle(ctx, envelope))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    "Recovered from panic in handler {} message_id={}: {}",
                    handler_name,
                    envelope.id(),
                    message
                );
                Err(HandlerError::Panicked(message))
            }
        }
    }
}

/// Retries retryable failures in-process with exponential backoff.
///
/// Once `max_retries` is exhausted the last error is returned, and the router decides
/// between nacking and dead-lettering.
#[derive(Debug, Clone)]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    /// Creates the middleware.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl Middleware for Retry {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(RetryHandler {
            next,
            config: self.config.clone(),
        })
    }
}

struct RetryHandler {
    next: Arc<dyn Handler>,
    config: RetryConfig,
}

#[async_trait]
impl Handler for RetryHandler {
    async fn handle(&self, ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        let mut attempt = 0;
        loop {
            let result = self
                .next
                .handle(ctx.clone().with_retry_attempt(attempt), envelope)
                .await;

            let err = match result {
                Ok(messages) => {
                    if attempt > 0 {
                        debug!(
                            "Handler {} succeeded for message_id={} after {} retries",
                            ctx.handler_name(),
                            envelope.id(),
                            attempt
                        );
                    }
                    return Ok(messages);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if attempt >= self.config.max_retries {
                error!(
                    "Handler {} failed for message_id={} after {} attempts: {}",
                    ctx.handler_name(),
                    envelope.id(),
                    attempt + 1,
                    err
                );
                return Err(err);
            }

            let delay = calculate_retry_delay(&self.config, attempt);
            warn!(
                "Handler {} failed for message_id={} (attempt {}/{}): {}. Retrying in {:?}",
                ctx.handler_name(),
                envelope.id(),
                attempt + 1,
                self.config.max_retries + 1,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Continues the trace carried in metadata and stamps it on follow-up messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tracing;

impl Middleware for Tracing {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(TracingHandler { next })
    }
}

struct TracingHandler {
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for TracingHandler {
    async fn handle(&self, ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        let parent = extract_trace_context(envelope.metadata());
        let tracer = global::tracer("tickets");
        let span = tracer
            .span_builder(format!(
                "topic: {}, handler: {}",
                ctx.topic(),
                ctx.handler_name()
            ))
            .with_attributes(vec![
                KeyValue::new("topic", ctx.topic().to_string()),
                KeyValue::new("handler", ctx.handler_name().to_string()),
            ])
            .start_with_context(&tracer, &parent);
        let trace = parent.with_span(span);

        let ctx = ctx.with_trace_context(trace.clone());
        let headers = ctx.trace_headers();
        let result = self.next.handle(ctx, envelope).await;

        let span = trace.span();
        if let Err(err) = &result {
            span.record_error(err);
            span.set_status(Status::error(err.to_string()));
        }
        span.end();

        result.map(|messages| {
            messages
                .into_iter()
                .map(|message| message.with_default_metadata(headers.clone()))
                .collect()
        })
    }
}

/// Reads the correlation id from metadata, or generates one, and stamps it on follow-ups.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationId;

impl Middleware for CorrelationId {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(CorrelationIdHandler { next })
    }
}

struct CorrelationIdHandler {
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for CorrelationIdHandler {
    async fn handle(&self, ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        let correlation_id = match envelope.correlation_id() {
            Some(id) => id.to_string(),
            None => {
                let generated = Uuid::new_v4().to_string();
                debug!(
                    "Message {} has no correlation id, generated {}",
                    envelope.id(),
                    generated
                );
                generated
            }
        };

        let result = self
            .next
            .handle(ctx.with_correlation_id(correlation_id.clone()), envelope)
            .await;

        result.map(|messages| {
            let mut defaults = Metadata::new();
            defaults.insert(CORRELATION_ID_KEY.to_string(), correlation_id);
            messages
                .into_iter()
                .map(|message| message.with_default_metadata(defaults.clone()))
                .collect()
        })
    }
}

/// Logs every message handled and every failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logging;

impl Middleware for Logging {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(LoggingHandler { next })
    }
}

struct LoggingHandler {
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for LoggingHandler {
    async fn handle(&self, ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        let handler_name = ctx.handler_name().to_string();
        let topic = ctx.topic().to_string();
        let correlation_id = ctx.correlation_id().unwrap_or_default().to_string();

        info!(
            "Handling a message message_id={} handler={} topic={} correlation_id={} metadata={:?}",
            envelope.id(),
            handler_name,
            topic,
            correlation_id,
            envelope.metadata()
        );
        debug!(
            "Message payload message_id={} payload={}",
            envelope.id(),
            envelope.payload_lossy()
        );

        let result = self.next.handle(ctx, envelope).await;

        if let Err(err) = &result {
            error!(
                "Error while handling a message message_id={} handler={} topic={} correlation_id={} kind={}: {}",
                envelope.id(),
                handler_name,
                topic,
                correlation_id,
                err.kind(),
                err
            );
        }

        result
    }
}

/// Counts processed and failed messages and records processing duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    /// Registers metric descriptions with the installed recorder.
    pub fn describe() {
        metrics::describe_counter!(
            "messages_processed_total",
            "The total number of processed messages"
        );
        metrics::describe_counter!(
            "messages_processing_failed_total",
            "The total number of message processing failures"
        );
        metrics::describe_histogram!(
            "messages_processing_duration_seconds",
            metrics::Unit::Seconds,
            "The time spent processing messages"
        );
    }
}

impl Middleware for Metrics {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(MetricsHandler { next })
    }
}

struct MetricsHandler {
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for MetricsHandler {
    async fn handle(&self, ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        let topic = ctx.topic().to_string();
        let handler = ctx.handler_name().to_string();
        let start = Instant::now();

        let result = self.next.handle(ctx, envelope).await;

        metrics::counter!(
            "messages_processed_total",
            "topic" => topic.clone(),
            "handler" => handler.clone()
        )
        .increment(1);
        metrics::histogram!(
            "messages_processing_duration_seconds",
            "topic" => topic.clone(),
            "handler" => handler.clone()
        )
        .record(start.elapsed().as_secs_f64());

        if result.is_err() {
            metrics::counter!(
                "messages_processing_failed_total",
                "topic" => topic,
                "handler" => handler
            )
            .increment(1);
        }

        result
    }
}
