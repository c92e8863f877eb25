//! The dispatch pipeline: subscriptions, the middleware chain and ack/nack resolution.
//!
//! Every registered handler gets its own consume loop on its own consumer group
//! (`<service>.<handler>`). A delivery goes through the middleware chain into the handler
//! and its result is turned into an acknowledgement:
//!
//! | result                     | outcome                                     |
//! |----------------------------|---------------------------------------------|
//! | success                    | follow-ups published, then ack              |
//! | success, follow-ups failed | nack                                        |
//! | permanent                  | alert, ack                                  |
//! | malformed                  | payload logged, ack                         |
//! | missing dependency         | nack                                        |
//! | anything retryable         | nack (or dead letter, see [`ExhaustedPolicy`]) |

pub mod context;
pub mod handler;
pub mod middleware;
pub mod processor;

use crate::broker::{
    BrokerError, DEAD_LETTER_TOPIC, Delivery, DeliveryStream, Publisher, Subscriber,
    consumer_group,
};
use crate::envelope::Envelope;
use crate::retry::RetryConfig;
use crate::shutdown::{Readiness, Shutdown};
use async_trait::async_trait;
use context::MessageContext;
use futures::StreamExt;
use handler::{Handler, HandlerError, OutgoingMessage};
use log::{debug, error, info, warn};
use middleware::{Middleware, standard_middlewares};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Metadata key naming the handler that gave up on a dead-lettered message.
pub const DEAD_LETTER_HANDLER_KEY: &str = "dead_letter_handler";
/// Metadata key naming the topic a dead-lettered message was consumed from.
pub const DEAD_LETTER_TOPIC_KEY: &str = "dead_letter_topic";
/// Metadata key holding the last error of a dead-lettered message.
pub const DEAD_LETTER_REASON_KEY: &str = "dead_letter_reason";

/// What happens to a message whose retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedPolicy {
    /// Nack it. The broker redelivers it until the handler is fixed.
    #[default]
    Nack,
    /// Republish it to the `dead_letter` topic, alert and ack it. Messages waiting for a
    /// missing dependency are still nacked.
    DeadLetter,
}

/// Why an alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// A handler reported a permanent failure; the message was dropped.
    PermanentFailure,
    /// A message exhausted its retries and was moved to the dead letter topic.
    DeadLettered,
}

/// An out-of-band signal about a message that will not be processed.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    /// Handler that gave up.
    pub handler_name: String,
    /// Topic the message came from.
    pub topic: String,
    /// Id of the message.
    pub message_id: Uuid,
    /// Error description.
    pub reason: String,
    /// What happened to the message.
    pub kind: AlertKind,
}

/// Receives alerts raised by the router.
#[async_trait]
pub trait AlertCallback: Send + Sync {
    /// Called once per permanently failed or dead-lettered message.
    async fn on_alert(&self, alert: &Alert);
}

/// Router settings.
#[derive(Clone)]
pub struct RouterConfig {
    /// Prefix of every consumer group.
    pub service_name: String,
    /// In-process retry policy.
    pub retry: RetryConfig,
    /// How long in-flight handlers get to finish after shutdown.
    pub close_timeout: Duration,
    /// What to do once retries are exhausted.
    pub exhausted_policy: ExhaustedPolicy,
    /// Alert sink.
    pub on_alert: Option<Arc<dyn AlertCallback>>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            service_name: "svc-tickets".to_string(),
            retry: RetryConfig::default(),
            close_timeout: Duration::from_secs(30),
            exhausted_policy: ExhaustedPolicy::default(),
            on_alert: None,
        }
    }
}

impl fmt::Debug for RouterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterConfig")
            .field("service_name", &self.service_name)
            .field("retry", &self.retry)
            .field("close_timeout", &self.close_timeout)
            .field("exhausted_policy", &self.exhausted_policy)
            .field("on_alert", &self.on_alert.is_some())
            .finish()
    }
}

/// Errors raised while registering or starting handlers.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Two handlers were registered with the same name.
    #[error("Handler '{0}' is already registered")]
    DuplicateHandler(String),
    /// A subscription could not be opened.
    #[error("Handler '{handler}' could not subscribe to '{topic}': {source}")]
    Subscribe {
        /// Handler name.
        handler: String,
        /// Topic.
        topic: String,
        /// Broker error.
        #[source]
        source: BrokerError,
    },
}

struct Registration {
    name: String,
    topic: String,
    subscriber: Arc<dyn Subscriber>,
    handler: Arc<dyn Handler>,
}

/// Routes messages from subscriptions to handlers.
pub struct Router {
    config: RouterConfig,
    publisher: Arc<dyn Publisher>,
    middlewares: Vec<Arc<dyn Middleware>>,
    registrations: Vec<Registration>,
    names: HashSet<String>,
    readiness: Readiness,
}

impl Router {
    /// Creates a router without middleware. Follow-up messages go to `publisher`.
    pub fn new(config: RouterConfig, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            config,
            publisher,
            middlewares: Vec::new(),
            registrations: Vec::new(),
            names: HashSet::new(),
            readiness: Readiness::new(),
        }
    }

    /// Creates a router with the standard middleware chain.
    pub fn with_standard_middlewares(config: RouterConfig, publisher: Arc<dyn Publisher>) -> Self {
        let middlewares = standard_middlewares(config.retry.clone());
        let mut router = Self::new(config, publisher);
        router.middlewares = middlewares;
        router
    }

    /// Appends a middleware. The first one added is the outermost.
    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    /// The router settings.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Registers `handler` on `topic`.
    ///
    /// The name is the durable identity of the handler: it becomes the consumer group
    /// `<service>.<name>`, and renaming it starts from a fresh position.
    pub fn add_handler<H>(
        &mut self,
        name: impl Into<String>,
        topic: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
        handler: H,
    ) -> Result<&mut Self, RouterError>
    where
        H: Handler + 'static,
    {
        let name = name.into();
        if !self.names.insert(name.clone()) {
            return Err(RouterError::DuplicateHandler(name));
        }
        self.registrations.push(Registration {
            name,
            topic: topic.into(),
            subscriber,
            handler: Arc::new(handler),
        });
        Ok(self)
    }

    /// Names of the registered handlers, in registration order.
    pub fn handler_names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    /// Becomes ready once every subscription is open.
    pub fn running(&self) -> Readiness {
        self.readiness.clone()
    }

    /// Opens every subscription and consumes until `shutdown` fires.
    ///
    /// After shutdown no new message is taken; in-flight handlers get `close_timeout` to
    /// finish before their tasks are aborted (aborted deliveries are nacked).
    pub async fn run(self, mut shutdown: Shutdown) -> Result<(), RouterError> {
        let config = Arc::new(self.config);
        let mut loops = Vec::with_capacity(self.registrations.len());

        for registration in self.registrations {
            let group = consumer_group(&config.service_name, &registration.name);
            let stream = registration
                .subscriber
                .subscribe(&registration.topic, &group)
                .await
                .map_err(|source| RouterError::Subscribe {
                    handler: registration.name.clone(),
                    topic: registration.topic.clone(),
                    source,
                })?;

            let mut handler = registration.handler;
            for middleware in self.middlewares.iter().rev() {
                handler = middleware.wrap(handler);
            }

            debug!(
                "Subscribed handler {} to topic {} as {}",
                registration.name, registration.topic, group
            );
            let consume_loop = ConsumeLoop {
                handler_name: registration.name,
                topic: registration.topic,
                handler,
                publisher: self.publisher.clone(),
                config: config.clone(),
            };
            loops.push((consume_loop, stream));
        }

        let mut tasks = JoinSet::new();
        for (consume_loop, stream) in loops {
            tasks.spawn(consume_loop.run(stream, shutdown.clone()));
        }
        self.readiness.set(true);
        info!("Router is running with {} handlers", tasks.len());

        tokio::select! {
            _ = shutdown.wait() => {
                info!("Router is shutting down");
                let drained = tokio::time::timeout(config.close_timeout, join_all(&mut tasks)).await;
                if drained.is_err() {
                    warn!(
                        "Handlers did not finish within {:?}, aborting {} consume loops",
                        config.close_timeout,
                        tasks.len()
                    );
                    tasks.abort_all();
                    join_all(&mut tasks).await;
                }
            }
            _ = join_all(&mut tasks) => {
                warn!("Every consume loop stopped before shutdown");
            }
        }

        self.readiness.set(false);
        info!("Router stopped");
        Ok(())
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            if err.is_panic() {
                error!("Consume loop panicked: {}", err);
            }
        }
    }
}

struct ConsumeLoop {
    handler_name: String,
    topic: String,
    handler: Arc<dyn Handler>,
    publisher: Arc<dyn Publisher>,
    config: Arc<RouterConfig>,
}

impl ConsumeLoop {
    async fn run(self, mut stream: DeliveryStream, mut shutdown: Shutdown) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = stream.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        warn!(
                            "Subscription of handler {} to {} closed",
                            self.handler_name, self.topic
                        );
                        break;
                    }
                },
            };
            self.process(delivery).await;
        }
        debug!("Consume loop of handler {} stopped", self.handler_name);
    }

    async fn process(&self, mut delivery: Delivery) {
        delivery.start_processing();
        let ctx = MessageContext::new(&self.topic, &self.handler_name, delivery.attempt());
        let result = self.handler.handle(ctx.clone(), delivery.envelope()).await;

        match result {
            Ok(messages) => match self.publish_follow_ups(messages).await {
                Ok(()) => {
                    self.run_after_publish(&ctx, delivery.envelope()).await;
                    delivery.ack();
                }
                Err(err) => {
                    error!(
                        "Could not publish follow-up messages of message_id={} handler={}: {}",
                        delivery.envelope().id(),
                        self.handler_name,
                        err
                    );
                    delivery.nack();
                }
            },
            Err(HandlerError::Permanent(reason)) => {
                self.alert(delivery.envelope(), reason, AlertKind::PermanentFailure)
                    .await;
                delivery.ack();
            }
            Err(HandlerError::Malformed(reason)) => {
                warn!(
                    "Dropping malformed message message_id={} handler={} topic={}: {} payload={}",
                    delivery.envelope().id(),
                    self.handler_name,
                    self.topic,
                    reason,
                    delivery.envelope().payload_lossy()
                );
                delivery.ack();
            }
            Err(HandlerError::MissingDependency(reason)) => {
                debug!(
                    "Message message_id={} handler={} waits for a missing dependency: {}",
                    delivery.envelope().id(),
                    self.handler_name,
                    reason
                );
                delivery.nack();
            }
            Err(err) => match self.config.exhausted_policy {
                ExhaustedPolicy::Nack => delivery.nack(),
                ExhaustedPolicy::DeadLetter => {
                    match self.dead_letter(delivery.envelope(), &err).await {
                        Ok(()) => {
                            self.alert(delivery.envelope(), err.to_string(), AlertKind::DeadLettered)
                                .await;
                            delivery.ack();
                        }
                        Err(publish_err) => {
                            error!(
                                "Could not dead-letter message_id={} handler={}: {}",
                                delivery.envelope().id(),
                                self.handler_name,
                                publish_err
                            );
                            delivery.nack();
                        }
                    }
                }
            },
        }
    }

    async fn run_after_publish(&self, ctx: &MessageContext, envelope: &Envelope) {
        for hook in ctx.take_after_publish().await {
            if let Err(err) = hook().await {
                warn!(
                    "After-publish hook of message_id={} handler={} failed: {}",
                    envelope.id(),
                    self.handler_name,
                    err
                );
            }
        }
    }

    async fn publish_follow_ups(&self, messages: Vec<OutgoingMessage>) -> Result<(), BrokerError> {
        let mut batch: Vec<Envelope> = Vec::new();
        let mut batch_topic: Option<String> = None;

        for message in messages {
            if batch_topic.as_deref() != Some(message.topic.as_str()) {
                if let Some(topic) = batch_topic.take() {
                    self.publisher
                        .publish(&topic, std::mem::take(&mut batch))
                        .await?;
                }
                batch_topic = Some(message.topic);
            }
            batch.push(message.envelope);
        }
        if let Some(topic) = batch_topic {
            self.publisher.publish(&topic, batch).await?;
        }
        Ok(())
    }

    async fn dead_letter(&self, envelope: &Envelope, err: &HandlerError) -> Result<(), BrokerError> {
        let parked = envelope
            .clone()
            .into_builder()
            .metadata(DEAD_LETTER_HANDLER_KEY, self.handler_name.as_str())
            .metadata(DEAD_LETTER_TOPIC_KEY, self.topic.as_str())
            .metadata(DEAD_LETTER_REASON_KEY, err.to_string())
            .build()
            .map_err(|e| BrokerError::Backend(Box::new(e)))?;
        self.publisher.publish(DEAD_LETTER_TOPIC, vec![parked]).await
    }

    async fn alert(&self, envelope: &Envelope, reason: String, kind: AlertKind) {
        error!(
            "Alert: message_id={} handler={} topic={} kind={:?}: {}",
            envelope.id(),
            self.handler_name,
            self.topic,
            kind,
            reason
        );
        metrics::counter!(
            "messages_alerted_total",
            "topic" => self.topic.clone(),
            "handler" => self.handler_name.clone()
        )
        .increment(1);

        if let Some(callback) = &self.config.on_alert {
            let alert = Alert {
                handler_name: self.handler_name.clone(),
                topic: self.topic.clone(),
                message_id: envelope.id(),
                reason,
                kind,
            };
            callback.on_alert(&alert).await;
        }
    }
}
