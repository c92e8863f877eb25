//! Runs a forwarder and a router as one unit.

use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use tickets_core::prelude::*;
use tickets_core::splitter::{EVENTS_SPLITTER, STORE_TO_DATA_LAKE};
use tokio::task::JoinError;

use crate::config::ConfigError;

/// Errors raised while starting or running a [`Service`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The configuration could not be read.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The router failed to start or stopped with an error.
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
    /// A background task panicked or was cancelled.
    #[error("Service task failed: {0}")]
    Task(#[from] JoinError),
    /// The schema could not be brought up to date.
    #[cfg(feature = "postgres")]
    #[error("Migration error: {0}")]
    Migration(#[from] tickets_pg::MigrationError),
    /// The database could not be reached.
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Logs every alert raised by the router.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerts;

#[async_trait]
impl AlertCallback for LogAlerts {
    async fn on_alert(&self, alert: &Alert) {
        error!(
            "Alert {:?}: handler={} topic={} message_id={} reason={}",
            alert.kind, alert.handler_name, alert.topic, alert.message_id, alert.reason
        );
    }
}

/// Registers the handlers that need no external collaborator: the events splitter, the
/// data lake sink and the operations read-model projector.
pub fn register_infrastructure<S>(
    router: &mut Router,
    subscriber: Arc<dyn Subscriber>,
    data_lake: Arc<dyn DataLake>,
    ops_bookings: S,
) -> Result<(), RouterError>
where
    S: OpsBookingStore + 'static,
{
    router.add_handler(EVENTS_SPLITTER, EVENTS_TOPIC, subscriber.clone(), EventsSplitter)?;
    router.add_handler(
        STORE_TO_DATA_LAKE,
        EVENTS_TOPIC,
        subscriber.clone(),
        DataLakeSink::new(data_lake),
    )?;
    let events = EventProcessor::<TicketsEvent>::new(subscriber);
    Arc::new(OpsBookingProjector::new(ops_bookings)).register(&events, router)
}

/// A forwarder and a router sharing one shutdown signal.
pub struct Service<S> {
    router: Router,
    forwarder: Forwarder<S>,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
    readiness: Readiness,
    #[cfg(feature = "postgres")]
    migrator: Option<tickets_pg::Migrator>,
}

impl<S: OutboxStore + 'static> Service<S> {
    /// Creates a service from a configured router and forwarder.
    pub fn new(router: Router, forwarder: Forwarder<S>) -> Self {
        let (trigger, shutdown) = shutdown_channel();
        Self {
            router,
            forwarder,
            trigger,
            shutdown,
            readiness: Readiness::new(),
            #[cfg(feature = "postgres")]
            migrator: None,
        }
    }

    /// Brings the schema up to date before anything starts.
    #[cfg(feature = "postgres")]
    pub fn with_migrator(mut self, migrator: tickets_pg::Migrator) -> Self {
        self.migrator = Some(migrator);
        self
    }

    /// The router, to register more handlers before running.
    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Triggers a graceful stop of [`run`](Self::run).
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Ready once both the router and the forwarder are running.
    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    /// Runs until shutdown is triggered or the router stops, then joins both loops.
    pub async fn run(self) -> Result<(), ServiceError> {
        let Service {
            router,
            forwarder,
            trigger,
            shutdown,
            readiness,
            #[cfg(feature = "postgres")]
            migrator,
        } = self;

        #[cfg(feature = "postgres")]
        if let Some(migrator) = migrator {
            let applied = migrator.run().await?;
            info!("Schema is up to date, applied {} migration(s)", applied.len());
        }

        let service_name = router.config().service_name.clone();
        let router_ready = router.running();
        let forwarder_ready = forwarder.readiness();

        let mut router_task = tokio::spawn(router.run(shutdown.clone()));
        let forwarder_task = tokio::spawn(forwarder.run(shutdown.clone()));

        let started = async {
            router_ready.wait().await;
            forwarder_ready.wait().await;
        };
        tokio::pin!(started);

        let mut stop = shutdown;
        let router_result = loop {
            tokio::select! {
                _ = &mut started, if !readiness.is_ready() => {
                    readiness.set(true);
                    info!("Service {} is running", service_name);
                }
                result = &mut router_task => {
                    if !stop.is_triggered() {
                        warn!("Router of {} stopped before shutdown", service_name);
                    }
                    break result;
                }
                _ = stop.wait() => {
                    info!("Stopping service {}", service_name);
                    break router_task.await;
                }
            }
        };

        trigger.trigger();
        readiness.set(false);
        forwarder_task.await?;
        router_result??;
        info!("Service {} stopped", service_name);
        Ok(())
    }
}
