//! PostgreSQL wiring of the relay service.

use log::info;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tickets_core::prelude::*;
use tickets_pg::{Migrator, PgBroker, PgDataLake, PgOpsBookings, PgOutbox};

use crate::config::ServiceConfig;
use crate::service::{LogAlerts, Service, ServiceError, register_infrastructure};

/// Opens the connection pool described by `config`.
pub async fn connect(config: &ServiceConfig) -> Result<PgPool, ServiceError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.database_url)
        .await?;
    info!(
        "Connected to PostgreSQL (max_connections={})",
        config.db_max_connections
    );
    Ok(pool)
}

/// The relay: outbox forwarder, events splitter, data lake sink and operations read model,
/// all on PostgreSQL. The schema is migrated when the service starts.
pub fn relay(pool: PgPool, config: &ServiceConfig) -> Result<Service<PgOutbox>, ServiceError> {
    let broker = Arc::new(PgBroker::new(pool.clone()));

    let mut router_config = config.router_config();
    router_config.on_alert = Some(Arc::new(LogAlerts));
    let mut router = Router::with_standard_middlewares(router_config, broker.clone());
    register_infrastructure(
        &mut router,
        broker.clone(),
        Arc::new(PgDataLake::new(pool.clone())),
        PgOpsBookings::new(pool.clone()),
    )?;

    let forwarder = Forwarder::new(
        Arc::new(PgOutbox::new(pool.clone())),
        broker,
        config.forwarder.clone(),
    );

    Ok(Service::new(router, forwarder).with_migrator(Migrator::new(pool)))
}
