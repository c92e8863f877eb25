//! Forwards the outbox and maintains the data lake and the operations read model.
//!
//! Configured through the environment, see [`ServiceConfig`]. Stops on Ctrl-C.

use log::{error, info};
use metrics_exporter_prometheus::PrometheusBuilder;
use tickets::pg;
use tickets::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServiceConfig::from_env()?;

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Serving metrics on http://{}/metrics", addr);
    }

    let pool = pg::connect(&config).await?;
    let service = pg::relay(pool, &config)?;

    let trigger = service.shutdown_trigger();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(err) => error!("Could not listen for Ctrl-C, shutting down: {}", err),
        }
        trigger.trigger();
    });

    service.run().await?;
    Ok(())
}
