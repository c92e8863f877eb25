//! Moves committed outbox records to the broker.
//!
//! Every record goes `Unforwarded -> Publishing -> Forwarded`: it is published first and
//! marked afterwards. A crash in between leaves the record unforwarded, and it is
//! published again on restart. Consumers see it at least once, never zero times.

use crate::broker::{BrokerError, Publisher};
use crate::outbox::{OutboxError, OutboxStore};
use crate::shutdown::{Readiness, Shutdown};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;

/// Forwarder settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwarderConfig {
    /// Maximum number of records fetched per poll.
    pub batch_size: usize,
    /// Delay between polls when the outbox is drained.
    pub poll_interval: Duration,
    /// Upper bound of the delay after consecutive failures.
    pub max_backoff: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Errors raised while forwarding.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    /// The outbox could not be read or updated.
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),
    /// A record could not be published. It stays unforwarded.
    #[error("Failed to publish outbox record {sequence}: {source}")]
    Publish {
        /// Sequence of the record.
        sequence: i64,
        /// Broker error.
        #[source]
        source: BrokerError,
    },
}

/// Publishes outbox records to a broker.
pub struct Forwarder<S> {
    store: Arc<S>,
    publisher: Arc<dyn Publisher>,
    config: ForwarderConfig,
    readiness: Readiness,
}

impl<S: OutboxStore> Forwarder<S> {
    /// Creates a forwarder reading `store` and publishing to `publisher`.
    pub fn new(store: Arc<S>, publisher: Arc<dyn Publisher>, config: ForwarderConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            readiness: Readiness::new(),
        }
    }

    /// Becomes ready once the forwarding loop runs.
    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    /// Forwards one batch and returns how many records were forwarded.
    ///
    /// Records are handled in commit order. A failed publish stops the batch so that a
    /// later record never overtakes an earlier one.
    pub async fn forward_batch(&self) -> Result<usize, ForwarderError> {
        let records = self.store.fetch_unforwarded(self.config.batch_size).await?;
        let mut forwarded = 0;

        for record in records {
            trace!(
                "Publishing outbox record {} message_id={} to {}",
                record.sequence,
                record.envelope.id(),
                record.topic
            );
            self.publisher
                .publish(&record.topic, vec![record.envelope])
                .await
                .map_err(|source| ForwarderError::Publish {
                    sequence: record.sequence,
                    source,
                })?;

            self.store.mark_forwarded(&[record.sequence]).await?;
            metrics::counter!("outbox_records_forwarded_total", "topic" => record.topic)
                .increment(1);
            forwarded += 1;
        }

        Ok(forwarded)
    }

    /// Forwards records until `shutdown` fires.
    pub async fn run(self, mut shutdown: Shutdown) {
        info!(
            "Outbox forwarder started (batch_size={}, poll_interval={:?})",
            self.config.batch_size, self.config.poll_interval
        );
        self.readiness.set(true);
        let mut backoff = self.config.poll_interval;

        loop {
            if shutdown.is_triggered() {
                break;
            }

            let delay = match self.forward_batch().await {
                Ok(count) => {
                    backoff = self.config.poll_interval;
                    if count > 0 {
                        debug!("Forwarded {} outbox records", count);
                    }
                    if count > 0 && count >= self.config.batch_size {
                        continue;
                    }
                    self.config.poll_interval
                }
                Err(err) => {
                    warn!("Outbox forwarding failed, retrying in {:?}: {}", backoff, err);
                    let delay = backoff;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    delay
                }
            };

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.readiness.set(false);
        info!("Outbox forwarder stopped");
    }
}
