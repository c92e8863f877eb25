//! PostgreSQL broker.
//!
//! Messages are rows of `tickets_messages`. Every `(consumer group, topic)` has an offset
//! row in `tickets_consumer_offsets` that moves past a message once it is acked. Consumers
//! wake up on `LISTEN/NOTIFY` and fall back to polling while the listener is down.
//!
//! Only one consumer per `(consumer group, topic)` is active at a time. The others wait on
//! an advisory lock held on a dedicated connection, so a crashed consumer releases the
//! group as soon as its connection closes.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use sqlx::postgres::{PgListener, PgPool};
use sqlx::types::Json;
use sqlx::{Connection, FromRow, PgConnection};
use std::time::Duration;
use tickets_core::broker::await_outcome;
use tickets_core::prelude::*;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_stream::wrappers::ReceiverStream;

use crate::outbox::PgMessageRow;

/// Settings of a [`PgBroker`].
#[derive(Debug, Clone)]
pub struct PgBrokerConfig {
    /// Channel used for `LISTEN/NOTIFY` wake-ups.
    pub channel: String,
    /// How often an idle consumer polls when no notification arrives.
    pub poll_interval: Duration,
    /// Pause before a nacked message is delivered again.
    pub nack_resend_sleep: Duration,
    /// How often a waiting consumer retries the group lock.
    pub lock_retry_interval: Duration,
    /// Upper bound of the listener reconnect delay.
    pub max_reconnect_delay: Duration,
}

impl Default for PgBrokerConfig {
    fn default() -> Self {
        Self {
            channel: "tickets_messages".to_string(),
            poll_interval: Duration::from_secs(1),
            nack_resend_sleep: Duration::from_millis(500),
            lock_retry_interval: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

/// PostgreSQL implementation of [`Publisher`] and [`Subscriber`].
#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
    config: PgBrokerConfig,
}

impl PgBroker {
    /// Creates a broker with default configuration.
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, PgBrokerConfig::default())
    }

    /// Creates a broker with custom configuration.
    pub fn with_config(pool: PgPool, config: PgBrokerConfig) -> Self {
        Self { pool, config }
    }

    /// The broker settings.
    pub fn config(&self) -> &PgBrokerConfig {
        &self.config
    }
}

fn backend(err: sqlx::Error) -> BrokerError {
    BrokerError::Backend(Box::new(err))
}

#[async_trait]
impl Publisher for PgBroker {
    async fn publish(&self, topic: &str, messages: Vec<Envelope>) -> Result<(), BrokerError> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(backend)?;
        for envelope in &messages {
            sqlx::query(
                r#"
                INSERT INTO tickets_messages (topic, message_id, published_at, payload, metadata)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(topic)
            .bind(envelope.id())
            .bind(envelope.published_at())
            .bind(envelope.payload())
            .bind(Json(envelope.metadata()))
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        // delivered to listeners on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.config.channel)
            .bind(topic)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        debug!("Published {} message(s) to {}", messages.len(), topic);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for PgBroker {
    async fn subscribe(
        &self,
        topic: &str,
        consumer_group: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        sqlx::query(
            r#"
            INSERT INTO tickets_consumer_offsets (consumer_group, topic)
            VALUES ($1, $2)
            ON CONFLICT (consumer_group, topic) DO NOTHING
            "#,
        )
        .bind(consumer_group)
        .bind(topic)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let (tx, rx) = mpsc::channel(1);
        let consumer = Consumer {
            pool: self.pool.clone(),
            config: self.config.clone(),
            topic: topic.to_string(),
            group: consumer_group.to_string(),
            tx,
        };
        tokio::spawn(consumer.run());
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[derive(Debug, FromRow)]
struct QueuedMessage {
    transaction_id: i64,
    #[sqlx(flatten)]
    message: PgMessageRow,
}

/// The background task feeding one subscription.
struct Consumer {
    pool: PgPool,
    config: PgBrokerConfig,
    topic: String,
    group: String,
    tx: mpsc::Sender<Delivery>,
}

impl Consumer {
    fn lock_key(&self) -> String {
        format!("{}:{}", self.group, self.topic)
    }

    async fn run(self) {
        let Some(lock) = self.acquire_lock().await else {
            debug!("Subscription {} on {} closed before it started", self.group, self.topic);
            return;
        };
        info!("Consuming {} as {}", self.topic, self.group);

        let mut wakeups = Wakeups::new(&self.pool, &self.config);
        let mut last_delivery: Option<(i64, u32)> = None;
        let mut error_delay = self.config.poll_interval;

        loop {
            let queued = match self.next_message().await {
                Ok(queued) => {
                    error_delay = self.config.poll_interval;
                    queued
                }
                Err(err) => {
                    warn!(
                        "Could not read {} for {}, retrying in {:?}: {}",
                        self.topic, self.group, error_delay, err
                    );
                    tokio::select! {
                        _ = sleep(error_delay) => {}
                        _ = self.tx.closed() => break,
                    }
                    error_delay = (error_delay * 2).min(self.config.max_reconnect_delay);
                    continue;
                }
            };

            let Some(QueuedMessage {
                transaction_id,
                message,
            }) = queued
            else {
                tokio::select! {
                    _ = wakeups.wait(self.config.poll_interval) => {}
                    _ = self.tx.closed() => break,
                }
                continue;
            };

            let sequence = message.sequence;
            let attempt = match last_delivery {
                Some((last, attempt)) if last == sequence => attempt + 1,
                _ => 1,
            };
            last_delivery = Some((sequence, attempt));

            let envelope = match message.into_envelope() {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!(
                        "Skipping unreadable message {} of {}: {}",
                        sequence, self.topic, err
                    );
                    self.advance(transaction_id, sequence).await;
                    continue;
                }
            };

            let (delivery, outcome) = Delivery::new(self.topic.as_str(), envelope, attempt);
            if self.tx.send(delivery).await.is_err() {
                break;
            }

            match await_outcome(outcome).await {
                Outcome::Ack => self.advance(transaction_id, sequence).await,
                Outcome::Nack => {
                    debug!(
                        "Message {} of {} nacked by {}, resending in {:?}",
                        sequence, self.topic, self.group, self.config.nack_resend_sleep
                    );
                    tokio::select! {
                        _ = sleep(self.config.nack_resend_sleep) => {}
                        _ = self.tx.closed() => break,
                    }
                }
            }
        }

        self.release_lock(lock).await;
        debug!("Subscription {} on {} closed", self.group, self.topic);
    }

    /// The oldest committed message past the group's offset.
    async fn next_message(&self) -> Result<Option<QueuedMessage>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT m.transaction_id::text::bigint AS transaction_id,
                   m.sequence, m.topic, m.message_id, m.published_at, m.payload, m.metadata
            FROM tickets_messages m
            JOIN tickets_consumer_offsets o
              ON o.consumer_group = $1 AND o.topic = m.topic
            WHERE m.topic = $2
              AND (m.transaction_id, m.sequence) > (o.last_transaction_id, o.last_sequence)
              AND m.transaction_id < pg_snapshot_xmin(pg_current_snapshot())
            ORDER BY m.transaction_id, m.sequence
            LIMIT 1
            "#,
        )
        .bind(&self.group)
        .bind(&self.topic)
        .fetch_optional(&self.pool)
        .await
    }

    /// Moves the group's offset past a settled message.
    ///
    /// A failed update leaves the offset in place and the message is delivered again.
    async fn advance(&self, transaction_id: i64, sequence: i64) {
        let result = sqlx::query(
            r#"
            UPDATE tickets_consumer_offsets
            SET last_transaction_id = $3::bigint::text::xid8,
                last_sequence = $4,
                updated_at = NOW()
            WHERE consumer_group = $1 AND topic = $2
            "#,
        )
        .bind(&self.group)
        .bind(&self.topic)
        .bind(transaction_id)
        .bind(sequence)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            error!(
                "Could not store offset of {} on {}, message {} will be redelivered: {}",
                self.group, self.topic, sequence, err
            );
        }
    }

    async fn acquire_lock(&self) -> Option<PgConnection> {
        loop {
            match self.try_lock().await {
                Ok(Some(conn)) => return Some(conn),
                Ok(None) => debug!(
                    "Another consumer holds {}, waiting {:?}",
                    self.lock_key(),
                    self.config.lock_retry_interval
                ),
                Err(err) => warn!("Could not take lock {}: {}", self.lock_key(), err),
            }
            tokio::select! {
                _ = sleep(self.config.lock_retry_interval) => {}
                _ = self.tx.closed() => return None,
            }
        }
    }

    async fn try_lock(&self) -> Result<Option<PgConnection>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?.detach();
        let (locked,): (bool,) = sqlx::query_as(
            r#"
            SELECT pg_try_advisory_lock(
                ('x' || substr(md5($1), 1, 8))::bit(32)::int,
                ('x' || substr(md5($1), 9, 8))::bit(32)::int
            )
            "#,
        )
        .bind(self.lock_key())
        .fetch_one(&mut conn)
        .await?;

        if locked {
            Ok(Some(conn))
        } else {
            conn.close().await?;
            Ok(None)
        }
    }

    async fn release_lock(&self, mut conn: PgConnection) {
        let result = sqlx::query(
            r#"
            SELECT pg_advisory_unlock(
                ('x' || substr(md5($1), 1, 8))::bit(32)::int,
                ('x' || substr(md5($1), 9, 8))::bit(32)::int
            )
            "#,
        )
        .bind(self.lock_key())
        .execute(&mut conn)
        .await;
        if let Err(err) = result {
            warn!("Could not release lock {}: {}", self.lock_key(), err);
        }
        // closing the session drops the lock in any case
        if let Err(err) = conn.close().await {
            debug!("Closing lock connection of {} failed: {}", self.lock_key(), err);
        }
    }
}

/// `LISTEN/NOTIFY` wake-ups with a polling fallback and reconnect backoff.
struct Wakeups {
    pool: PgPool,
    channel: String,
    listener: Option<PgListener>,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    retry_at: Instant,
}

impl Wakeups {
    fn new(pool: &PgPool, config: &PgBrokerConfig) -> Self {
        Self {
            pool: pool.clone(),
            channel: config.channel.clone(),
            listener: None,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: config.max_reconnect_delay,
            retry_at: Instant::now(),
        }
    }

    /// Resolves on a notification or after `poll_interval`, whichever comes first.
    async fn wait(&mut self, poll_interval: Duration) {
        if self.listener.is_none() && Instant::now() >= self.retry_at {
            self.connect().await;
        }

        let Some(listener) = self.listener.as_mut() else {
            sleep(poll_interval).await;
            return;
        };

        let failure = tokio::select! {
            result = listener.recv() => result.err(),
            _ = sleep(poll_interval) => None,
        };
        if let Some(err) = failure {
            error!(
                "Error receiving notification on '{}': {}. Falling back to polling",
                self.channel, err
            );
            self.listener = None;
            self.retry_at = Instant::now();
        }
    }

    async fn connect(&mut self) {
        let result = async {
            let mut listener = PgListener::connect_with(&self.pool).await?;
            listener.listen(&self.channel).await?;
            Ok::<_, sqlx::Error>(listener)
        }
        .await;

        match result {
            Ok(listener) => {
                debug!("Listening on channel '{}'", self.channel);
                self.listener = Some(listener);
                self.reconnect_delay = Duration::from_secs(1);
            }
            Err(err) => {
                error!(
                    "Failed to listen on channel '{}', retrying in {:?}: {}",
                    self.channel, self.reconnect_delay, err
                );
                self.retry_at = Instant::now() + self.reconnect_delay;
                self.reconnect_delay = (self.reconnect_delay * 2).min(self.max_reconnect_delay);
            }
        }
    }
}
