use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use tickets_core::broker::await_outcome;
use tickets_core::prelude::*;

/// Position of one consumer group on one topic.
#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next message never handed out.
    cursor: usize,
    /// Nacked messages waiting to be handed out again, oldest first.
    redeliver: VecDeque<usize>,
    /// Delivery count per message index.
    attempts: HashMap<usize, u32>,
}

#[derive(Debug, Default)]
struct BrokerData {
    topics: HashMap<String, Vec<Envelope>>,
    groups: HashMap<(String, String), GroupState>,
}

impl BrokerData {
    /// Hands out the next message of the group: pending redeliveries first, then new ones.
    fn claim(&mut self, topic: &str, group: &str) -> Option<(usize, Envelope, u32)> {
        let log = self.topics.get(topic)?;
        let state = self
            .groups
            .entry((group.to_string(), topic.to_string()))
            .or_default();

        let index = match state.redeliver.pop_front() {
            Some(index) => index,
            None if state.cursor < log.len() => {
                state.cursor += 1;
                state.cursor - 1
            }
            None => return None,
        };

        let attempt = state.attempts.entry(index).or_insert(0);
        *attempt += 1;
        Some((index, log[index].clone(), *attempt))
    }

    /// Puts a message back at the head of the group's queue.
    fn release(&mut self, topic: &str, group: &str, index: usize) {
        self.groups
            .entry((group.to_string(), topic.to_string()))
            .or_default()
            .redeliver
            .push_front(index);
    }

    fn forget(&mut self, topic: &str, group: &str, index: usize) {
        if let Some(state) = self.groups.get_mut(&(group.to_string(), topic.to_string())) {
            state.attempts.remove(&index);
        }
    }
}

/// An in-memory broker with consumer groups.
///
/// Each subscription gets one delivery at a time and waits for it to be settled before
/// handing out the next one. A nacked message goes back to the head of its group's queue
/// after `nack_resend_sleep`, so per-group order is kept across redeliveries.
#[derive(Clone, Debug)]
pub struct InMemoryBroker {
    data: Arc<Mutex<BrokerData>>,
    notify: Arc<Notify>,
    nack_resend_sleep: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates an empty broker that redelivers nacked messages after 10ms.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryBroker");
        Self {
            data: Arc::new(Mutex::new(BrokerData::default())),
            notify: Arc::new(Notify::new()),
            nack_resend_sleep: Duration::from_millis(10),
        }
    }

    /// Sets the pause before a nacked message is handed out again.
    pub fn with_nack_resend_sleep(mut self, nack_resend_sleep: Duration) -> Self {
        self.nack_resend_sleep = nack_resend_sleep;
        self
    }

    /// Every message ever published to `topic`, in publish order.
    pub async fn messages(&self, topic: &str) -> Vec<Envelope> {
        self.data
            .lock()
            .await
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    async fn deliver(self, topic: String, group: String, tx: mpsc::Sender<Delivery>) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claimed = self.data.lock().await.claim(&topic, &group);
            let Some((index, envelope, attempt)) = claimed else {
                tokio::select! {
                    _ = &mut notified => continue,
                    _ = tx.closed() => return,
                }
            };

            let (delivery, outcome) = Delivery::new(topic.as_str(), envelope, attempt);
            if tx.send(delivery).await.is_err() {
                log::debug!("Subscription {} on {} closed", group, topic);
                self.data.lock().await.release(&topic, &group, index);
                self.notify.notify_waiters();
                return;
            }

            match await_outcome(outcome).await {
                Outcome::Ack => self.data.lock().await.forget(&topic, &group, index),
                Outcome::Nack => {
                    log::debug!(
                        "Message {} of {} nacked by {}, resending in {:?}",
                        index,
                        topic,
                        group,
                        self.nack_resend_sleep
                    );
                    tokio::time::sleep(self.nack_resend_sleep).await;
                    self.data.lock().await.release(&topic, &group, index);
                    self.notify.notify_waiters();
                }
            }
        }
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, topic: &str, messages: Vec<Envelope>) -> Result<(), BrokerError> {
        log::debug!("Publishing {} message(s) to {}", messages.len(), topic);
        self.data
            .lock()
            .await
            .topics
            .entry(topic.to_string())
            .or_default()
            .extend(messages);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBroker {
    async fn subscribe(
        &self,
        topic: &str,
        consumer_group: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        log::debug!("Subscribing {} to {}", consumer_group, topic);
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(
            self.clone()
                .deliver(topic.to_string(), consumer_group.to_string(), tx),
        );
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::time::timeout;

    fn envelope(payload: &str) -> Envelope {
        Envelope::builder().payload(payload).build().unwrap()
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("no delivery in time")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn in_memory_broker_delivers_in_order() {
        let broker = InMemoryBroker::new();
        broker
            .publish("events", vec![envelope("1"), envelope("2")])
            .await
            .unwrap();

        let mut stream = broker.subscribe("events", "group").await.unwrap();
        let first = next(&mut stream).await;
        assert_eq!(first.envelope().payload(), b"1");
        first.ack();
        let second = next(&mut stream).await;
        assert_eq!(second.envelope().payload(), b"2");
        second.ack();
    }

    #[tokio::test]
    async fn in_memory_broker_redelivers_nacked_message_first() {
        let broker = InMemoryBroker::new();
        broker
            .publish("events", vec![envelope("1"), envelope("2")])
            .await
            .unwrap();

        let mut stream = broker.subscribe("events", "group").await.unwrap();
        let first = next(&mut stream).await;
        assert_eq!(first.attempt(), 1);
        first.nack();

        let again = next(&mut stream).await;
        assert_eq!(again.envelope().payload(), b"1");
        assert_eq!(again.attempt(), 2);
        again.ack();
        assert_eq!(next(&mut stream).await.envelope().payload(), b"2");
    }

    #[tokio::test]
    async fn in_memory_broker_groups_are_independent() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe("events", "a").await.unwrap();
        let mut b = broker.subscribe("events", "b").await.unwrap();

        broker.publish("events", vec![envelope("1")]).await.unwrap();

        next(&mut a).await.ack();
        let delivery = next(&mut b).await;
        assert_eq!(delivery.envelope().payload(), b"1");
        assert_eq!(delivery.attempt(), 1);
    }

    #[tokio::test]
    async fn in_memory_broker_resumes_after_resubscribe() {
        let broker = InMemoryBroker::new();
        broker
            .publish("events", vec![envelope("1"), envelope("2")])
            .await
            .unwrap();

        let mut stream = broker.subscribe("events", "group").await.unwrap();
        next(&mut stream).await.ack();
        let unsettled = next(&mut stream).await;
        drop(unsettled);
        drop(stream);

        let mut stream = broker.subscribe("events", "group").await.unwrap();
        let delivery = next(&mut stream).await;
        assert_eq!(delivery.envelope().payload(), b"2");
    }
}
