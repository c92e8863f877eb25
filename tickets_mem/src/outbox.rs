use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use tickets_core::prelude::*;

#[derive(Debug, Default)]
struct OutboxData {
    records: Vec<OutboxRecord>,
    next_sequence: i64,
}

/// An in-memory outbox.
///
/// Transactions run one at a time. Records appended through a transaction stay in the
/// transaction until it commits, so the forwarder never sees uncommitted records.
#[derive(Clone, Debug, Default)]
pub struct InMemoryOutbox {
    data: Arc<Mutex<OutboxData>>,
    tx_lock: Arc<Mutex<()>>,
}

impl InMemoryOutbox {
    /// Creates an empty outbox.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryOutbox");
        Self::default()
    }

    /// Every committed record, forwarded or not, in commit order.
    pub async fn records(&self) -> Vec<OutboxRecord> {
        self.data.lock().await.records.clone()
    }
}

/// A transaction on an [`InMemoryOutbox`].
///
/// # Isolation Level
///
/// The transaction holds the outbox's transaction lock until it is committed, rolled back
/// or dropped, so sequences are assigned in commit order.
#[derive(Debug)]
pub struct InMemoryTransaction {
    pending: Vec<(String, Envelope)>,
    data: Arc<Mutex<OutboxData>>,
    _lock: OwnedMutexGuard<()>,
    consumed: bool,
}

impl InMemoryTransaction {
    /// Records appended so far and not yet committed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl TransactionOps for InMemoryTransaction {
    async fn commit(mut self) -> Result<(), OutboxError> {
        self.consumed = true;
        let mut data = self.data.lock().await;
        for (topic, envelope) in self.pending.drain(..) {
            data.next_sequence += 1;
            let sequence = data.next_sequence;
            data.records.push(OutboxRecord {
                sequence,
                topic,
                envelope,
                forwarded: false,
            });
        }
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), OutboxError> {
        self.consumed = true;
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.consumed {
            log::debug!(
                "InMemoryTransaction dropped without commit() or rollback(), discarding {} record(s)",
                self.pending.len()
            );
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, OutboxError> {
        let lock = self.tx_lock.clone().lock_owned().await;
        Ok(InMemoryTransaction {
            pending: Vec::new(),
            data: self.data.clone(),
            _lock: lock,
            consumed: false,
        })
    }

    async fn append(
        &self,
        tx: &mut Self::Transaction,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<(), OutboxError> {
        tx.pending.push((topic.to_string(), envelope.clone()));
        Ok(())
    }

    async fn fetch_unforwarded(&self, batch_size: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let data = self.data.lock().await;
        Ok(data
            .records
            .iter()
            .filter(|r| !r.forwarded)
            .take(batch_size)
            .cloned()
            .collect())
    }

    async fn mark_forwarded(&self, sequences: &[i64]) -> Result<(), OutboxError> {
        let mut data = self.data.lock().await;
        for record in data.records.iter_mut() {
            if sequences.contains(&record.sequence) {
                record.forwarded = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: &str) -> Envelope {
        Envelope::builder().payload(payload).build().unwrap()
    }

    #[tokio::test]
    async fn commit_makes_records_visible_in_order() {
        let outbox = InMemoryOutbox::new();
        let mut tx = outbox.begin().await.unwrap();
        outbox.append(&mut tx, "events", &envelope("1")).await.unwrap();
        outbox.append(&mut tx, "events", &envelope("2")).await.unwrap();
        assert!(outbox.fetch_unforwarded(10).await.unwrap().is_empty());
        tx.commit().await.unwrap();

        let records = outbox.fetch_unforwarded(10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].envelope.payload(), b"1");
        assert!(records[0].sequence < records[1].sequence);
    }

    #[tokio::test]
    async fn rollback_and_drop_discard_records() {
        let outbox = InMemoryOutbox::new();
        let mut tx = outbox.begin().await.unwrap();
        outbox.append(&mut tx, "events", &envelope("1")).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = outbox.begin().await.unwrap();
        outbox.append(&mut tx, "events", &envelope("2")).await.unwrap();
        drop(tx);

        assert!(outbox.records().await.is_empty());
    }

    #[tokio::test]
    async fn marked_records_are_not_fetched_again() {
        let outbox = InMemoryOutbox::new();
        let mut tx = outbox.begin().await.unwrap();
        for i in 0..3 {
            outbox
                .append(&mut tx, "events", &envelope(&i.to_string()))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let batch = outbox.fetch_unforwarded(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        let sequences: Vec<i64> = batch.iter().map(|r| r.sequence).collect();
        outbox.mark_forwarded(&sequences).await.unwrap();
        outbox.mark_forwarded(&sequences).await.unwrap();

        let rest = outbox.fetch_unforwarded(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].envelope.payload(), b"2");
    }
}
