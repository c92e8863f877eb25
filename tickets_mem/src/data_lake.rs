use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use tickets_core::prelude::*;

/// An in-memory data lake keeping events in arrival order.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDataLake(Arc<Mutex<Vec<DataLakeEvent>>>);

impl InMemoryDataLake {
    /// Creates an empty data lake.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataLake for InMemoryDataLake {
    async fn store_event(&self, event: DataLakeEvent) -> Result<(), DataLakeError> {
        let mut events = self.0.lock().await;
        if events.iter().any(|e| e.event_id == event.event_id) {
            log::debug!("Event {} is already in the data lake", event.event_id);
            return Ok(());
        }
        events.push(event);
        Ok(())
    }

    async fn events(&self) -> Result<Vec<DataLakeEvent>, DataLakeError> {
        Ok(self.0.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storing_an_event_twice_keeps_one_copy() {
        let lake = InMemoryDataLake::new();
        let header = MessageHeader::new();
        let event = DataLakeEvent {
            event_id: header.id,
            header,
            event_name: "TicketRefunded_v1".to_string(),
            payload: b"{}".to_vec(),
        };
        lake.store_event(event.clone()).await.unwrap();
        lake.store_event(event.clone()).await.unwrap();
        assert_eq!(lake.events().await.unwrap(), vec![event]);
    }
}
