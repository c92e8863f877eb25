use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use tickets_core::prelude::*;

/// An in-memory processed-message ledger.
#[derive(Clone, Debug, Default)]
pub struct InMemoryProcessedMessages(Arc<Mutex<HashSet<(String, Uuid)>>>);

impl InMemoryProcessedMessages {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedMessages for InMemoryProcessedMessages {
    async fn is_processed(&self, handler_name: &str, message_id: Uuid) -> Result<bool, LedgerError> {
        Ok(self
            .0
            .lock()
            .await
            .contains(&(handler_name.to_string(), message_id)))
    }

    async fn mark_processed(&self, handler_name: &str, message_id: Uuid) -> Result<(), LedgerError> {
        self.0
            .lock()
            .await
            .insert((handler_name.to_string(), message_id));
        Ok(())
    }
}
