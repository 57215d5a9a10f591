//! Dead-letter queue management, grounded on the original `DLQManager`:
//! append with its own maxlen cap, plus the operator-facing inspection
//! operations (`peek`/`remove`/`reprocess`/`len`) the distilled spec only
//! hinted at via the DLQ stream shape.

use std::sync::Arc;

use tracing::{error, info};

use crate::data::error::StreamStoreError;
use crate::data::stream::{StreamMessage, StreamStore};
use crate::domain::email::DlqRecord;

pub struct DlqManager {
    store: Arc<dyn StreamStore>,
    dlq_stream: String,
    maxlen: u64,
}

impl DlqManager {
    pub fn new(store: Arc<dyn StreamStore>, dlq_stream: impl Into<String>, maxlen: u64) -> Self {
        Self {
            store,
            dlq_stream: dlq_stream.into(),
            maxlen,
        }
    }

    pub async fn send_to_dlq(&self, record: DlqRecord) -> Result<String, StreamStoreError> {
        let fields = vec![
            ("original_entry_id".to_string(), record.original_entry_id.clone()),
            ("failed_at".to_string(), record.failed_at.to_rfc3339()),
            ("error_type".to_string(), record.error_type.clone()),
            ("error_message".to_string(), record.error_message.clone()),
            ("retry_count".to_string(), record.retry_count.to_string()),
            ("original_data".to_string(), record.original_data.clone()),
        ];
        let mut fields = fields;
        if let Some(metadata) = &record.metadata {
            fields.push(("metadata".to_string(), metadata.clone()));
        }

        match self.store.append(&self.dlq_stream, &fields, Some(self.maxlen)).await {
            Ok(id) => {
                error!(
                    original_entry_id = %record.original_entry_id,
                    error_type = %record.error_type,
                    "message routed to dead-letter stream"
                );
                Ok(id)
            }
            Err(e) => {
                error!(original_entry_id = %record.original_entry_id, error = %e, "failed to append to DLQ");
                Err(e)
            }
        }
    }

    pub async fn len(&self) -> Result<u64, StreamStoreError> {
        self.store.len(&self.dlq_stream).await
    }

    pub async fn peek(&self, count: usize) -> Result<Vec<StreamMessage>, StreamStoreError> {
        self.store.peek(&self.dlq_stream, count).await
    }

    pub async fn remove(&self, dlq_entry_id: &str) -> Result<u64, StreamStoreError> {
        self.store.delete(&self.dlq_stream, dlq_entry_id).await
    }

    /// Re-appends the DLQ entry's original payload to `target_stream`, then
    /// removes it from the DLQ.
    pub async fn reprocess(&self, dlq_entry_id: &str, target_stream: &str) -> Result<String, StreamStoreError> {
        let entries = self.store.peek(&self.dlq_stream, usize::MAX).await?;
        let entry = entries
            .into_iter()
            .find(|e| e.entry_id == dlq_entry_id)
            .ok_or_else(|| StreamStoreError::InvalidArgs(format!("no such DLQ entry: {dlq_entry_id}")))?;

        let payload = entry
            .fields
            .get("original_data")
            .cloned()
            .ok_or_else(|| StreamStoreError::Decode("DLQ entry missing original_data".into()))?;

        let new_id = self
            .store
            .append(target_stream, &[("payload".to_string(), payload)], None)
            .await?;
        self.store.delete(&self.dlq_stream, dlq_entry_id).await?;
        info!(dlq_entry_id, new_id, target_stream, "reprocessed DLQ entry");
        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::stream::mock::MockStreamStore;

    fn manager() -> DlqManager {
        let store: Arc<dyn StreamStore> = Arc::new(MockStreamStore::new());
        DlqManager::new(store, "dlq", 1000)
    }

    #[tokio::test]
    async fn send_to_dlq_carries_original_payload_intact() {
        let dlq = manager();
        let record = DlqRecord::new("5-0", "ProcessingError", "boom", 3, "{\"uid\":1}");
        dlq.send_to_dlq(record).await.unwrap();
        assert_eq!(dlq.len().await.unwrap(), 1);
        let peeked = dlq.peek(10).await.unwrap();
        assert_eq!(peeked[0].fields.get("original_data").unwrap(), "{\"uid\":1}");
    }

    #[tokio::test]
    async fn reprocess_moves_entry_to_target_and_removes_from_dlq() {
        let dlq = manager();
        let record = DlqRecord::new("5-0", "ProcessingError", "boom", 3, "{\"uid\":1}");
        dlq.send_to_dlq(record).await.unwrap();
        let entry_id = dlq.peek(1).await.unwrap()[0].entry_id.clone();

        dlq.reprocess(&entry_id, "main").await.unwrap();
        assert_eq!(dlq.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_deletes_a_single_entry() {
        let dlq = manager();
        dlq.send_to_dlq(DlqRecord::new("1-0", "E", "m", 1, "{}")).await.unwrap();
        let entry_id = dlq.peek(1).await.unwrap()[0].entry_id.clone();
        let removed = dlq.remove(&entry_id).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(dlq.len().await.unwrap(), 0);
    }
}
