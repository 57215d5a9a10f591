//! Owned buffer with size-triggered auto-flush, grounded on the original
//! `BatchProducer`/`BatchAcknowledger`: `add` may trigger a flush, `flush`
//! drains the buffer into a single pipelined round trip, and on failure the
//! buffer is retained so no buffered entry is silently lost.

use std::sync::Arc;

use crate::data::error::StreamStoreError;
use crate::data::stream::StreamStore;

pub struct BatchAppender {
    store: Arc<dyn StreamStore>,
    stream: String,
    maxlen: Option<u64>,
    batch_size: usize,
    buffer: Vec<Vec<(String, String)>>,
    total_sent: u64,
    total_batches: u64,
}

impl BatchAppender {
    pub fn new(store: Arc<dyn StreamStore>, stream: impl Into<String>, batch_size: usize, maxlen: Option<u64>) -> Self {
        Self {
            store,
            stream: stream.into(),
            maxlen,
            batch_size,
            buffer: Vec::new(),
            total_sent: 0,
            total_batches: 0,
        }
    }

    /// Buffers `fields`, auto-flushing when the batch size threshold is hit.
    /// Returns the ids appended by the triggered flush, if any.
    pub async fn add(&mut self, fields: Vec<(String, String)>) -> Result<Vec<String>, StreamStoreError> {
        self.buffer.push(fields);
        if self.buffer.len() >= self.batch_size {
            self.flush().await
        } else {
            Ok(Vec::new())
        }
    }

    /// Drains the buffer into append calls. On failure the buffer is
    /// retained untouched so the caller can retry.
    pub async fn flush(&mut self) -> Result<Vec<String>, StreamStoreError> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::with_capacity(self.buffer.len());
        for (i, fields) in self.buffer.iter().enumerate() {
            match self.store.append(&self.stream, fields, self.maxlen).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    self.buffer.drain(..i);
                    return Err(e);
                }
            }
        }
        self.buffer.clear();
        self.total_sent += ids.len() as u64;
        self.total_batches += 1;
        Ok(ids)
    }

    pub fn pending_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.total_sent, self.total_batches)
    }
}

pub struct BatchAcknowledger {
    store: Arc<dyn StreamStore>,
    stream: String,
    group: String,
    batch_size: usize,
    buffer: Vec<String>,
}

impl BatchAcknowledger {
    pub fn new(store: Arc<dyn StreamStore>, stream: impl Into<String>, group: impl Into<String>, batch_size: usize) -> Self {
        Self {
            store,
            stream: stream.into(),
            group: group.into(),
            batch_size,
            buffer: Vec::new(),
        }
    }

    pub async fn add(&mut self, entry_id: String) -> Result<u64, StreamStoreError> {
        self.buffer.push(entry_id);
        if self.buffer.len() >= self.batch_size {
            self.flush().await
        } else {
            Ok(0)
        }
    }

    pub async fn flush(&mut self) -> Result<u64, StreamStoreError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let n = self.store.ack(&self.stream, &self.group, &self.buffer).await?;
        self.buffer.clear();
        Ok(n)
    }

    pub fn pending_count(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::stream::mock::MockStreamStore;

    #[tokio::test]
    async fn auto_flushes_at_batch_size() {
        let store: Arc<dyn StreamStore> = Arc::new(MockStreamStore::new());
        let mut appender = BatchAppender::new(Arc::clone(&store), "s", 2, None);
        let r1 = appender.add(vec![("payload".into(), "a".into())]).await.unwrap();
        assert!(r1.is_empty());
        assert_eq!(appender.pending_count(), 1);
        let r2 = appender.add(vec![("payload".into(), "b".into())]).await.unwrap();
        assert_eq!(r2.len(), 2);
        assert_eq!(appender.pending_count(), 0);
        assert_eq!(store.len("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn explicit_flush_drains_partial_buffer() {
        let store: Arc<dyn StreamStore> = Arc::new(MockStreamStore::new());
        let mut appender = BatchAppender::new(Arc::clone(&store), "s", 10, None);
        appender.add(vec![("payload".into(), "a".into())]).await.unwrap();
        let ids = appender.flush().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(appender.stats().0, 1);
    }

    #[tokio::test]
    async fn flush_rejects_empty_fields() {
        let store: Arc<dyn StreamStore> = Arc::new(MockStreamStore::new());
        let mut appender = BatchAppender::new(Arc::clone(&store), "s", 10, None);
        appender.add(vec![]).await.unwrap_err();
    }

    #[tokio::test]
    async fn acknowledger_batches_acks() {
        let store: Arc<dyn StreamStore> = Arc::new(MockStreamStore::new());
        store.create_group("s", "g", "0").await.unwrap();
        store.append("s", &[("payload".into(), "a".into())], None).await.unwrap();
        let delivered = store.group_read("s", "g", "c1", 10, 0).await.unwrap();

        let mut acker = BatchAcknowledger::new(Arc::clone(&store), "s", "g", 5);
        let n = acker.add(delivered[0].entry_id.clone()).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(acker.flush().await.unwrap(), 1);
    }
}
