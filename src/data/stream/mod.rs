pub mod redis;

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::data::error::StreamStoreError;

/// A single stream entry as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub entry_id: String,
    pub fields: HashMap<String, String>,
}

/// A pending-entries-list row, as returned by `pending_range`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub entry_id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Minimal, stream-store-shaped surface the core depends on (C1). Backed by
/// Redis Streams in production (`redis::RedisStreamStore`); a pure in-memory
/// implementation (`mock::MockStreamStore`, test builds only) lets the
/// pipelines be exercised without a live Redis instance.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Appends `fields` to `stream`, optionally trimming to approximately
    /// `maxlen` entries. Trimming never fails the append.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: Option<u64>,
    ) -> Result<String, StreamStoreError>;

    /// Idempotent: succeeds silently if the group already exists.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> Result<(), StreamStoreError>;

    /// Blocks up to `block_ms` waiting for new (`>`) entries for `consumer`.
    /// Returns an empty vec, never an error, if nothing arrived in time.
    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, StreamStoreError>;

    /// Removes `ids` from the group's PEL. Idempotent on unknown ids.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamStoreError>;

    /// Read-only PEL enumeration, oldest idle first.
    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamStoreError>;

    /// Transfers ownership of `ids` to `consumer`; entries idle less than
    /// `min_idle_ms` are silently skipped.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StreamStoreError>;

    async fn len(&self, stream: &str) -> Result<u64, StreamStoreError>;

    /// Non-destructive oldest-first range read, used for DLQ inspection.
    async fn peek(&self, stream: &str, count: usize) -> Result<Vec<StreamMessage>, StreamStoreError>;

    /// Deletes a single entry by id, used for DLQ removal/reprocessing.
    async fn delete(&self, stream: &str, entry_id: &str) -> Result<u64, StreamStoreError>;

    async fn health_check(&self) -> Result<(), StreamStoreError>;

    /// Closes the store's connection pool so in-flight operations can drain
    /// without new checkouts starting. No-op by default for stores with no
    /// pooled resource to release.
    async fn close(&self) {}
}
