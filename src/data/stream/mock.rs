//! In-memory `StreamStore`, used to exercise the producer/consumer pipelines
//! deterministically without a live Redis instance.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::data::error::StreamStoreError;

use super::{PendingEntry, StreamMessage, StreamStore};

struct Entry {
    id: String,
    fields: HashMap<String, String>,
}

struct GroupState {
    last_delivered_offset: usize,
    pel: HashMap<String, PelRow>,
}

struct PelRow {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

struct Stream {
    entries: VecDeque<Entry>,
    groups: HashMap<String, GroupState>,
}

pub struct MockStreamStore {
    streams: Mutex<HashMap<String, Stream>>,
    seq: AtomicU64,
}

impl MockStreamStore {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> String {
        format!("{}-0", self.seq.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for MockStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamStore for MockStreamStore {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: Option<u64>,
    ) -> Result<String, StreamStoreError> {
        if fields.is_empty() {
            return Err(StreamStoreError::InvalidArgs("append requires at least one field".into()));
        }
        let id = self.next_id();
        let mut streams = self.streams.lock();
        let entry = Stream {
            entries: VecDeque::new(),
            groups: HashMap::new(),
        };
        let s = streams.entry(stream.to_string()).or_insert(entry);
        s.entries.push_back(Entry {
            id: id.clone(),
            fields: fields.iter().cloned().collect(),
        });
        if let Some(maxlen) = maxlen {
            while s.entries.len() as u64 > maxlen {
                s.entries.pop_front();
            }
        }
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str, _start_id: &str) -> Result<(), StreamStoreError> {
        let mut streams = self.streams.lock();
        let s = streams.entry(stream.to_string()).or_insert(Stream {
            entries: VecDeque::new(),
            groups: HashMap::new(),
        });
        s.groups.entry(group.to_string()).or_insert(GroupState {
            last_delivered_offset: 0,
            pel: HashMap::new(),
        });
        Ok(())
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<StreamMessage>, StreamStoreError> {
        let mut streams = self.streams.lock();
        let Some(s) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = s.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        while out.len() < count && group_state.last_delivered_offset < s.entries.len() {
            let entry = &s.entries[group_state.last_delivered_offset];
            group_state.last_delivered_offset += 1;
            group_state.pel.insert(
                entry.id.clone(),
                PelRow {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
            out.push(StreamMessage {
                entry_id: entry.id.clone(),
                fields: entry.fields.clone(),
            });
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamStoreError> {
        let mut streams = self.streams.lock();
        let Some(s) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(group_state) = s.groups.get_mut(group) else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            if group_state.pel.remove(id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamStoreError> {
        let streams = self.streams.lock();
        let Some(s) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = s.groups.get(group) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<PendingEntry> = group_state
            .pel
            .iter()
            .map(|(id, row)| PendingEntry {
                entry_id: id.clone(),
                consumer: row.consumer.clone(),
                idle_ms: row.delivered_at.elapsed().as_millis() as u64,
                delivery_count: row.delivery_count,
            })
            .collect();
        rows.sort_by(|a, b| b.idle_ms.cmp(&a.idle_ms));
        rows.truncate(count);
        Ok(rows)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StreamStoreError> {
        let mut streams = self.streams.lock();
        let Some(s) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let entries_by_id: HashMap<String, HashMap<String, String>> = s
            .entries
            .iter()
            .map(|e| (e.id.clone(), e.fields.clone()))
            .collect();
        let Some(group_state) = s.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for id in ids {
            if let Some(row) = group_state.pel.get_mut(id) {
                if row.delivered_at.elapsed().as_millis() as u64 >= min_idle_ms {
                    row.consumer = consumer.to_string();
                    row.delivered_at = Instant::now();
                    row.delivery_count += 1;
                    if let Some(fields) = entries_by_id.get(id) {
                        out.push(StreamMessage {
                            entry_id: id.clone(),
                            fields: fields.clone(),
                        });
                    }
                }
            }
        }
        Ok(out)
    }

    async fn len(&self, stream: &str) -> Result<u64, StreamStoreError> {
        let streams = self.streams.lock();
        Ok(streams.get(stream).map(|s| s.entries.len() as u64).unwrap_or(0))
    }

    async fn peek(&self, stream: &str, count: usize) -> Result<Vec<StreamMessage>, StreamStoreError> {
        let streams = self.streams.lock();
        let Some(s) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(s.entries
            .iter()
            .take(count)
            .map(|e| StreamMessage {
                entry_id: e.id.clone(),
                fields: e.fields.clone(),
            })
            .collect())
    }

    async fn delete(&self, stream: &str, entry_id: &str) -> Result<u64, StreamStoreError> {
        let mut streams = self.streams.lock();
        let Some(s) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let before = s.entries.len();
        s.entries.retain(|e| e.id != entry_id);
        Ok((before - s.entries.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), StreamStoreError> {
        Ok(())
    }
}

/// Test-only hook for simulating idle time without sleeping: artificially
/// ages every pending entry currently in `group`'s PEL.
#[cfg(test)]
impl MockStreamStore {
    pub fn age_pel_entries(&self, stream: &str, group: &str, age: std::time::Duration) {
        let mut streams = self.streams.lock();
        if let Some(s) = streams.get_mut(stream) {
            if let Some(group_state) = s.groups.get_mut(group) {
                for row in group_state.pel.values_mut() {
                    row.delivered_at = Instant::now() - age;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_group_read_delivers_once() {
        let store = MockStreamStore::new();
        store.append("s", &[("payload".into(), "a".into())], None).await.unwrap();
        store.create_group("s", "g", "0").await.unwrap();
        let first = store.group_read("s", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.group_read("s", "g", "c1", 10, 0).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn ack_removes_from_pel_and_is_idempotent() {
        let store = MockStreamStore::new();
        let id = store.append("s", &[("payload".into(), "a".into())], None).await.unwrap();
        store.create_group("s", "g", "0").await.unwrap();
        store.group_read("s", "g", "c1", 10, 0).await.unwrap();
        let acked = store.ack("s", "g", &[id.clone()]).await.unwrap();
        assert_eq!(acked, 1);
        let acked_again = store.ack("s", "g", &[id]).await.unwrap();
        assert_eq!(acked_again, 0);
    }

    #[tokio::test]
    async fn claim_respects_min_idle_ms() {
        let store = MockStreamStore::new();
        store.append("s", &[("payload".into(), "a".into())], None).await.unwrap();
        store.create_group("s", "g", "0").await.unwrap();
        let delivered = store.group_read("s", "g", "c1", 10, 0).await.unwrap();
        let id = delivered[0].entry_id.clone();

        let not_claimed = store.claim("s", "g", "c2", 300_000, &[id.clone()]).await.unwrap();
        assert!(not_claimed.is_empty());

        store.age_pel_entries("s", "g", std::time::Duration::from_millis(300_000));
        let claimed = store.claim("s", "g", "c2", 300_000, &[id]).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn maxlen_trims_oldest() {
        let store = MockStreamStore::new();
        for i in 0..5 {
            store
                .append("s", &[("n".into(), i.to_string())], Some(3))
                .await
                .unwrap();
        }
        assert_eq!(store.len("s").await.unwrap(), 3);
    }
}
