//! Deduplication by fingerprint (C4), grounded on the original
//! `IdempotencyManager`: a single Redis set, `SADD`/`SISMEMBER` for
//! membership, a key-level TTL refreshed only on the first insert after
//! expiry (an `SADD` reply of 1 combined with an empty set moments before
//! means the key had expired and was just recreated).
//!
//! Backed by Redis rather than an in-process cache: the correctness
//! requirement ("any consumer, after any `MarkProcessed`, must return true")
//! has to hold across the whole consumer group, which runs as independent
//! OS processes sharing no memory.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;

use crate::data::error::StreamStoreError;

#[async_trait]
pub trait IdempotencyFilter: Send + Sync {
    async fn is_duplicate(&self, fingerprint: &str) -> Result<bool, StreamStoreError>;

    /// Returns `true` if `fingerprint` was newly added (i.e. not already a
    /// member).
    async fn mark_processed(&self, fingerprint: &str) -> Result<bool, StreamStoreError>;

    async fn count(&self) -> Result<u64, StreamStoreError>;

    async fn clear(&self) -> Result<(), StreamStoreError>;
}

pub struct RedisIdempotencyFilter {
    pool: Pool,
    key: String,
    ttl: Option<Duration>,
}

impl RedisIdempotencyFilter {
    pub fn new(pool: Pool, key: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            pool,
            key: key.into(),
            ttl: if ttl_seconds == 0 {
                None
            } else {
                Some(Duration::from_secs(ttl_seconds))
            },
        }
    }
}

#[async_trait]
impl IdempotencyFilter for RedisIdempotencyFilter {
    async fn is_duplicate(&self, fingerprint: &str) -> Result<bool, StreamStoreError> {
        let mut conn = self.pool.get().await?;
        let is_member: bool = cmd("SISMEMBER")
            .arg(&self.key)
            .arg(fingerprint)
            .query_async(&mut conn)
            .await?;
        Ok(is_member)
    }

    async fn mark_processed(&self, fingerprint: &str) -> Result<bool, StreamStoreError> {
        let mut conn = self.pool.get().await?;
        let added: i64 = cmd("SADD")
            .arg(&self.key)
            .arg(fingerprint)
            .query_async(&mut conn)
            .await?;
        if added > 0 {
            if let Some(ttl) = self.ttl {
                let _: () = cmd("EXPIRE")
                    .arg(&self.key)
                    .arg(ttl.as_secs())
                    .query_async(&mut conn)
                    .await?;
            }
        }
        Ok(added > 0)
    }

    async fn count(&self) -> Result<u64, StreamStoreError> {
        let mut conn = self.pool.get().await?;
        let n: u64 = cmd("SCARD").arg(&self.key).query_async(&mut conn).await?;
        Ok(n)
    }

    async fn clear(&self) -> Result<(), StreamStoreError> {
        let mut conn = self.pool.get().await?;
        let _: () = cmd("DEL").arg(&self.key).query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-memory stand-in used by pipeline tests; a single process is
/// sufficient there, so the cross-consumer sharing concern does not apply.
#[cfg(test)]
pub struct MockIdempotencyFilter {
    seen: parking_lot::Mutex<std::collections::HashSet<String>>,
}

#[cfg(test)]
impl MockIdempotencyFilter {
    pub fn new() -> Self {
        Self {
            seen: parking_lot::Mutex::new(std::collections::HashSet::new()),
        }
    }
}

#[cfg(test)]
impl Default for MockIdempotencyFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[async_trait]
impl IdempotencyFilter for MockIdempotencyFilter {
    async fn is_duplicate(&self, fingerprint: &str) -> Result<bool, StreamStoreError> {
        Ok(self.seen.lock().contains(fingerprint))
    }

    async fn mark_processed(&self, fingerprint: &str) -> Result<bool, StreamStoreError> {
        Ok(self.seen.lock().insert(fingerprint.to_string()))
    }

    async fn count(&self) -> Result<u64, StreamStoreError> {
        Ok(self.seen.lock().len() as u64)
    }

    async fn clear(&self) -> Result<(), StreamStoreError> {
        self.seen.lock().clear();
        Ok(())
    }
}
