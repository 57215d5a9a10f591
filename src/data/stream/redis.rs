//! Redis Streams-backed `StreamStore`. Redis Streams commands are not
//! covered by deadpool-redis's typed `AsyncCommands`, so every operation
//! here issues a raw `redis::cmd(...)` pipeline, the same fallback the
//! teacher's cache adapter uses for `EVAL`/`SCAN`/`PSETEX`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, RedisError};
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use tracing::{info, warn};

use crate::data::error::StreamStoreError;

use super::{PendingEntry, StreamMessage, StreamStore};

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 50;

pub struct RedisStreamStore {
    pool: Pool,
}

impl RedisStreamStore {
    pub fn new(redis_url: &str) -> Result<Self, StreamStoreError> {
        let mut cfg = Config::from_url(redis_url);
        cfg.pool = Some(PoolConfig {
            max_size: 32,
            timeouts: deadpool_redis::Timeouts {
                wait: Some(Duration::from_secs(5)),
                create: Some(Duration::from_secs(5)),
                recycle: Some(Duration::from_secs(5)),
            },
            ..PoolConfig::default()
        });
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StreamStoreError::Config(e.to_string()))?;
        info!(target = %sanitize_redis_url(redis_url), "stream store pool created");
        Ok(Self { pool })
    }

    async fn with_retry<T, F, Fut>(&self, op_name: &str, f: F) -> Result<T, StreamStoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StreamStoreError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = BASE_DELAY_MS * 2u64.pow(attempt - 1);
                    warn!(op = op_name, attempt, error = %e, "transient stream store error, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) if e.is_transient() => return Err(StreamStoreError::Timeout { attempts: attempt }),
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: Option<u64>,
    ) -> Result<String, StreamStoreError> {
        if fields.is_empty() {
            return Err(StreamStoreError::InvalidArgs("append requires at least one field".into()));
        }
        self.with_retry("append", || async {
            let mut conn = self.pool.get().await?;
            let mut c = cmd("XADD");
            c.arg(stream);
            if let Some(maxlen) = maxlen {
                c.arg("MAXLEN").arg("~").arg(maxlen);
            }
            c.arg("*");
            for (k, v) in fields {
                c.arg(k).arg(v);
            }
            let id: String = c.query_async(&mut conn).await?;
            Ok(id)
        })
        .await
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> Result<(), StreamStoreError> {
        self.with_retry("create_group", || async {
            let mut conn = self.pool.get().await?;
            let result: Result<String, RedisError> = cmd("XGROUP")
                .arg("CREATE")
                .arg(stream)
                .arg(group)
                .arg(start_id)
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            match result {
                Ok(_) => Ok(()),
                Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
                Err(e) => Err(StreamStoreError::from(e)),
            }
        })
        .await
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, StreamStoreError> {
        self.with_retry("group_read", || async {
            let mut conn = self.pool.get().await?;
            let reply: Option<Vec<(String, Vec<(String, Vec<(String, String)>)>)>> = cmd("XREADGROUP")
                .arg("GROUP")
                .arg(group)
                .arg(consumer)
                .arg("COUNT")
                .arg(count)
                .arg("BLOCK")
                .arg(block_ms)
                .arg("STREAMS")
                .arg(stream)
                .arg(">")
                .query_async(&mut conn)
                .await?;
            Ok(flatten_stream_reply(reply))
        })
        .await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_retry("ack", || async {
            let mut conn = self.pool.get().await?;
            let mut c = cmd("XACK");
            c.arg(stream).arg(group);
            for id in ids {
                c.arg(id);
            }
            let n: u64 = c.query_async(&mut conn).await?;
            Ok(n)
        })
        .await
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamStoreError> {
        self.with_retry("pending_range", || async {
            let mut conn = self.pool.get().await?;
            let rows: Vec<(String, String, u64, u64)> = cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .arg("IDLE")
                .arg(0)
                .arg("-")
                .arg("+")
                .arg(count)
                .query_async(&mut conn)
                .await?;
            Ok(rows
                .into_iter()
                .map(|(entry_id, consumer, idle_ms, delivery_count)| PendingEntry {
                    entry_id,
                    consumer,
                    idle_ms,
                    delivery_count,
                })
                .collect())
        })
        .await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StreamStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_retry("claim", || async {
            let mut conn = self.pool.get().await?;
            let mut c = cmd("XCLAIM");
            c.arg(stream).arg(group).arg(consumer).arg(min_idle_ms);
            for id in ids {
                c.arg(id);
            }
            let rows: Vec<(String, Vec<(String, String)>)> = c.query_async(&mut conn).await?;
            Ok(rows
                .into_iter()
                .map(|(entry_id, kv)| StreamMessage {
                    entry_id,
                    fields: kv.into_iter().collect(),
                })
                .collect())
        })
        .await
    }

    async fn len(&self, stream: &str) -> Result<u64, StreamStoreError> {
        self.with_retry("len", || async {
            let mut conn = self.pool.get().await?;
            let n: u64 = cmd("XLEN").arg(stream).query_async(&mut conn).await?;
            Ok(n)
        })
        .await
    }

    async fn peek(&self, stream: &str, count: usize) -> Result<Vec<StreamMessage>, StreamStoreError> {
        self.with_retry("peek", || async {
            let mut conn = self.pool.get().await?;
            let rows: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
                .arg(stream)
                .arg("-")
                .arg("+")
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await?;
            Ok(rows
                .into_iter()
                .map(|(entry_id, kv)| StreamMessage {
                    entry_id,
                    fields: kv.into_iter().collect(),
                })
                .collect())
        })
        .await
    }

    async fn delete(&self, stream: &str, entry_id: &str) -> Result<u64, StreamStoreError> {
        self.with_retry("delete", || async {
            let mut conn = self.pool.get().await?;
            let n: u64 = cmd("XDEL").arg(stream).arg(entry_id).query_async(&mut conn).await?;
            Ok(n)
        })
        .await
    }

    async fn health_check(&self) -> Result<(), StreamStoreError> {
        let mut conn = self.pool.get().await?;
        let _: String = cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
        info!("stream store pool closed");
    }
}

fn flatten_stream_reply(
    reply: Option<Vec<(String, Vec<(String, Vec<(String, String)>)>)>>,
) -> Vec<StreamMessage> {
    let mut out = Vec::new();
    for (_stream_name, entries) in reply.unwrap_or_default() {
        for (entry_id, kv) in entries {
            out.push(StreamMessage {
                entry_id,
                fields: kv.into_iter().collect::<HashMap<_, _>>(),
            });
        }
    }
    out
}

/// Masks the password component of a redis URL for logging, mirroring the
/// teacher's `sanitize_redis_url`.
fn sanitize_redis_url(url: &str) -> String {
    if let Some(at_idx) = url.rfind('@') {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end + 3];
            let after_scheme = &url[scheme_end + 3..at_idx];
            let host_part = &url[at_idx..];
            return match after_scheme.find(':') {
                Some(colon_idx) => format!("{scheme}{}:***{host_part}", &after_scheme[..colon_idx]),
                None => format!("{scheme}***{host_part}"),
            };
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_masks_password_only() {
        let masked = sanitize_redis_url("redis://:hunter2@localhost:6379/0");
        assert_eq!(masked, "redis://:***@localhost:6379/0");
    }

    #[test]
    fn sanitize_is_noop_without_credentials() {
        let url = "redis://localhost:6379/0";
        assert_eq!(sanitize_redis_url(url), url);
    }

    #[test]
    fn flatten_handles_missing_reply() {
        assert!(flatten_stream_reply(None).is_empty());
    }

    #[test]
    fn flatten_collects_fields_per_entry() {
        let reply = Some(vec![(
            "stream".to_string(),
            vec![
                ("1-0".to_string(), vec![("payload".to_string(), "a".to_string())]),
                ("2-0".to_string(), vec![("payload".to_string(), "b".to_string())]),
            ],
        )]);
        let messages = flatten_stream_reply(reply);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].entry_id, "1-0");
        assert_eq!(messages[1].fields.get("payload").unwrap(), "b");
    }
}
