//! Orphan-message recovery and the connection watchdog (C7 supporting
//! mechanisms), grounded on the original `OrphanedMessageRecovery` and
//! `ConnectionWatchdog`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::data::error::StreamStoreError;
use crate::data::stream::{PendingEntry, StreamMessage, StreamStore};
use crate::domain::breaker::CircuitBreakers;

pub struct OrphanRecovery {
    store: Arc<dyn StreamStore>,
    stream: String,
    group: String,
    min_idle_ms: u64,
    max_claim_count: usize,
    max_delivery_count: u64,
}

pub struct SweepResult {
    pub claimed: Vec<StreamMessage>,
    pub expired: Vec<PendingEntry>,
}

impl OrphanRecovery {
    pub fn new(
        store: Arc<dyn StreamStore>,
        stream: impl Into<String>,
        group: impl Into<String>,
        min_idle_ms: u64,
        max_claim_count: usize,
        max_delivery_count: u64,
    ) -> Self {
        Self {
            store,
            stream: stream.into(),
            group: group.into(),
            min_idle_ms,
            max_claim_count,
            max_delivery_count,
        }
    }

    /// Enumerates the PEL, filters by idle time, partitions by delivery
    /// count, and claims the claimable half under `consumer`. The caller is
    /// responsible for routing `expired` entries to the DLQ and acking them.
    pub async fn sweep(&self, consumer: &str) -> Result<SweepResult, StreamStoreError> {
        let pending = self
            .store
            .pending_range(&self.stream, &self.group, self.max_claim_count)
            .await?;

        let idle_enough: Vec<PendingEntry> = pending
            .into_iter()
            .filter(|p| p.idle_ms >= self.min_idle_ms)
            .collect();

        let mut claimable_ids = Vec::new();
        let mut expired = Vec::new();
        for entry in idle_enough {
            if entry.delivery_count >= self.max_delivery_count {
                expired.push(entry);
            } else {
                claimable_ids.push(entry.entry_id);
            }
        }

        let claimed = if claimable_ids.is_empty() {
            Vec::new()
        } else {
            self.store
                .claim(&self.stream, &self.group, consumer, self.min_idle_ms, &claimable_ids)
                .await?
        };

        if !claimed.is_empty() || !expired.is_empty() {
            info!(claimed = claimed.len(), expired = expired.len(), "orphan sweep complete");
        }

        Ok(SweepResult { claimed, expired })
    }
}

type CheckFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;
type ReconnectFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct WatchedCheck {
    name: String,
    check: CheckFn,
    reconnect: Option<ReconnectFn>,
    consecutive_failures: AtomicU32,
    healthy: AtomicBool,
}

/// Periodically runs named health checks and drives the matching circuit
/// breaker's success/failure recording; invokes a reconnect hook after
/// `max_consecutive_failures`.
pub struct ConnectionWatchdog {
    checks: Mutex<Vec<Arc<WatchedCheck>>>,
    breakers: Arc<CircuitBreakers>,
    check_interval: Duration,
    max_consecutive_failures: u32,
}

impl ConnectionWatchdog {
    pub fn new(breakers: Arc<CircuitBreakers>, check_interval: Duration, max_consecutive_failures: u32) -> Self {
        Self {
            checks: Mutex::new(Vec::new()),
            breakers,
            check_interval,
            max_consecutive_failures,
        }
    }

    pub fn add_check<F, Fut>(&self, name: impl Into<String>, check: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.checks.lock().push(Arc::new(WatchedCheck {
            name: name.into(),
            check: Arc::new(move || Box::pin(check())),
            reconnect: None,
            consecutive_failures: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
        }));
    }

    pub fn add_check_with_reconnect<F, Fut, R, RFut>(&self, name: impl Into<String>, check: F, reconnect: R)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
        R: Fn() -> RFut + Send + Sync + 'static,
        RFut: Future<Output = ()> + Send + 'static,
    {
        self.checks.lock().push(Arc::new(WatchedCheck {
            name: name.into(),
            check: Arc::new(move || Box::pin(check())),
            reconnect: Some(Arc::new(move || Box::pin(reconnect()))),
            consecutive_failures: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
        }));
    }

    pub fn all_healthy(&self) -> bool {
        self.checks.lock().iter().all(|c| c.healthy.load(Ordering::SeqCst))
    }

    pub fn status(&self) -> HashMap<String, bool> {
        self.checks
            .lock()
            .iter()
            .map(|c| (c.name.clone(), c.healthy.load(Ordering::SeqCst)))
            .collect()
    }

    /// Runs every registered check once.
    pub async fn run_once(&self) {
        let checks: Vec<Arc<WatchedCheck>> = self.checks.lock().clone();
        for check in checks {
            let healthy = (check.check)().await;
            let breaker = self.breakers.get(
                &check.name,
                5,
                Duration::from_secs(60),
                3,
            );
            if healthy {
                let was_unhealthy = !check.healthy.load(Ordering::SeqCst);
                check.consecutive_failures.store(0, Ordering::SeqCst);
                check.healthy.store(true, Ordering::SeqCst);
                if was_unhealthy {
                    breaker.record_success();
                }
            } else {
                let failures = check.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                breaker.record_failure(None);
                if failures >= self.max_consecutive_failures {
                    if check.healthy.swap(false, Ordering::SeqCst) {
                        warn!(check = %check.name, failures, "dependency marked unhealthy");
                    }
                    if let Some(reconnect) = &check.reconnect {
                        (reconnect)().await;
                    }
                }
            }
        }
    }

    /// Spawns a task that calls `run_once` every `check_interval` until
    /// `running` returns false.
    pub fn spawn(self: Arc<Self>, running: Arc<dyn Fn() -> bool + Send + Sync>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while running() {
                self.run_once().await;
                tokio::time::sleep(self.check_interval).await;
            }
        })
    }
}

impl Clone for WatchedCheck {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            check: Arc::clone(&self.check),
            reconnect: self.reconnect.clone(),
            consecutive_failures: AtomicU32::new(self.consecutive_failures.load(Ordering::SeqCst)),
            healthy: AtomicBool::new(self.healthy.load(Ordering::SeqCst)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::stream::mock::MockStreamStore;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn sweep_partitions_claimable_and_expired() {
        let mock = Arc::new(MockStreamStore::new());
        mock.create_group("s", "g", "0").await.unwrap();
        mock.append("s", &[("payload".into(), "a".into())], None).await.unwrap();
        mock.group_read("s", "g", "c1", 10, 0).await.unwrap();
        mock.age_pel_entries("s", "g", Duration::from_millis(300_000));

        let store: Arc<dyn StreamStore> = mock;
        let recovery = OrphanRecovery::new(Arc::clone(&store), "s", "g", 300_000, 50, 10);
        let result = recovery.sweep("c2").await.unwrap();
        assert_eq!(result.claimed.len(), 1);
        assert!(result.expired.is_empty());
    }

    #[tokio::test]
    async fn watchdog_marks_unhealthy_after_consecutive_failures() {
        let breakers = CircuitBreakers::new();
        let watchdog = ConnectionWatchdog::new(Arc::clone(&breakers), Duration::from_secs(30), 3);
        let reconnects = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&reconnects);
        watchdog.add_check_with_reconnect(
            "redis",
            || async { false },
            move || {
                let r = Arc::clone(&r);
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        watchdog.run_once().await;
        watchdog.run_once().await;
        assert!(watchdog.all_healthy());
        watchdog.run_once().await;
        assert!(!watchdog.all_healthy());
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    }
}
