//! Cooperative graceful-shutdown coordination.
//!
//! Combines the teacher's `tokio::watch`-based signal broadcast and
//! `JoinHandle` registry with the priority-bucketed callback release used by
//! the original ingestion pipeline: callbacks are sorted by priority (lower
//! runs first) and each is given a shrinking slice of a single total
//! deadline, rather than an unconditional per-callback timeout.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Stopped,
}

struct Callback {
    priority: u32,
    name: String,
    run: Arc<dyn Fn() -> BoxFuture + Send + Sync>,
}

/// Single-instance-per-process shutdown coordinator.
pub struct ShutdownService {
    state: Mutex<ShutdownState>,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
    callbacks: Mutex<Vec<Callback>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    total_deadline: Duration,
}

impl ShutdownService {
    pub fn new(total_deadline: Duration) -> Arc<Self> {
        let (tx, rx) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(ShutdownState::Running),
            tx,
            rx,
            callbacks: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            total_deadline,
        })
    }

    /// Registers a callback to run during `initiate`. Lower `priority` runs
    /// first. Suggested buckets: 0-9 stop accepting work, 10-19 drain
    /// in-flight, 20-29 flush state, 30-39 close external connections,
    /// 40-49 close logs/tmp.
    pub fn register<F, Fut>(&self, priority: u32, name: impl Into<String>, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: Arc<dyn Fn() -> BoxFuture + Send + Sync> =
            Arc::new(move || Box::pin(callback()));
        let mut callbacks = self.callbacks.lock();
        callbacks.push(Callback {
            priority,
            name: name.into(),
            run: wrapped,
        });
        callbacks.sort_by_key(|c| c.priority);
    }

    /// Tracks a spawned task so `initiate` can await its natural completion
    /// as part of the drain phase.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.handles.lock().push(handle);
    }

    /// Convenience wrapper over `register` for a callback that must
    /// force-stop a background task rather than wait for it to drain on its
    /// own, e.g. the health endpoint listener or the watchdog loop.
    pub fn register_abort(&self, priority: u32, name: impl Into<String>, handle: JoinHandle<()>) {
        let handle = Arc::new(Mutex::new(Some(handle)));
        self.register(priority, name, move || {
            let handle = Arc::clone(&handle);
            async move {
                if let Some(h) = handle.lock().take() {
                    h.abort();
                    let _ = h.await;
                }
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// Cheap check polled at every loop's safe point.
    pub fn is_running(&self) -> bool {
        *self.state.lock() == ShutdownState::Running
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock()
    }

    /// Idempotent: only the first call runs the release sequence.
    pub async fn initiate(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != ShutdownState::Running {
                return;
            }
            *state = ShutdownState::ShuttingDown;
        }
        let _ = self.tx.send(true);
        info!("shutdown initiated");

        let deadline = Instant::now() + self.total_deadline;
        let callbacks: Vec<Callback> = {
            let mut guard = self.callbacks.lock();
            std::mem::take(&mut *guard)
        };

        for cb in callbacks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                error!(callback = %cb.name, priority = cb.priority, "skipping shutdown callback: deadline exceeded");
                continue;
            }
            let guarded = AssertUnwindSafe((cb.run)()).catch_unwind();
            match tokio::time::timeout(remaining, guarded).await {
                Ok(Ok(())) => info!(callback = %cb.name, priority = cb.priority, "shutdown callback complete"),
                Ok(Err(_)) => error!(callback = %cb.name, priority = cb.priority, "shutdown callback panicked"),
                Err(_) => warn!(callback = %cb.name, priority = cb.priority, "shutdown callback timed out"),
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock();
            std::mem::take(&mut *guard)
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let _ = tokio::time::timeout(remaining, futures::future::join_all(handles)).await;

        *self.state.lock() = ShutdownState::Stopped;
        info!("shutdown complete");
    }

    /// Hooks ctrl-c and, on unix, SIGTERM to `initiate`.
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            svc.initiate().await;
        });
    }

    /// Blocks until shutdown has been initiated, or `timeout` elapses.
    pub async fn wait_for_shutdown(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.rx.clone();
        let wait = async {
            let _ = rx.changed().await;
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn callbacks_run_in_priority_order() {
        let svc = ShutdownService::new(Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        svc.register(30, "close-connections", move || {
            let o = Arc::clone(&o1);
            async move {
                o.lock().push("close-connections");
            }
        });
        let o2 = Arc::clone(&order);
        svc.register(0, "stop-accepting", move || {
            let o = Arc::clone(&o2);
            async move {
                o.lock().push("stop-accepting");
            }
        });
        let o3 = Arc::clone(&order);
        svc.register(20, "flush-state", move || {
            let o = Arc::clone(&o3);
            async move {
                o.lock().push("flush-state");
            }
        });

        svc.initiate().await;

        assert_eq!(
            *order.lock(),
            vec!["stop-accepting", "flush-state", "close-connections"]
        );
        assert_eq!(svc.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn initiate_is_idempotent() {
        let svc = ShutdownService::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        svc.register(0, "once", move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        svc.initiate().await;
        svc.initiate().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn is_running_flips_after_initiate() {
        let svc = ShutdownService::new(Duration::from_secs(1));
        assert!(svc.is_running());
        svc.initiate().await;
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn slow_callback_is_skipped_once_deadline_exceeded() {
        let svc = ShutdownService::new(Duration::from_millis(50));
        let ran = Arc::new(AtomicUsize::new(0));

        svc.register(0, "slow", || async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        let r = Arc::clone(&ran);
        svc.register(10, "after", move || {
            let r = Arc::clone(&r);
            async move {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        svc.initiate().await;
        // the slow callback's own timeout consumes the whole deadline, so
        // "after" should be skipped.
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_callback_does_not_abort_later_callbacks() {
        let svc = ShutdownService::new(Duration::from_secs(5));
        let ran = Arc::new(AtomicUsize::new(0));

        svc.register(0, "panics", || async move {
            panic!("boom");
        });
        let r = Arc::clone(&ran);
        svc.register(10, "after", move || {
            let r = Arc::clone(&r);
            async move {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        svc.initiate().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(svc.state(), ShutdownState::Stopped);
    }
}
