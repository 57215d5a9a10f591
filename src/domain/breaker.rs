//! Closed/open/half-open circuit breaker, grounded on the original
//! `CircuitBreaker`/`CircuitBreakers` pair: the open-to-half-open transition
//! is evaluated lazily on read, a half-open failure always reopens, and a
//! process-wide named registry provides get-or-create singleton access.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// A predicate deciding whether a given failure should be excluded from
/// counting against the breaker, mirroring `excluded_exceptions`: errors the
/// caller knows are not worth tripping the breaker over (bad input, a
/// permanent auth failure) can be classified out instead of silently
/// inflating the failure count.
pub type FailurePredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_rejections: u64,
    pub last_transition_at: Option<DateTimeIso>,
}

/// Lightweight ISO-8601 wrapper so stats serialize without pulling chrono
/// into this module's public API.
pub type DateTimeIso = String;

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_rejections: u64,
    last_failure_at: Option<Instant>,
    last_transition_at: Option<Instant>,
}

/// Per-dependency breaker. All mutation happens under `inner`'s lock; the
/// lock is held only for the duration of the state read/transition, never
/// across an awaited I/O call.
pub struct CircuitBreaker {
    pub name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    excluded: Option<FailurePredicate>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
        excluded: Option<FailurePredicate>,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            success_threshold,
            excluded,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                total_rejections: 0,
                last_failure_at: None,
                last_transition_at: None,
            }),
        }
    }

    /// Current state, applying the lazy open-to-half-open transition if the
    /// recovery timeout has elapsed since the last recorded failure.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_recover(&mut inner);
        inner.state
    }

    fn maybe_recover(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(last_failure) = inner.last_failure_at {
                if last_failure.elapsed() >= self.recovery_timeout {
                    self.transition(inner, CircuitState::HalfOpen);
                }
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        inner.state = to;
        inner.last_transition_at = Some(Instant::now());
        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                info!(breaker = %self.name, "circuit breaker closed");
            }
            CircuitState::Open => {
                inner.success_count = 0;
                warn!(breaker = %self.name, "circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                info!(breaker = %self.name, "circuit breaker half-open: probing");
            }
        }
    }

    /// `true` in closed or half-open; `false` in open (and counts a
    /// rejection).
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.maybe_recover(&mut inner);
        match inner.state {
            CircuitState::Open => {
                inner.total_rejections += 1;
                false
            }
            CircuitState::Closed | CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed operation. If `err` is given and matches the
    /// breaker's excluded-failure predicate, the call does not count against
    /// the breaker at all (not even a no-op success) — the same "skip
    /// excluded exceptions" behavior as the original.
    pub fn record_failure(&self, err: Option<&(dyn StdError + 'static)>) {
        if let Some(e) = err {
            if let Some(pred) = &self.excluded {
                if pred(e) {
                    return;
                }
            }
        }

        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// How long the caller should wait before retrying, if currently open.
    pub fn retry_after(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.state, inner.last_failure_at) {
            (CircuitState::Open, Some(last_failure)) => {
                self.recovery_timeout.saturating_sub(last_failure.elapsed())
            }
            _ => Duration::ZERO,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.total_rejections = 0;
        inner.last_failure_at = None;
        self.transition(&mut inner, CircuitState::Closed);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_rejections: inner.total_rejections,
            last_transition_at: inner
                .last_transition_at
                .map(|_| chrono::Utc::now().to_rfc3339()),
        }
    }
}

/// Process-wide named registry, get-or-create semantics.
pub struct CircuitBreakers {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            breakers: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(
        &self,
        name: &str,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
    ) -> Arc<CircuitBreaker> {
        self.get_with_excluded(name, failure_threshold, recovery_timeout, success_threshold, None)
    }

    /// Same as `get`, but the breaker (if newly created) is configured with
    /// an excluded-failure predicate. Only takes effect the first time a
    /// given name is created — like the rest of a breaker's thresholds, the
    /// exclusion rule is fixed at creation, not reconfigured on each `get`.
    pub fn get_with_excluded(
        &self,
        name: &str,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
        excluded: Option<FailurePredicate>,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    failure_threshold,
                    recovery_timeout,
                    success_threshold,
                    excluded,
                ))
            })
            .clone()
    }

    pub fn get_all_stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.lock().values().map(|b| b.stats()).collect()
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.lock().values() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("redis", 3, Duration::from_millis(20), 2, None)
    }

    #[test]
    fn opens_after_threshold_failures() {
        let b = breaker();
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure(None);
        b.record_failure(None);
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure(None);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow_request());
    }

    #[test]
    fn success_resets_failure_count_in_closed() {
        let b = breaker();
        b.record_failure(None);
        b.record_failure(None);
        b.record_success();
        b.record_failure(None);
        b.record_failure(None);
        // the earlier two failures were reset, so this is only the 2nd in a row
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_regardless_of_success_threshold() {
        let b = breaker();
        b.record_failure(None);
        b.record_failure(None);
        b.record_failure(None);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_failure(None);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let b = breaker();
        b.record_failure(None);
        b.record_failure(None);
        b.record_failure(None);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_returns_same_instance_for_same_name() {
        let registry = CircuitBreakers::new();
        let a = registry.get("redis", 5, Duration::from_secs(60), 3);
        let b = registry.get("redis", 5, Duration::from_secs(60), 3);
        a.record_failure(None);
        assert_eq!(b.stats().failure_count, 1);
    }

    #[derive(Debug)]
    struct BadInput;

    impl std::fmt::Display for BadInput {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "bad input")
        }
    }

    impl StdError for BadInput {}

    #[test]
    fn excluded_failures_do_not_count() {
        let excluded: FailurePredicate = Arc::new(|e| e.downcast_ref::<BadInput>().is_some());
        let b = CircuitBreaker::new("redis", 2, Duration::from_secs(60), 2, Some(excluded));
        b.record_failure(Some(&BadInput));
        b.record_failure(Some(&BadInput));
        b.record_failure(Some(&BadInput));
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
