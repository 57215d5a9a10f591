//! Per-fingerprint exponential backoff, grounded on the original
//! `BackoffManager`. Process-local: a restart loses tracking, which is
//! acceptable because the stream store's delivery count is the durable
//! upper bound on redelivery (see the consumer pipeline's orphan sweep).

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct RetryRecord {
    attempts: u32,
    next_ready_at: Instant,
}

pub struct RetryController {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_attempts: u32,
    records: DashMap<String, RetryRecord>,
}

impl RetryController {
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            max_attempts,
            records: DashMap::new(),
        }
    }

    /// `min(max_delay, initial_delay * multiplier^(attempts-1))`, for
    /// `attempts >= 1`.
    fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = (attempts.saturating_sub(1)) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// `false` if `attempts >= max_attempts` or `now < next_ready_at`.
    pub fn should_retry(&self, fingerprint: &str) -> bool {
        match self.records.get(fingerprint) {
            Some(record) => {
                record.attempts < self.max_attempts && Instant::now() >= record.next_ready_at
            }
            None => true,
        }
    }

    pub fn has_exceeded_max(&self, fingerprint: &str) -> bool {
        self.records
            .get(fingerprint)
            .map(|r| r.attempts >= self.max_attempts)
            .unwrap_or(false)
    }

    pub fn attempts(&self, fingerprint: &str) -> u32 {
        self.records.get(fingerprint).map(|r| r.attempts).unwrap_or(0)
    }

    /// Increments the attempt counter and schedules the next eligible retry.
    pub fn record_failure(&self, fingerprint: &str) -> u32 {
        let mut entry = self.records.entry(fingerprint.to_string()).or_insert(RetryRecord {
            attempts: 0,
            next_ready_at: Instant::now(),
        });
        entry.attempts += 1;
        entry.next_ready_at = Instant::now() + self.delay_for(entry.attempts);
        entry.attempts
    }

    pub fn record_success(&self, fingerprint: &str) {
        self.records.remove(fingerprint);
    }

    /// Sweeps entries whose next-ready clock predates `now - max_age`,
    /// bounding unbounded growth of the map for fingerprints that are never
    /// retried to completion (e.g. a worker that crashed mid-retry).
    pub fn cleanup_older_than(&self, max_age: Duration) {
        let cutoff = Instant::now().checked_sub(max_age);
        let Some(cutoff) = cutoff else { return };
        self.records.retain(|_, record| record.next_ready_at >= cutoff);
    }
}
