//! In-process metrics collector, updated directly by the producer/worker
//! pipelines and rendered on `/status` (JSON) and `/metrics` (Prometheus
//! text). The spec fixes names and semantics, not an exposition format, so
//! this is a small atomics/histogram struct rather than a full metrics-crate
//! integration — the same "roll it yourself, expose it over `axum`" shape the
//! teacher uses for its own `/health` surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde::Serialize;

/// Fixed-bucket histogram (Prometheus-style cumulative buckets plus sum/count).
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: (0..bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_millis: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value_seconds: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if value_seconds <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_millis
            .fetch_add((value_seconds * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, name: &str, out: &mut String) {
        use std::fmt::Write;
        let mut cumulative = 0u64;
        for (bound, bucket) in self.bounds.iter().zip(self.buckets.iter()) {
            cumulative = cumulative.max(bucket.load(Ordering::Relaxed));
            let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
        }
        let count = self.count.load(Ordering::Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum = self.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0;
        let _ = writeln!(out, "{name}_sum {sum}");
        let _ = writeln!(out, "{name}_count {count}");
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum_seconds: self.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

#[derive(Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_seconds: f64,
}

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Process-wide metrics, constructed once at binary startup and shared via
/// `Arc` with every pipeline/task that can observe something.
pub struct AppMetrics {
    pub emails_produced_total: AtomicU64,
    pub emails_processed_total: AtomicU64,
    pub emails_failed_total: AtomicU64,
    pub dlq_messages_total: AtomicU64,
    pub backoff_retries_total: AtomicU64,
    pub idempotency_duplicates_total: AtomicU64,
    pub orphan_messages_claimed_total: AtomicU64,
    pub imap_polls_total: AtomicU64,

    pub processing_latency_seconds: Histogram,
    pub imap_poll_duration_seconds: Histogram,

    stream_depth: AtomicU64,
    dlq_depth: AtomicU64,
    active_workers: AtomicU64,
    breaker_states: Mutex<std::collections::HashMap<String, i64>>,
    started_at: Instant,
}

impl AppMetrics {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            emails_produced_total: AtomicU64::new(0),
            emails_processed_total: AtomicU64::new(0),
            emails_failed_total: AtomicU64::new(0),
            dlq_messages_total: AtomicU64::new(0),
            backoff_retries_total: AtomicU64::new(0),
            idempotency_duplicates_total: AtomicU64::new(0),
            orphan_messages_claimed_total: AtomicU64::new(0),
            imap_polls_total: AtomicU64::new(0),
            processing_latency_seconds: Histogram::new(LATENCY_BUCKETS),
            imap_poll_duration_seconds: Histogram::new(LATENCY_BUCKETS),
            stream_depth: AtomicU64::new(0),
            dlq_depth: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
            breaker_states: Mutex::new(std::collections::HashMap::new()),
            started_at: Instant::now(),
        })
    }

    pub fn set_stream_depth(&self, v: u64) {
        self.stream_depth.store(v, Ordering::Relaxed);
    }

    pub fn set_dlq_depth(&self, v: u64) {
        self.dlq_depth.store(v, Ordering::Relaxed);
    }

    pub fn set_active_workers(&self, v: u64) {
        self.active_workers.store(v, Ordering::Relaxed);
    }

    pub fn set_breaker_state(&self, name: &str, value: i64) {
        self.breaker_states.lock().insert(name.to_string(), value);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            emails_produced_total: self.emails_produced_total.load(Ordering::Relaxed),
            emails_processed_total: self.emails_processed_total.load(Ordering::Relaxed),
            emails_failed_total: self.emails_failed_total.load(Ordering::Relaxed),
            dlq_messages_total: self.dlq_messages_total.load(Ordering::Relaxed),
            backoff_retries_total: self.backoff_retries_total.load(Ordering::Relaxed),
            idempotency_duplicates_total: self.idempotency_duplicates_total.load(Ordering::Relaxed),
            orphan_messages_claimed_total: self.orphan_messages_claimed_total.load(Ordering::Relaxed),
            imap_polls_total: self.imap_polls_total.load(Ordering::Relaxed),
            processing_latency_seconds: self.processing_latency_seconds.snapshot(),
            imap_poll_duration_seconds: self.imap_poll_duration_seconds.snapshot(),
            stream_depth: self.stream_depth.load(Ordering::Relaxed),
            dlq_depth: self.dlq_depth.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
            circuit_breaker_state: self.breaker_states.lock().clone(),
        }
    }

    /// Renders the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        macro_rules! counter {
            ($field:ident) => {
                let _ = writeln!(out, "# TYPE {} counter", stringify!($field));
                let _ = writeln!(out, "{} {}", stringify!($field), self.$field.load(Ordering::Relaxed));
            };
        }
        counter!(emails_produced_total);
        counter!(emails_processed_total);
        counter!(emails_failed_total);
        counter!(dlq_messages_total);
        counter!(backoff_retries_total);
        counter!(idempotency_duplicates_total);
        counter!(orphan_messages_claimed_total);
        counter!(imap_polls_total);

        let _ = writeln!(out, "# TYPE processing_latency_seconds histogram");
        self.processing_latency_seconds.render("processing_latency_seconds", &mut out);
        let _ = writeln!(out, "# TYPE imap_poll_duration_seconds histogram");
        self.imap_poll_duration_seconds.render("imap_poll_duration_seconds", &mut out);

        let _ = writeln!(out, "# TYPE stream_depth gauge");
        let _ = writeln!(out, "stream_depth {}", self.stream_depth.load(Ordering::Relaxed));
        let _ = writeln!(out, "# TYPE dlq_depth gauge");
        let _ = writeln!(out, "dlq_depth {}", self.dlq_depth.load(Ordering::Relaxed));
        let _ = writeln!(out, "# TYPE active_workers gauge");
        let _ = writeln!(out, "active_workers {}", self.active_workers.load(Ordering::Relaxed));
        let _ = writeln!(out, "# TYPE uptime_seconds gauge");
        let _ = writeln!(out, "uptime_seconds {}", self.uptime_seconds());

        let _ = writeln!(out, "# TYPE circuit_breaker_state gauge");
        for (name, value) in self.breaker_states.lock().iter() {
            let _ = writeln!(out, "circuit_breaker_state{{name=\"{name}\"}} {value}");
        }
        out
    }
}

/// Standalone `/metrics` server, bound to its own port separate from the
/// health/readiness surface so a scrape-interval hiccup on one can't affect
/// the other.
pub fn router(metrics: Arc<AppMetrics>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<AppMetrics>>) -> impl IntoResponse {
    metrics.render_prometheus()
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub emails_produced_total: u64,
    pub emails_processed_total: u64,
    pub emails_failed_total: u64,
    pub dlq_messages_total: u64,
    pub backoff_retries_total: u64,
    pub idempotency_duplicates_total: u64,
    pub orphan_messages_claimed_total: u64,
    pub imap_polls_total: u64,
    pub processing_latency_seconds: HistogramSnapshot,
    pub imap_poll_duration_seconds: HistogramSnapshot,
    pub stream_depth: u64,
    pub dlq_depth: u64,
    pub active_workers: u64,
    pub uptime_seconds: u64,
    pub circuit_breaker_state: std::collections::HashMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let m = AppMetrics::new();
        m.emails_processed_total.fetch_add(3, Ordering::Relaxed);
        m.emails_failed_total.fetch_add(1, Ordering::Relaxed);
        let snap = m.snapshot();
        assert_eq!(snap.emails_processed_total, 3);
        assert_eq!(snap.emails_failed_total, 1);
    }

    #[test]
    fn histogram_observe_increments_count_and_sum() {
        let h = Histogram::new(LATENCY_BUCKETS);
        h.observe(0.2);
        h.observe(1.5);
        let snap = h.snapshot();
        assert_eq!(snap.count, 2);
        assert!((snap.sum_seconds - 1.7).abs() < 0.01);
    }

    #[test]
    fn prometheus_output_includes_every_counter_name() {
        let m = AppMetrics::new();
        let text = m.render_prometheus();
        assert!(text.contains("emails_processed_total"));
        assert!(text.contains("dlq_depth"));
        assert!(text.contains("processing_latency_seconds_bucket"));
    }
}
