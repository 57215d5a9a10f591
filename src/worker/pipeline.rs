//! Consumer Pipeline (C7): group read → filter → process → ack, with
//! retry/DLQ branches, periodic orphan sweep, and watchdog-driven breaker
//! feedback. Mirrors the original `EmailConsumer.run`/`process_message` step
//! by step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::api::metrics::AppMetrics;
use crate::core::config::AppConfig;
use crate::core::correlation;
use crate::core::shutdown::ShutdownService;
use crate::data::error::StreamStoreError;
use crate::data::stream::{PendingEntry, StreamMessage, StreamStore};
use crate::domain::breaker::{CircuitBreaker, CircuitBreakers};
use crate::domain::email::DlqRecord;
use crate::domain::idempotency::IdempotencyFilter;
use crate::domain::retry::RetryController;

use super::dlq::DlqManager;
use super::processor::EmailProcessor;
use super::recovery::OrphanRecovery;

pub struct ConsumerPipeline {
    config: AppConfig,
    stream: String,
    group: String,
    consumer: String,
    batch_size: usize,
    block_timeout_ms: u64,
    store: Arc<dyn StreamStore>,
    idempotency: Arc<dyn IdempotencyFilter>,
    retry: Arc<RetryController>,
    dlq: DlqManager,
    recovery: OrphanRecovery,
    processor: Arc<dyn EmailProcessor>,
    breakers: Arc<CircuitBreakers>,
    shutdown: Arc<ShutdownService>,
    metrics: Arc<AppMetrics>,
    processed_since_log: AtomicU64,
}

#[allow(clippy::too_many_arguments)]
impl ConsumerPipeline {
    pub fn new(
        config: AppConfig,
        stream: String,
        group: String,
        consumer: String,
        batch_size: usize,
        block_timeout_ms: u64,
        store: Arc<dyn StreamStore>,
        idempotency: Arc<dyn IdempotencyFilter>,
        retry: Arc<RetryController>,
        processor: Arc<dyn EmailProcessor>,
        breakers: Arc<CircuitBreakers>,
        shutdown: Arc<ShutdownService>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        let dlq = DlqManager::new(
            Arc::clone(&store),
            config.stream_store.dlq_stream_name.clone(),
            config.stream_store.dlq_stream_maxlen,
        );
        let recovery = OrphanRecovery::new(
            Arc::clone(&store),
            stream.clone(),
            group.clone(),
            config.recovery.min_idle_ms,
            config.recovery.max_claim_count,
            config.recovery.max_delivery_count,
        );
        Self {
            config,
            stream,
            group,
            consumer,
            batch_size,
            block_timeout_ms,
            store,
            idempotency,
            retry,
            dlq,
            recovery,
            processor,
            breakers,
            shutdown,
            metrics,
            processed_since_log: AtomicU64::new(0),
        }
    }

    fn stream_breaker(&self) -> Arc<CircuitBreaker> {
        let cb = &self.config.circuit_breaker;
        self.breakers.get_with_excluded(
            "stream_store",
            cb.failure_threshold,
            Duration::from_secs(cb.recovery_timeout_seconds),
            cb.success_threshold,
            Some(Arc::new(|e: &(dyn std::error::Error + 'static)| {
                e.downcast_ref::<StreamStoreError>().map(|e| !e.is_transient()).unwrap_or(false)
            })),
        )
    }

    /// Idempotent group creation plus a startup orphan sweep that routes any
    /// already-expired entry to the DLQ before steady-state begins.
    pub async fn initialize(&self) -> Result<(), StreamStoreError> {
        self.store.create_group(&self.stream, &self.group, "0").await?;
        info!(stream = %self.stream, group = %self.group, "consumer group ready");

        let sweep = self.recovery.sweep(&self.consumer).await?;
        for expired in sweep.expired {
            self.route_expired_to_dlq(&expired).await;
        }
        for claimed in sweep.claimed {
            self.handle_entry(&claimed).await;
        }
        Ok(())
    }

    fn fingerprint(message: &StreamMessage) -> String {
        message
            .fields
            .get("message_id")
            .cloned()
            .unwrap_or_else(|| message.entry_id.clone())
    }

    async fn route_expired_to_dlq(&self, entry: &PendingEntry) {
        let record = DlqRecord::new(
            entry.entry_id.clone(),
            "ExceededMaxDeliveries",
            format!("delivery_count {} >= max_delivery_count", entry.delivery_count),
            entry.delivery_count as u32,
            "{}",
        );
        match self.dlq.send_to_dlq(record).await {
            Ok(_) => {
                self.metrics.dlq_messages_total.fetch_add(1, Ordering::Relaxed);
                let _ = self.store.ack(&self.stream, &self.group, &[entry.entry_id.clone()]).await;
            }
            Err(e) => {
                error!(entry_id = %entry.entry_id, error = %e, "failed to route expired entry to DLQ, will retry next sweep");
            }
        }
    }

    /// One periodic orphan sweep: claims claimable entries back into the
    /// steady-state processing path, routes delivery-exhausted entries to the
    /// DLQ.
    async fn run_orphan_sweep(&self) {
        match self.recovery.sweep(&self.consumer).await {
            Ok(sweep) => {
                for expired in sweep.expired {
                    self.route_expired_to_dlq(&expired).await;
                }
                let claimed_count = sweep.claimed.len() as u64;
                for claimed in sweep.claimed {
                    self.handle_entry(&claimed).await;
                }
                if claimed_count > 0 {
                    self.metrics
                        .orphan_messages_claimed_total
                        .fetch_add(claimed_count, Ordering::Relaxed);
                }
            }
            Err(e) => warn!(error = %e, "orphan sweep failed, will retry next interval"),
        }
    }

    /// Per-entry filter/retry-gate/process branch, shared between the
    /// steady-state read loop and both orphan-sweep call sites.
    async fn handle_entry(&self, message: &StreamMessage) {
        let fp = Self::fingerprint(message);
        correlation::with_new_id("consumer_entry", self.handle_entry_inner(message, &fp)).await
    }

    async fn handle_entry_inner(&self, message: &StreamMessage, fp: &str) {
        match self.idempotency.is_duplicate(fp).await {
            Ok(true) => {
                debug!(entry_id = %message.entry_id, fingerprint = fp, "duplicate, acking without processing");
                self.metrics.idempotency_duplicates_total.fetch_add(1, Ordering::Relaxed);
                let _ = self.store.ack(&self.stream, &self.group, &[message.entry_id.clone()]).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(entry_id = %message.entry_id, error = %e, "idempotency check failed, leaving entry for redelivery");
                return;
            }
        }

        if !self.retry.should_retry(fp) {
            let attempts = self.retry.attempts(fp);
            let payload = message.fields.get("payload").cloned().unwrap_or_default();
            let record = DlqRecord::new(
                message.entry_id.clone(),
                "RetryLimitExceeded",
                format!("exceeded {} local retry attempts", attempts),
                attempts,
                payload,
            );
            match self.dlq.send_to_dlq(record).await {
                Ok(_) => {
                    self.metrics.dlq_messages_total.fetch_add(1, Ordering::Relaxed);
                    let _ = self.idempotency.mark_processed(fp).await;
                    let _ = self.store.ack(&self.stream, &self.group, &[message.entry_id.clone()]).await;
                }
                Err(e) => {
                    error!(entry_id = %message.entry_id, error = %e, "DLQ append failed for retry-exhausted entry, not acking");
                }
            }
            return;
        }

        let record = match message.fields.get("payload") {
            Some(p) => p,
            None => {
                warn!(entry_id = %message.entry_id, "entry missing payload field, dropping");
                let _ = self.store.ack(&self.stream, &self.group, &[message.entry_id.clone()]).await;
                return;
            }
        };
        let email = match crate::domain::email::EmailRecord::from_json(record) {
            Ok(e) => e,
            Err(e) => {
                error!(entry_id = %message.entry_id, error = %e, "payload decode failed, dropping");
                let _ = self.store.ack(&self.stream, &self.group, &[message.entry_id.clone()]).await;
                return;
            }
        };

        let started = Instant::now();
        match self.processor.process(&email).await {
            Ok(()) => {
                self.metrics
                    .processing_latency_seconds
                    .observe(started.elapsed().as_secs_f64());
                let _ = self.idempotency.mark_processed(fp).await;
                self.retry.record_success(fp);
                self.metrics.emails_processed_total.fetch_add(1, Ordering::Relaxed);
                let _ = self.store.ack(&self.stream, &self.group, &[message.entry_id.clone()]).await;

                let count = self.processed_since_log.fetch_add(1, Ordering::Relaxed) + 1;
                if count % crate::core::constants::STATS_LOG_INTERVAL == 0 {
                    info!(processed = count, "cumulative processing stats");
                }
            }
            Err(e) => {
                let attempts = self.retry.record_failure(fp);
                self.metrics.backoff_retries_total.fetch_add(1, Ordering::Relaxed);
                self.metrics.emails_failed_total.fetch_add(1, Ordering::Relaxed);
                warn!(entry_id = %message.entry_id, attempts, error = %e, "processing failed, leaving entry in PEL");
            }
        }
    }

    /// Steady-state loop. Exits once the shutdown service stops running.
    pub async fn run(&self) {
        info!(stream = %self.stream, group = %self.group, consumer = %self.consumer, "worker starting");
        let mut next_sweep = Instant::now() + Duration::from_secs(self.config.recovery.check_interval_seconds);

        while self.shutdown.is_running() {
            let breaker = self.stream_breaker();
            if !breaker.allow_request() {
                let wait = breaker.retry_after().max(Duration::from_millis(100));
                tokio::time::sleep(wait).await;
                continue;
            }

            if Instant::now() >= next_sweep {
                self.run_orphan_sweep().await;
                next_sweep = Instant::now() + Duration::from_secs(self.config.recovery.check_interval_seconds);
            }

            let read = self
                .store
                .group_read(&self.stream, &self.group, &self.consumer, self.batch_size, self.block_timeout_ms)
                .await;

            let messages = match read {
                Ok(m) => {
                    if !m.is_empty() {
                        breaker.record_success();
                    }
                    m
                }
                Err(e) => {
                    breaker.record_failure(Some(&e));
                    warn!(error = %e, "group read failed");
                    continue;
                }
            };

            if messages.is_empty() {
                continue;
            }

            for message in &messages {
                if !self.shutdown.is_running() {
                    break;
                }
                self.handle_entry(message).await;
            }
        }

        info!("worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;
    use crate::data::stream::mock::MockStreamStore;
    use crate::domain::idempotency::MockIdempotencyFilter;
    use crate::worker::processor::NoopProcessor;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingProcessor {
        calls: Arc<AtomicUsize>,
        fail_times: AtomicUsize,
    }

    #[async_trait]
    impl EmailProcessor for CountingProcessor {
        async fn process(&self, _record: &crate::domain::email::EmailRecord) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("processing error");
            }
            Ok(())
        }
    }

    fn sample_payload(message_id: &str, uid: u64) -> String {
        let record = crate::domain::email::EmailRecord {
            uid,
            uidvalidity: 1,
            mailbox: "INBOX".into(),
            from: "a@example.com".into(),
            to: vec!["b@example.com".into()],
            subject: "hi".into(),
            date: chrono::Utc::now(),
            message_id: Some(message_id.to_string()),
            size: 10,
            headers: Default::default(),
            body_text_preview: "hi".into(),
            body_html_preview: "<p>hi</p>".into(),
            fetched_at: chrono::Utc::now(),
        };
        record.to_json().unwrap()
    }

    fn build(
        processor: Arc<dyn EmailProcessor>,
        store: Arc<dyn StreamStore>,
    ) -> ConsumerPipeline {
        let config = AppConfig::default();
        ConsumerPipeline::new(
            config,
            "main".into(),
            "workers".into(),
            "c1".into(),
            10,
            10,
            Arc::clone(&store),
            Arc::new(MockIdempotencyFilter::new()),
            Arc::new(RetryController::new(Duration::from_millis(1), Duration::from_millis(5), 2.0, 3)),
            processor,
            CircuitBreakers::new(),
            ShutdownService::new(Duration::from_secs(5)),
            AppMetrics::new(),
        )
    }

    #[tokio::test]
    async fn happy_path_processes_each_entry_once_and_acks() {
        let store: Arc<dyn StreamStore> = Arc::new(MockStreamStore::new());
        for (mid, uid) in [("<a>", 101u64), ("<b>", 102), ("<c>", 103)] {
            store
                .append("main", &[("payload".into(), sample_payload(mid, uid))], None)
                .await
                .unwrap();
        }
        let pipeline = build(Arc::new(NoopProcessor), Arc::clone(&store));
        pipeline.initialize().await.unwrap();

        let batch = store.group_read("main", "workers", "c1", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 3);
        for message in &batch {
            pipeline.handle_entry(message).await;
        }

        assert_eq!(pipeline.metrics.emails_processed_total.load(Ordering::Relaxed), 3);
        assert_eq!(pipeline.metrics.emails_failed_total.load(Ordering::Relaxed), 0);
        assert_eq!(pipeline.dlq.len().await.unwrap(), 0);

        let pending = store.pending_range("main", "workers", 10).await.unwrap();
        assert!(pending.is_empty(), "all three entries should have been acked");
    }

    #[tokio::test]
    async fn duplicate_entry_is_acked_without_invoking_processor() {
        let store: Arc<dyn StreamStore> = Arc::new(MockStreamStore::new());
        store.create_group("main", "workers", "0").await.unwrap();
        let payload = sample_payload("<dup>", 201);
        store.append("main", &[("payload".into(), payload.clone())], None).await.unwrap();
        store.append("main", &[("payload".into(), payload)], None).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor {
            calls: Arc::clone(&calls),
            fail_times: AtomicUsize::new(0),
        });
        let pipeline = build(processor, Arc::clone(&store));

        let batch = store.group_read("main", "workers", "c1", 10, 0).await.unwrap();
        for m in &batch {
            pipeline.handle_entry(m).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.metrics.idempotency_duplicates_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn retry_then_success_acks_only_after_third_attempt() {
        let store: Arc<dyn StreamStore> = Arc::new(MockStreamStore::new());
        store.create_group("main", "workers", "0").await.unwrap();
        store
            .append("main", &[("payload".into(), sample_payload("<retry>", 301))], None)
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor {
            calls: Arc::clone(&calls),
            fail_times: AtomicUsize::new(2),
        });
        let pipeline = build(processor, Arc::clone(&store));

        let batch = store.group_read("main", "workers", "c1", 10, 0).await.unwrap();
        let message = batch[0].clone();

        // Three delivery attempts of the same PEL entry (as an orphan sweep
        // would feed it back in), the last one succeeding.
        for _ in 0..3 {
            pipeline.handle_entry(&message).await;
            tokio::time::sleep(Duration::from_millis(6)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pipeline.metrics.emails_processed_total.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.metrics.emails_failed_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn poison_message_is_routed_to_dlq_once_retries_are_exhausted() {
        let store: Arc<dyn StreamStore> = Arc::new(MockStreamStore::new());
        store.create_group("main", "workers", "0").await.unwrap();
        store
            .append("main", &[("payload".into(), sample_payload("<poison>", 401))], None)
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor {
            calls: Arc::clone(&calls),
            fail_times: AtomicUsize::new(99),
        });
        let pipeline = build(processor, Arc::clone(&store));

        let batch = store.group_read("main", "workers", "c1", 10, 0).await.unwrap();
        let message = batch[0].clone();
        // exhaust local retries (max_attempts=3)
        for _ in 0..3 {
            pipeline.handle_entry(&message).await;
            tokio::time::sleep(Duration::from_millis(6)).await;
        }
        // next attempt should hit the retry gate and go to DLQ
        pipeline.handle_entry(&message).await;

        assert_eq!(pipeline.dlq.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn crash_recovery_orphan_sweep_claims_and_processes_entry() {
        let store = Arc::new(MockStreamStore::new());
        let store_dyn: Arc<dyn StreamStore> = Arc::clone(&store) as Arc<dyn StreamStore>;
        store_dyn.create_group("main", "workers", "0").await.unwrap();
        store_dyn
            .append("main", &[("payload".into(), sample_payload("<d>", 1))], None)
            .await
            .unwrap();
        store_dyn
            .append("main", &[("payload".into(), sample_payload("<e>", 2))], None)
            .await
            .unwrap();

        let delivered = store_dyn.group_read("main", "workers", "old-consumer", 10, 0).await.unwrap();
        assert_eq!(delivered.len(), 2);
        // process and ack D, crash before E
        store_dyn.ack("main", "workers", &[delivered[0].entry_id.clone()]).await.unwrap();

        store.age_pel_entries("main", "workers", Duration::from_millis(300_000));

        let calls = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor {
            calls: Arc::clone(&calls),
            fail_times: AtomicUsize::new(0),
        });
        let pipeline = build(processor, store_dyn);
        pipeline.run_orphan_sweep().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.metrics.orphan_messages_claimed_total.load(Ordering::Relaxed), 1);
    }
}
