//! Producer pipeline (C8): poll loop — connect, select mailbox, fetch
//! incremental UIDs, parse, batch-append, commit state. Mirrors the original
//! `EmailProducer.fetch_and_push_emails`/`run` step by step.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::api::metrics::AppMetrics;
use crate::core::config::{AppConfig, Provider};
use crate::core::correlation;
use crate::core::shutdown::ShutdownService;
use crate::data::error::{ImapError, StreamStoreError};
use crate::data::state::MailboxStateStore;
use crate::data::stream::StreamStore;
use crate::domain::batch::BatchAppender;
use crate::domain::breaker::{CircuitBreaker, CircuitBreakers};

use super::imap_client::ImapClient;
use super::oauth::OAuth2Manager;

async fn run_blocking<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .expect("blocking IMAP task panicked")
}

pub struct ProducerPipeline {
    config: AppConfig,
    account: String,
    provider: Provider,
    store: Arc<dyn StreamStore>,
    state_store: Arc<dyn MailboxStateStore>,
    oauth: Arc<OAuth2Manager>,
    breakers: Arc<CircuitBreakers>,
    shutdown: Arc<ShutdownService>,
    metrics: Arc<AppMetrics>,
    imap_client: Option<ImapClient>,
    total_processed: u64,
}

impl ProducerPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        account: String,
        provider: Provider,
        store: Arc<dyn StreamStore>,
        state_store: Arc<dyn MailboxStateStore>,
        oauth: Arc<OAuth2Manager>,
        breakers: Arc<CircuitBreakers>,
        shutdown: Arc<ShutdownService>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            config,
            account,
            provider,
            store,
            state_store,
            oauth,
            breakers,
            shutdown,
            metrics,
            imap_client: None,
            total_processed: 0,
        }
    }

    fn imap_breaker(&self) -> Arc<CircuitBreaker> {
        let cb = &self.config.circuit_breaker;
        self.breakers.get_with_excluded(
            "imap",
            cb.failure_threshold,
            Duration::from_secs(cb.recovery_timeout_seconds),
            cb.success_threshold,
            Some(Arc::new(|e: &(dyn std::error::Error + 'static)| {
                e.downcast_ref::<ImapError>().map(|e| !e.is_transient()).unwrap_or(false)
            })),
        )
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

    async fn ensure_connected(&mut self) -> anyhow::Result<()> {
        if self.imap_client.as_ref().map(|c| c.is_connected()).unwrap_or(false) {
            return Ok(());
        }
        let breaker = self.imap_breaker();
        if !breaker.allow_request() {
            anyhow::bail!("imap circuit breaker open, retry after {:?}", breaker.retry_after());
        }

        let token = self.oauth.authenticate(false).await?;
        let host = self
            .config
            .imap
            .host
            .clone()
            .unwrap_or_else(|| self.provider.imap_host().to_string());
        let mut client = ImapClient::new(host, self.config.imap.port, self.account.clone());

        let access_token = token.access_token;
        let connect_result = run_blocking(move || {
            let r = client.connect(&access_token);
            (client, r)
        })
        .await;
        let (client, result) = connect_result;
        self.imap_client = Some(client);

        match result {
            Ok(()) => {
                breaker.record_success();
                Ok(())
            }
            Err(e) => {
                breaker.record_failure(Some(&e));
                self.imap_client = None;
                Err(e.into())
            }
        }
    }

    /// One full poll cycle. Returns the number of emails successfully
    /// appended.
    pub async fn poll_cycle(&mut self, mailbox: &str, batch_size: usize) -> anyhow::Result<usize> {
        let poll_started = std::time::Instant::now();
        self.metrics.imap_polls_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.ensure_connected().await?;
        let mut client = self.imap_client.take().expect("connected above");

        let mailbox_owned = mailbox.to_string();
        let (client, select_result) = run_blocking(move || {
            let r = client.select_mailbox(&mailbox_owned);
            (client, r)
        })
        .await;
        self.imap_client = Some(client);

        let (uidvalidity, message_count) = match select_result {
            Ok(v) => {
                self.imap_breaker().record_success();
                v
            }
            Err(e) => {
                self.imap_breaker().record_failure(Some(&e));
                self.imap_client.as_mut().unwrap().disconnect();
                self.imap_client = None;
                self.metrics.imap_poll_duration_seconds.observe(poll_started.elapsed().as_secs_f64());
                return Err(e.into());
            }
        };

        if self
            .state_store
            .check_uidvalidity_changed(&self.account, mailbox, uidvalidity)
            .await?
        {
            warn!(mailbox, "UIDVALIDITY changed, resetting mailbox state");
            self.state_store.reset_mailbox(&self.account, mailbox).await?;
        }

        let last_uid = self.state_store.last_uid(&self.account, mailbox).await?;
        debug!(mailbox, uidvalidity, last_uid, message_count, "select complete");

        let mut client = self.imap_client.take().expect("connected above");
        let (client, uids_result) = run_blocking(move || {
            let r = client.fetch_uids_since(last_uid, batch_size);
            (client, r)
        })
        .await;
        self.imap_client = Some(client);
        let new_uids = uids_result?;

        if new_uids.is_empty() {
            debug!(mailbox, "no new emails found");
            let _ = self.state_store.update_last_poll_time(&self.account, mailbox).await;
            self.metrics.imap_poll_duration_seconds.observe(poll_started.elapsed().as_secs_f64());
            return Ok(0);
        }

        info!(mailbox, count = new_uids.len(), "fetching new emails");
        let mailbox_owned = mailbox.to_string();
        let mut client = self.imap_client.take().expect("connected above");
        let (client, messages_result) = run_blocking(move || {
            let r = client.fetch_messages(&new_uids, &mailbox_owned, uidvalidity);
            (client, r)
        })
        .await;
        self.imap_client = Some(client);
        let messages = messages_result?;

        let stream_cfg = &self.config.stream_store;
        let mut appender = BatchAppender::new(
            Arc::clone(&self.store),
            stream_cfg.main_stream_name.clone(),
            messages.len().max(1),
            Some(stream_cfg.main_stream_maxlen),
        );

        let mut pushed = 0usize;
        let mut last_pushed_uid = last_uid;
        for message in &messages {
            let payload = match message.to_json() {
                Ok(p) => p,
                Err(e) => {
                    error!(uid = message.uid, error = %e, "failed to serialize email, skipping (will retry next poll)");
                    break;
                }
            };
            match appender.add(vec![("payload".to_string(), payload)]).await {
                Ok(_) => {
                    self.stream_breaker().record_success();
                    self.metrics.emails_produced_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    pushed += 1;
                    last_pushed_uid = message.uid;
                }
                Err(e) => {
                    self.stream_breaker().record_failure(Some(&e));
                    error!(uid = message.uid, error = %e, "failed to push email, stopping batch");
                    break;
                }
            }
        }
        appender.flush().await?;

        if pushed > 0 {
            match self
                .state_store
                .commit_atomic(&self.account, mailbox, uidvalidity, last_pushed_uid)
                .await
            {
                Ok(()) => {
                    self.state_store
                        .increment_email_count(&self.account, mailbox, pushed as u64)
                        .await?;
                    info!(pushed, total = messages.len(), last_pushed_uid, "poll cycle committed");
                }
                Err(e) => {
                    warn!(error = %e, "state commit mismatch, aborting batch (next poll resets)");
                }
            }
        }

        let _ = self.state_store.update_last_poll_time(&self.account, mailbox).await;
        self.total_processed += pushed as u64;
        self.metrics.imap_poll_duration_seconds.observe(poll_started.elapsed().as_secs_f64());
        Ok(pushed)
    }

    /// Main loop. Exits once the shutdown service stops running.
    pub async fn run(&mut self, mailbox: String, batch_size: usize, poll_interval: Duration, dry_run: bool) {
        info!(mailbox, poll_interval_secs = poll_interval.as_secs(), dry_run, "producer starting");
        let mut poll_count = 0u64;

        while self.shutdown.is_running() {
            poll_count += 1;
            let mailbox_ref = mailbox.clone();
            let result = correlation::with_new_id("producer_poll_cycle", async {
                if dry_run {
                    info!("dry run: would fetch and push emails");
                    Ok(0)
                } else {
                    self.poll_cycle(&mailbox_ref, batch_size).await
                }
            })
            .await;

            match result {
                Ok(count) if count > 0 => info!(poll_count, count, total = self.total_processed, "processed emails"),
                Ok(_) => {}
                Err(e) => error!(poll_count, error = %e, "poll cycle failed, will retry next interval"),
            }

            let mut waited = Duration::ZERO;
            while waited < poll_interval && self.shutdown.is_running() {
                let step = Duration::from_secs(1).min(poll_interval - waited);
                tokio::time::sleep(step).await;
                waited += step;
            }
        }

        if let Some(client) = self.imap_client.as_mut() {
            client.disconnect();
        }
        info!(total = self.total_processed, "producer stopped");
    }
}
