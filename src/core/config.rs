use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::constants::*;

/// Mail provider selection; drives the OAuth2 endpoint and IMAP host defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Gmail,
    Outlook,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Gmail => write!(f, "gmail"),
            Provider::Outlook => write!(f, "outlook"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gmail" => Ok(Provider::Gmail),
            "outlook" => Ok(Provider::Outlook),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

impl Provider {
    pub fn imap_host(&self) -> &'static str {
        match self {
            Provider::Gmail => "imap.gmail.com",
            Provider::Outlook => "outlook.office365.com",
        }
    }

    pub fn oauth_token_uri(&self) -> &'static str {
        match self {
            Provider::Gmail => "https://oauth2.googleapis.com/token",
            Provider::Outlook => "https://login.microsoftonline.com/common/oauth2/v2.0/token",
        }
    }

    pub fn oauth_auth_uri(&self) -> &'static str {
        match self {
            Provider::Gmail => "https://accounts.google.com/o/oauth2/v2/auth",
            Provider::Outlook => "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
        }
    }

    /// Scope(s) required for IMAP access, space-joined as the `scope`
    /// authorization parameter expects.
    pub fn oauth_scope(&self) -> &'static str {
        match self {
            Provider::Gmail => "https://mail.google.com/",
            Provider::Outlook => "https://outlook.office365.com/IMAP.AccessAsUser.All offline_access",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStoreConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u8,
    pub main_stream_name: String,
    pub main_stream_maxlen: u64,
    pub dlq_stream_name: String,
    pub dlq_stream_maxlen: u64,
}

impl Default for StreamStoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            password: None,
            db: 0,
            main_stream_name: DEFAULT_MAIN_STREAM_NAME.into(),
            main_stream_maxlen: DEFAULT_MAIN_STREAM_MAXLEN,
            dlq_stream_name: DEFAULT_DLQ_STREAM_NAME.into(),
            dlq_stream_maxlen: DEFAULT_DLQ_STREAM_MAXLEN,
        }
    }
}

impl StreamStoreConfig {
    /// Connection URL in the `redis://[:password@]host:port/db` shape consumed by deadpool-redis.
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: Option<String>,
    pub port: u16,
    pub mailbox: String,
    pub poll_interval_seconds: u64,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_IMAP_PORT,
            mailbox: DEFAULT_MAILBOX.into(),
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub consumer_group: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub block_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_group: DEFAULT_CONSUMER_GROUP.into(),
            consumer_name: format!("consumer-{}", uuid::Uuid::new_v4()),
            batch_size: DEFAULT_WORKER_BATCH_SIZE,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Zero disables TTL.
    pub ttl_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_IDEMPOTENCY_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retry_attempts: u32,
    pub initial_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            initial_backoff_seconds: DEFAULT_INITIAL_BACKOFF_SECS,
            max_backoff_seconds: DEFAULT_MAX_BACKOFF_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub min_idle_ms: u64,
    pub max_claim_count: usize,
    pub max_delivery_count: u64,
    pub check_interval_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            min_idle_ms: DEFAULT_MIN_IDLE_MS,
            max_claim_count: DEFAULT_MAX_CLAIM_COUNT,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout_seconds: DEFAULT_RECOVERY_TIMEOUT_SECS,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthConfig {
    pub health_port: u16,
    pub metrics_port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            health_port: DEFAULT_HEALTH_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { json: false }
    }
}

/// Aggregate, fully-resolved configuration threaded through both binaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub stream_store: StreamStoreConfig,
    pub imap: ImapConfig,
    pub worker: WorkerConfig,
    pub idempotency: IdempotencyConfig,
    pub retry: RetryConfig,
    pub recovery: RecoveryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

/// Mirrors `AppConfig` but every field optional, for the on-disk TOML layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub stream_store: Option<FileStreamStoreConfig>,
    pub imap: Option<FileImapConfig>,
    pub worker: Option<FileWorkerConfig>,
    pub idempotency: Option<IdempotencyConfig>,
    pub retry: Option<RetryConfig>,
    pub recovery: Option<RecoveryConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub health: Option<HealthConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileStreamStoreConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub db: Option<u8>,
    pub main_stream_name: Option<String>,
    pub main_stream_maxlen: Option<u64>,
    pub dlq_stream_name: Option<String>,
    pub dlq_stream_maxlen: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileImapConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub mailbox: Option<String>,
    pub poll_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileWorkerConfig {
    pub consumer_group: Option<String>,
    pub consumer_name: Option<String>,
    pub batch_size: Option<usize>,
    pub block_timeout_ms: Option<u64>,
}

impl AppConfig {
    /// Layers defaults < file < env in that order. CLI overrides are applied
    /// by the caller afterwards (see `core::cli`), matching the teacher's
    /// `AppConfig::load` merge order.
    pub fn load(config_file: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = AppConfig::default();

        if let Some(path) = config_file {
            if path.exists() {
                let raw = std::fs::read_to_string(path)?;
                let file_cfg: FileConfig = toml::from_str(&raw)?;
                cfg.merge_file(file_cfg);
            }
        }

        cfg.merge_env();
        Ok(cfg)
    }

    fn merge_file(&mut self, file: FileConfig) {
        if let Some(s) = file.stream_store {
            if let Some(v) = s.host {
                self.stream_store.host = v;
            }
            if let Some(v) = s.port {
                self.stream_store.port = v;
            }
            if s.password.is_some() {
                self.stream_store.password = s.password;
            }
            if let Some(v) = s.db {
                self.stream_store.db = v;
            }
            if let Some(v) = s.main_stream_name {
                self.stream_store.main_stream_name = v;
            }
            if let Some(v) = s.main_stream_maxlen {
                self.stream_store.main_stream_maxlen = v;
            }
            if let Some(v) = s.dlq_stream_name {
                self.stream_store.dlq_stream_name = v;
            }
            if let Some(v) = s.dlq_stream_maxlen {
                self.stream_store.dlq_stream_maxlen = v;
            }
        }
        if let Some(i) = file.imap {
            if i.host.is_some() {
                self.imap.host = i.host;
            }
            if let Some(v) = i.port {
                self.imap.port = v;
            }
            if let Some(v) = i.mailbox {
                self.imap.mailbox = v;
            }
            if let Some(v) = i.poll_interval_seconds {
                self.imap.poll_interval_seconds = v;
            }
        }
        if let Some(w) = file.worker {
            if let Some(v) = w.consumer_group {
                self.worker.consumer_group = v;
            }
            if let Some(v) = w.consumer_name {
                self.worker.consumer_name = v;
            }
            if let Some(v) = w.batch_size {
                self.worker.batch_size = v;
            }
            if let Some(v) = w.block_timeout_ms {
                self.worker.block_timeout_ms = v;
            }
        }
        if let Some(v) = file.idempotency {
            self.idempotency = v;
        }
        if let Some(v) = file.retry {
            self.retry = v;
        }
        if let Some(v) = file.recovery {
            self.recovery = v;
        }
        if let Some(v) = file.circuit_breaker {
            self.circuit_breaker = v;
        }
        if let Some(v) = file.health {
            self.health = v;
        }
        if let Some(v) = file.logging {
            self.logging = v;
        }
    }

    fn merge_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_REDIS_URL) {
            if let Some((host_port_db, password)) = split_redis_url(&url) {
                self.stream_store.password = password;
                let _ = host_port_db;
            }
        }
        if let Ok(v) = std::env::var(ENV_LOG_JSON) {
            self.logging.json = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }
}

/// Best-effort parse of a `redis://[:password@]host:port[/db]` URL, returning
/// the password component. Host/port/db parsing is left to deadpool-redis at
/// connection time; this only extracts what config merging needs.
fn split_redis_url(url: &str) -> Option<(String, Option<String>)> {
    let rest = url.strip_prefix("redis://")?;
    if let Some(at_idx) = rest.find('@') {
        let userinfo = &rest[..at_idx];
        let password = userinfo.strip_prefix(':').unwrap_or(userinfo);
        Some((rest[at_idx + 1..].to_string(), Some(password.to_string())))
    } else {
        Some((rest.to_string(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!("Gmail".parse::<Provider>().unwrap(), Provider::Gmail);
        assert_eq!("OUTLOOK".parse::<Provider>().unwrap(), Provider::Outlook);
        assert!("yahoo".parse::<Provider>().is_err());
    }

    #[test]
    fn default_config_matches_original_deployment_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.stream_store.main_stream_maxlen, 10_000);
        assert_eq!(cfg.worker.batch_size, 10);
        assert_eq!(cfg.retry.max_retry_attempts, 3);
        assert_eq!(cfg.recovery.min_idle_ms, 300_000);
    }

    #[test]
    fn redis_url_with_password_masks_nothing_but_includes_it() {
        let mut cfg = StreamStoreConfig::default();
        cfg.password = Some("s3cret".into());
        assert_eq!(cfg.redis_url(), "redis://:s3cret@127.0.0.1:6379/0");
    }

    #[test]
    fn split_redis_url_extracts_password() {
        let (_, password) = split_redis_url("redis://:hunter2@localhost:6379/0").unwrap();
        assert_eq!(password.as_deref(), Some("hunter2"));
    }
}
