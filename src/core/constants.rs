//! Default values mirrored from the original deployment's settings module.

pub const DEFAULT_MAIN_STREAM_NAME: &str = "email_ingestion_stream";
pub const DEFAULT_MAIN_STREAM_MAXLEN: u64 = 10_000;
pub const DEFAULT_DLQ_STREAM_NAME: &str = "email_ingestion_dlq";
pub const DEFAULT_DLQ_STREAM_MAXLEN: u64 = 10_000;

pub const DEFAULT_IMAP_PORT: u16 = 993;
pub const DEFAULT_MAILBOX: &str = "INBOX";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_BATCH_SIZE: usize = 50;

pub const DEFAULT_CONSUMER_GROUP: &str = "email_workers";
pub const DEFAULT_WORKER_BATCH_SIZE: usize = 10;
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 86_400;
pub const DEFAULT_IDEMPOTENCY_KEY: &str = "processed_messages:set";

pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF_SECS: u64 = 2;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 3600;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

pub const DEFAULT_MIN_IDLE_MS: u64 = 300_000;
pub const DEFAULT_MAX_CLAIM_COUNT: usize = 50;
pub const DEFAULT_MAX_DELIVERY_COUNT: u64 = 10;
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;

pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_METRICS_PORT: u16 = 9090;

pub const BODY_TEXT_PREVIEW_LIMIT: usize = 2_000;
pub const BODY_HTML_PREVIEW_LIMIT: usize = 500;
pub const IMAP_BODY_FETCH_BYTES: usize = 5_120;

pub const STATS_LOG_INTERVAL: u64 = 100;

pub const ENV_REDIS_URL: &str = "MAILBRIDGE_REDIS_URL";
pub const ENV_CONFIG_FILE: &str = "MAILBRIDGE_CONFIG_FILE";
pub const ENV_IMAP_USER: &str = "MAILBRIDGE_IMAP_USER";
pub const ENV_OAUTH_CLIENT_ID: &str = "MAILBRIDGE_OAUTH_CLIENT_ID";
pub const ENV_OAUTH_CLIENT_SECRET: &str = "MAILBRIDGE_OAUTH_CLIENT_SECRET";
pub const ENV_TOKEN_FILE: &str = "MAILBRIDGE_TOKEN_FILE";
pub const ENV_LOG_JSON: &str = "MAILBRIDGE_LOG_JSON";

pub const DEFAULT_TOKEN_FILE: &str = ".mailbridge/token.json";
pub const DEFAULT_OAUTH_REDIRECT_URI: &str = "http://localhost:8080";
pub const OAUTH_CALLBACK_TIMEOUT_SECS: u64 = 120;
