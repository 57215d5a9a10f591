use thiserror::Error;

/// Errors from the stream store adapter (C1) and anything else sharing its
/// Redis pool (idempotency filter, producer state machine). Shaped after the
/// teacher's `DataError`: named variants, `From` bridges for the underlying
/// client's error types, and an `is_transient` predicate the circuit breaker
/// consults to decide whether a failure counts against it.
#[derive(Debug, Error)]
pub enum StreamStoreError {
    #[error("stream store configuration error: {0}")]
    Config(String),

    #[error("stream store connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("stream store command error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("stream store operation timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("malformed stream store arguments: {0}")]
    InvalidArgs(String),

    #[error("stream store entry could not be decoded: {0}")]
    Decode(String),
}

impl StreamStoreError {
    /// Network hiccups and pool exhaustion are transient (retry, count
    /// against the breaker); malformed arguments and decode failures are
    /// not — they will never succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StreamStoreError::Pool(_) => true,
            StreamStoreError::Timeout { .. } => true,
            StreamStoreError::Redis(e) => e.is_connection_dropped() || e.is_timeout() || e.is_io_error(),
            StreamStoreError::Config(_)
            | StreamStoreError::InvalidArgs(_)
            | StreamStoreError::Decode(_) => false,
        }
    }
}

/// Errors from the producer state machine (C6).
#[derive(Debug, Error)]
pub enum StateError {
    #[error("UIDVALIDITY changed for {mailbox} during commit: stored={stored}, current={current}")]
    UidValidityMismatch {
        mailbox: String,
        stored: u64,
        current: u64,
    },

    #[error(transparent)]
    Store(#[from] StreamStoreError),
}

/// Errors surfaced by the IMAP adapter (out of scope for wire-level detail,
/// but the core needs a closed error shape to decide reconnect vs. abort).
#[derive(Debug, Error)]
pub enum ImapError {
    #[error("IMAP connection failed: {0}")]
    Connection(String),

    #[error("IMAP authentication failed: {0}")]
    Auth(String),

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IMAP message parse error: {0}")]
    Parse(String),
}

impl ImapError {
    /// Connection/protocol faults are worth a reconnect-and-retry next
    /// cycle; auth and parse faults are not recoverable without operator
    /// intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, ImapError::Connection(_) | ImapError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_and_timeout_errors_are_transient() {
        assert!(StreamStoreError::Timeout { attempts: 3 }.is_transient());
        assert!(!StreamStoreError::Config("bad".into()).is_transient());
        assert!(!StreamStoreError::InvalidArgs("bad".into()).is_transient());
    }

    #[test]
    fn imap_connection_faults_are_transient_auth_is_not() {
        assert!(ImapError::Connection("reset".into()).is_transient());
        assert!(!ImapError::Auth("token expired".into()).is_transient());
    }
}
