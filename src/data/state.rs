//! Producer state machine (C6): UIDVALIDITY guard plus a monotonic UID
//! watermark per mailbox, atomically committed in the order
//! `last_uid -> uidvalidity -> last_poll`. Grounded on the original
//! `ProducerStateManager`'s exact key scheme and commit ordering.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::Serialize;

use super::error::StateError;

#[derive(Debug, Clone, Serialize)]
pub struct MailboxStateSummary {
    pub last_uid: u64,
    pub uidvalidity: Option<u64>,
    pub last_poll: Option<DateTime<Utc>>,
    pub total_emails: u64,
}

#[async_trait]
pub trait MailboxStateStore: Send + Sync {
    async fn last_uid(&self, account: &str, mailbox: &str) -> Result<u64, StateError>;

    async fn stored_uidvalidity(&self, account: &str, mailbox: &str) -> Result<Option<u64>, StateError>;

    /// If no UIDVALIDITY has been stored yet, persists `current` and returns
    /// `false`. Otherwise returns whether `current` differs from the stored
    /// value, without mutating anything.
    async fn check_uidvalidity_changed(
        &self,
        account: &str,
        mailbox: &str,
        current: u64,
    ) -> Result<bool, StateError>;

    /// Sets `last_uid` back to 0. UIDVALIDITY is left for the next commit to
    /// rewrite.
    async fn reset_mailbox(&self, account: &str, mailbox: &str) -> Result<(), StateError>;

    /// Precondition: `check_uidvalidity_changed(account, mailbox, uidvalidity)`
    /// must be `false` at call time, else fails with `UidValidityMismatch`
    /// and leaves all state untouched. On success, updates `last_uid`, then
    /// `uidvalidity`, then `last_poll`, in that order.
    async fn commit_atomic(
        &self,
        account: &str,
        mailbox: &str,
        uidvalidity: u64,
        new_last_uid: u64,
    ) -> Result<(), StateError>;

    async fn increment_email_count(&self, account: &str, mailbox: &str, n: u64) -> Result<(), StateError>;

    /// Best-effort: failure here must not fail the caller's poll cycle.
    async fn update_last_poll_time(&self, account: &str, mailbox: &str) -> Result<(), StateError>;

    async fn state_summary(&self, account: &str, mailbox: &str) -> Result<MailboxStateSummary, StateError>;
}

fn key(account: &str, mailbox: &str, field: &str) -> String {
    format!("producer_state:{account}:{mailbox}:{field}")
}

pub struct RedisMailboxStateStore {
    pool: Pool,
}

impl RedisMailboxStateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MailboxStateStore for RedisMailboxStateStore {
    async fn last_uid(&self, account: &str, mailbox: &str) -> Result<u64, StateError> {
        let mut conn = self.pool.get().await.map_err(super::error::StreamStoreError::from)?;
        let raw: Option<String> = cmd("GET")
            .arg(key(account, mailbox, "last_uid"))
            .query_async(&mut conn)
            .await
            .map_err(super::error::StreamStoreError::from)?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn stored_uidvalidity(&self, account: &str, mailbox: &str) -> Result<Option<u64>, StateError> {
        let mut conn = self.pool.get().await.map_err(super::error::StreamStoreError::from)?;
        let raw: Option<String> = cmd("GET")
            .arg(key(account, mailbox, "uidvalidity"))
            .query_async(&mut conn)
            .await
            .map_err(super::error::StreamStoreError::from)?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    async fn check_uidvalidity_changed(
        &self,
        account: &str,
        mailbox: &str,
        current: u64,
    ) -> Result<bool, StateError> {
        match self.stored_uidvalidity(account, mailbox).await? {
            None => {
                let mut conn = self.pool.get().await.map_err(super::error::StreamStoreError::from)?;
                let _: () = cmd("SET")
                    .arg(key(account, mailbox, "uidvalidity"))
                    .arg(current.to_string())
                    .query_async(&mut conn)
                    .await
                    .map_err(super::error::StreamStoreError::from)?;
                Ok(false)
            }
            Some(stored) => Ok(stored != current),
        }
    }

    async fn reset_mailbox(&self, account: &str, mailbox: &str) -> Result<(), StateError> {
        let mut conn = self.pool.get().await.map_err(super::error::StreamStoreError::from)?;
        let _: () = cmd("SET")
            .arg(key(account, mailbox, "last_uid"))
            .arg("0")
            .query_async(&mut conn)
            .await
            .map_err(super::error::StreamStoreError::from)?;
        Ok(())
    }

    async fn commit_atomic(
        &self,
        account: &str,
        mailbox: &str,
        uidvalidity: u64,
        new_last_uid: u64,
    ) -> Result<(), StateError> {
        if self.check_uidvalidity_changed(account, mailbox, uidvalidity).await? {
            let stored = self.stored_uidvalidity(account, mailbox).await?.unwrap_or(0);
            return Err(StateError::UidValidityMismatch {
                mailbox: mailbox.to_string(),
                stored,
                current: uidvalidity,
            });
        }
        let mut conn = self.pool.get().await.map_err(super::error::StreamStoreError::from)?;
        let _: () = cmd("SET")
            .arg(key(account, mailbox, "last_uid"))
            .arg(new_last_uid.to_string())
            .query_async(&mut conn)
            .await
            .map_err(super::error::StreamStoreError::from)?;
        let _: () = cmd("SET")
            .arg(key(account, mailbox, "uidvalidity"))
            .arg(uidvalidity.to_string())
            .query_async(&mut conn)
            .await
            .map_err(super::error::StreamStoreError::from)?;
        self.update_last_poll_time(account, mailbox).await?;
        Ok(())
    }

    async fn increment_email_count(&self, account: &str, mailbox: &str, n: u64) -> Result<(), StateError> {
        let mut conn = self.pool.get().await.map_err(super::error::StreamStoreError::from)?;
        let _: i64 = cmd("INCRBY")
            .arg(key(account, mailbox, "total_emails"))
            .arg(n)
            .query_async(&mut conn)
            .await
            .map_err(super::error::StreamStoreError::from)?;
        Ok(())
    }

    async fn update_last_poll_time(&self, account: &str, mailbox: &str) -> Result<(), StateError> {
        let mut conn = self.pool.get().await.map_err(super::error::StreamStoreError::from)?;
        let _: () = cmd("SET")
            .arg(key(account, mailbox, "last_poll"))
            .arg(Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await
            .map_err(super::error::StreamStoreError::from)?;
        Ok(())
    }

    async fn state_summary(&self, account: &str, mailbox: &str) -> Result<MailboxStateSummary, StateError> {
        let mut conn = self.pool.get().await.map_err(super::error::StreamStoreError::from)?;
        let last_poll_raw: Option<String> = cmd("GET")
            .arg(key(account, mailbox, "last_poll"))
            .query_async(&mut conn)
            .await
            .map_err(super::error::StreamStoreError::from)?;
        let total_raw: Option<String> = cmd("GET")
            .arg(key(account, mailbox, "total_emails"))
            .query_async(&mut conn)
            .await
            .map_err(super::error::StreamStoreError::from)?;
        Ok(MailboxStateSummary {
            last_uid: self.last_uid(account, mailbox).await?,
            uidvalidity: self.stored_uidvalidity(account, mailbox).await?,
            last_poll: last_poll_raw.and_then(|v| DateTime::parse_from_rfc3339(&v).ok()).map(|d| d.with_timezone(&Utc)),
            total_emails: total_raw.and_then(|v| v.parse().ok()).unwrap_or(0),
        })
    }
}

/// In-memory stand-in for producer pipeline tests.
#[cfg(test)]
pub struct MockMailboxStateStore {
    inner: parking_lot::Mutex<std::collections::HashMap<String, MailboxStateSummary>>,
}

#[cfg(test)]
impl MockMailboxStateStore {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn entry_key(account: &str, mailbox: &str) -> String {
        format!("{account}:{mailbox}")
    }
}

#[cfg(test)]
impl Default for MockMailboxStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[async_trait]
impl MailboxStateStore for MockMailboxStateStore {
    async fn last_uid(&self, account: &str, mailbox: &str) -> Result<u64, StateError> {
        Ok(self
            .inner
            .lock()
            .get(&Self::entry_key(account, mailbox))
            .map(|s| s.last_uid)
            .unwrap_or(0))
    }

    async fn stored_uidvalidity(&self, account: &str, mailbox: &str) -> Result<Option<u64>, StateError> {
        Ok(self
            .inner
            .lock()
            .get(&Self::entry_key(account, mailbox))
            .and_then(|s| s.uidvalidity))
    }

    async fn check_uidvalidity_changed(
        &self,
        account: &str,
        mailbox: &str,
        current: u64,
    ) -> Result<bool, StateError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry(Self::entry_key(account, mailbox)).or_insert(MailboxStateSummary {
            last_uid: 0,
            uidvalidity: None,
            last_poll: None,
            total_emails: 0,
        });
        match entry.uidvalidity {
            None => {
                entry.uidvalidity = Some(current);
                Ok(false)
            }
            Some(stored) => Ok(stored != current),
        }
    }

    async fn reset_mailbox(&self, account: &str, mailbox: &str) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&Self::entry_key(account, mailbox)) {
            entry.last_uid = 0;
        }
        Ok(())
    }

    async fn commit_atomic(
        &self,
        account: &str,
        mailbox: &str,
        uidvalidity: u64,
        new_last_uid: u64,
    ) -> Result<(), StateError> {
        if self.check_uidvalidity_changed(account, mailbox, uidvalidity).await? {
            let stored = self.stored_uidvalidity(account, mailbox).await?.unwrap_or(0);
            return Err(StateError::UidValidityMismatch {
                mailbox: mailbox.to_string(),
                stored,
                current: uidvalidity,
            });
        }
        let mut inner = self.inner.lock();
        let entry = inner.entry(Self::entry_key(account, mailbox)).or_insert(MailboxStateSummary {
            last_uid: 0,
            uidvalidity: None,
            last_poll: None,
            total_emails: 0,
        });
        entry.last_uid = new_last_uid;
        entry.uidvalidity = Some(uidvalidity);
        entry.last_poll = Some(Utc::now());
        Ok(())
    }

    async fn increment_email_count(&self, account: &str, mailbox: &str, n: u64) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&Self::entry_key(account, mailbox)) {
            entry.total_emails += n;
        }
        Ok(())
    }

    async fn update_last_poll_time(&self, account: &str, mailbox: &str) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&Self::entry_key(account, mailbox)) {
            entry.last_poll = Some(Utc::now());
        }
        Ok(())
    }

    async fn state_summary(&self, account: &str, mailbox: &str) -> Result<MailboxStateSummary, StateError> {
        Ok(self
            .inner
            .lock()
            .get(&Self::entry_key(account, mailbox))
            .cloned()
            .unwrap_or(MailboxStateSummary {
                last_uid: 0,
                uidvalidity: None,
                last_poll: None,
                total_emails: 0,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_select_persists_uidvalidity_without_signalling_change() {
        let store = MockMailboxStateStore::new();
        let changed = store.check_uidvalidity_changed("acct", "INBOX", 1000).await.unwrap();
        assert!(!changed);
        assert_eq!(store.stored_uidvalidity("acct", "INBOX").await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn commit_atomic_advances_watermark_in_order() {
        let store = MockMailboxStateStore::new();
        store.check_uidvalidity_changed("acct", "INBOX", 1000).await.unwrap();
        store.commit_atomic("acct", "INBOX", 1000, 103).await.unwrap();
        assert_eq!(store.last_uid("acct", "INBOX").await.unwrap(), 103);
    }

    #[tokio::test]
    async fn commit_atomic_rejects_stale_uidvalidity() {
        let store = MockMailboxStateStore::new();
        store.check_uidvalidity_changed("acct", "INBOX", 1000).await.unwrap();
        store.commit_atomic("acct", "INBOX", 1000, 103).await.unwrap();
        let err = store.commit_atomic("acct", "INBOX", 999, 200).await.unwrap_err();
        assert!(matches!(err, StateError::UidValidityMismatch { .. }));
        // state must be untouched by the failed commit
        assert_eq!(store.last_uid("acct", "INBOX").await.unwrap(), 103);
    }

    #[tokio::test]
    async fn uidvalidity_rollover_resets_watermark() {
        let store = MockMailboxStateStore::new();
        store.check_uidvalidity_changed("acct", "INBOX", 1000).await.unwrap();
        store.commit_atomic("acct", "INBOX", 1000, 500).await.unwrap();

        let changed = store.check_uidvalidity_changed("acct", "INBOX", 2000).await.unwrap();
        assert!(changed);
        store.reset_mailbox("acct", "INBOX").await.unwrap();
        assert_eq!(store.last_uid("acct", "INBOX").await.unwrap(), 0);

        store.commit_atomic("acct", "INBOX", 2000, 1).await.unwrap();
        assert_eq!(store.last_uid("acct", "INBOX").await.unwrap(), 1);
        assert_eq!(store.stored_uidvalidity("acct", "INBOX").await.unwrap(), Some(2000));
    }
}
