//! The business-logic collaborator invoked per entry. Out of scope in the
//! sense that its internals are not specified; the core only depends on the
//! success/failure shape.

use async_trait::async_trait;

use crate::domain::email::EmailRecord;

#[async_trait]
pub trait EmailProcessor: Send + Sync {
    async fn process(&self, record: &EmailRecord) -> anyhow::Result<()>;
}

/// No-op processor used for wiring/tests and as a sane default.
pub struct NoopProcessor;

#[async_trait]
impl EmailProcessor for NoopProcessor {
    async fn process(&self, _record: &EmailRecord) -> anyhow::Result<()> {
        Ok(())
    }
}
