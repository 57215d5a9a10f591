//! Correlation-id propagation across suspension points.
//!
//! Each logical unit of work (one producer poll cycle, one consumer entry)
//! runs inside `with_new_id`, which mints a fresh id and makes it available
//! to every `.await` point nested underneath via a task-local, the idiomatic
//! replacement for the source's thread-local context variable.

use std::future::Future;

use uuid::Uuid;

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Runs `fut` with a freshly minted correlation id bound for its duration,
/// and opens a tracing span carrying it so every event nested inside is
/// tagged automatically.
pub async fn with_new_id<F, T>(unit_of_work: &str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("unit_of_work", unit_of_work, correlation_id = %id);
    CORRELATION_ID
        .scope(id, tracing::Instrument::instrument(fut, span))
        .await
}

/// Reads the correlation id of the enclosing unit of work, if any.
pub fn current() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn id_is_visible_inside_scope_and_absent_outside() {
        assert!(current().is_none());
        with_new_id("test", async {
            assert!(current().is_some());
        })
        .await;
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn nested_scopes_get_distinct_ids() {
        with_new_id("outer", async {
            let outer = current().unwrap();
            with_new_id("inner", async {
                let inner = current().unwrap();
                assert_ne!(outer, inner);
            })
            .await;
        })
        .await;
    }
}
