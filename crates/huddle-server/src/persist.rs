//! Write-through to the durable store.
//!
//! Store calls are synchronous rusqlite work, so they run on the blocking
//! pool. Callers hold their room or channel lock across the await, which
//! keeps "persist, then mutate memory" atomic for observers.

use std::sync::Arc;

use huddle_shared::{ChatError, ChatResult};
use huddle_store::{ChatStore, StoreError};

pub type SharedStore = Arc<dyn ChatStore>;

/// Run one store operation; any failure becomes [`ChatError::Internal`].
pub async fn write<F>(store: &SharedStore, what: &'static str, op: F) -> ChatResult<()>
where
    F: FnOnce(&dyn ChatStore) -> Result<(), StoreError> + Send + 'static,
{
    load(store, what, op).await
}

/// Like [`write`] but returns whatever the operation produced.
pub async fn load<T, F>(store: &SharedStore, what: &'static str, op: F) -> ChatResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn ChatStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    let result = tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| {
            tracing::error!(op = what, error = %e, "Store task panicked");
            ChatError::Internal(format!("{what}: store task failed"))
        })?;

    result.map_err(|e| {
        tracing::error!(op = what, error = %e, "Store operation failed");
        ChatError::Internal(format!("{what}: {e}"))
    })
}
