use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Inner;
use crate::cache::CacheRecord;
use crate::error::CacheError;
use crate::model::now_seconds;
use crate::updates::DmUpdate;

/// Debounced writer task. Each store change restarts the delay; one write follows
/// once the store has been quiet for the whole delay.
pub(crate) struct PersistHandle {
    task: JoinHandle<()>,
}

impl PersistHandle {
    pub(crate) fn cancel(self) {
        self.task.abort();
    }
}

impl Inner {
    pub(crate) fn ensure_persister(self: &Arc<Self>) {
        let mut slot = self.persister.lock();
        if slot.is_some() {
            return;
        }
        let changes = self.store.subscribe();
        let delay = self.config.timing.debounced_write();
        let task = tokio::spawn(debounce_loop(Arc::downgrade(self), changes, delay));
        *slot = Some(PersistHandle { task });
    }

    /// Write the current store to the cache. Plaintext never leaves memory.
    pub(crate) async fn flush(&self) -> Result<(), CacheError> {
        let _flush = self.flush_lock.lock().await;
        let snapshot = self.store.snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }
        let last_sync = self.state.lock().checkpoints;
        let record = CacheRecord::from_snapshot(&snapshot, last_sync);
        let count = record.message_count();

        let cache = Arc::clone(&self.cache);
        let key = self.cache_key.clone();
        tokio::task::spawn_blocking(move || cache.write(&key, &record))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))??;
        tracing::debug!(conversations = snapshot.len(), messages = count, "dm cache flushed");

        // A successful write means we are at least this up to date.
        let now = now_seconds();
        let updated = {
            let mut st = self.state.lock();
            let before = st.checkpoints;
            st.checkpoints.nip04.get_or_insert(now);
            st.checkpoints.nip17.get_or_insert(now);
            (st.checkpoints != before).then_some(st.checkpoints)
        };
        if let Some(last_sync) = updated {
            self.emit(|rev| DmUpdate::CheckpointsChanged { rev, last_sync });
        }
        Ok(())
    }
}

async fn debounce_loop(
    inner: Weak<Inner>,
    mut changes: watch::Receiver<u64>,
    delay: std::time::Duration,
) {
    loop {
        if changes.changed().await.is_err() {
            return;
        }
        loop {
            match tokio::time::timeout(delay, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
                Err(_) => break,
            }
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(e) = inner.flush().await {
            tracing::error!(%e, "debounced dm cache flush failed");
        }
    }
}
