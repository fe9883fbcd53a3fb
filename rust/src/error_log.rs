//! Rate-limited error logging.
//!
//! Repeated failures of one category inside the window collapse into a single
//! `"<category> processing complete with N errors"` line.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

#[derive(Default)]
struct Bucket {
    count: usize,
    generation: u64,
}

#[derive(Clone)]
pub struct ErrorAggregator {
    window: Duration,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl ErrorAggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Count one failure. The summary is logged once the category has been quiet for the window.
    pub fn record(&self, category: &str, detail: &str) {
        tracing::debug!(category, detail, "processing error");
        let generation = {
            let mut buckets = self.buckets.lock();
            let bucket = buckets.entry(category.to_string()).or_default();
            bucket.count += 1;
            bucket.generation += 1;
            bucket.generation
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.emit(category);
            return;
        };
        let this = self.clone();
        let category = category.to_string();
        handle.spawn(async move {
            tokio::time::sleep(this.window).await;
            let still_latest = this
                .buckets
                .lock()
                .get(&category)
                .is_some_and(|b| b.generation == generation);
            if still_latest {
                this.emit(&category);
            }
        });
    }

    /// Failures counted but not yet summarized.
    pub fn pending(&self, category: &str) -> usize {
        self.buckets.lock().get(category).map(|b| b.count).unwrap_or(0)
    }

    fn emit(&self, category: &str) {
        let Some(bucket) = self.buckets.lock().remove(category) else {
            return;
        };
        if bucket.count > 0 {
            tracing::warn!(
                count = bucket.count,
                "{category} processing complete with {} errors",
                bucket.count
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bursts_collapse_into_one_summary() {
        let errors = ErrorAggregator::new(Duration::from_millis(30));
        for _ in 0..5 {
            errors.record("NIP-17 scan", "bad seal");
        }
        assert_eq!(errors.pending("NIP-17 scan"), 5);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(errors.pending("NIP-17 scan"), 0);
    }

    #[tokio::test]
    async fn categories_are_counted_separately() {
        let errors = ErrorAggregator::new(Duration::from_millis(500));
        errors.record("NIP-4 scan", "no p tag");
        errors.record("NIP-17 live", "bad seal");
        errors.record("NIP-17 live", "bad seal");
        assert_eq!(errors.pending("NIP-4 scan"), 1);
        assert_eq!(errors.pending("NIP-17 live"), 2);
    }

    #[test]
    fn without_runtime_logs_immediately() {
        let errors = ErrorAggregator::new(Duration::from_secs(2));
        errors.record("cache", "unreadable");
        assert_eq!(errors.pending("cache"), 0);
    }
}
