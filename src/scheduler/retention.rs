//! Retention manager for purging consumed bus messages.

use crate::db::Store;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Periodically deletes bus messages older than the retention window that
/// every consumer group has committed.
pub struct RetentionManager {
    store: Arc<Store>,
    retention: Duration,
    interval: Duration,
    stop: broadcast::Sender<()>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention: Duration) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            store,
            retention,
            interval: Duration::from_secs(60),
            stop,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let retention = self.retention;
        let mut rx = self.stop.subscribe();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, retention);
                    }
                }
            }
            tracing::debug!("RetentionManager: stopped");
        });
    }

    /// Stop the retention manager.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

/// Returns the number of purged messages.
pub(crate) fn process_retention(store: &Store, retention: Duration) -> usize {
    let window = ChronoDuration::from_std(retention).unwrap_or_else(|_| ChronoDuration::days(36500));
    let cutoff = Utc::now() - window;

    let purged = match store.purge_bus_messages_before(cutoff) {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("RetentionManager: Failed to purge bus messages: {}", e);
            return 0;
        }
    };

    if purged > 0 {
        tracing::info!(purged, "RetentionManager: Purged consumed bus messages");
    }
    if let Ok(size) = store.get_db_size_bytes() {
        tracing::debug!(db_size_bytes = size, "RetentionManager: sweep finished");
    }
    purged
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_only_committed_old_messages_are_purged() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let old = Utc::now() - ChronoDuration::hours(2);

        store.ensure_bus_offset("raw_request", "g", 0).unwrap();
        let first = store.append_bus_message("raw_request", 0, "1", "{}", old).unwrap();
        let second = store.append_bus_message("raw_request", 0, "1", "{}", old).unwrap();
        store.append_bus_message("raw_request", 0, "1", "{}", Utc::now()).unwrap();
        store.commit_bus_offset("raw_request", "g", 0, first).unwrap();

        assert_eq!(process_retention(&store, Duration::from_secs(3600)), 1);
        assert_eq!(process_retention(&store, Duration::from_secs(3600)), 0);

        let remaining = store.fetch_bus_messages("raw_request", "g", 0, 10).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].seq, second);
    }

    #[tokio::test]
    async fn test_manager_sweeps_and_stops() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        store.ensure_bus_offset("raw_request", "g", 0).unwrap();
        let seq = store
            .append_bus_message("raw_request", 0, "1", "{}", Utc::now() - ChronoDuration::hours(1))
            .unwrap();
        store.commit_bus_offset("raw_request", "g", 0, seq).unwrap();

        let manager = RetentionManager::new(store.clone(), Duration::from_secs(60))
            .with_interval(Duration::from_millis(10));
        manager.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.stop();

        assert!(store.fetch_bus_messages("raw_request", "other", 0, 10).unwrap().is_empty());
    }
}
