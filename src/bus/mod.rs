//! Durable, partitioned message bus on top of the SQLite store.
//!
//! Topics are split into partitions by message key. Each consumer group owns
//! one worker per partition, so messages with the same key are handled in
//! publish order. Offsets are committed only after a handler succeeds, which
//! gives at-least-once delivery.

mod worker;

use crate::db::{BusRecord, DbError, Store};
use crate::envelope::Topic;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify, RwLock};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus storage error: {0}")]
    Db(#[from] DbError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Error type handlers report back to the bus.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer callback. Returning `Err` leaves the message uncommitted.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, record: &BusRecord) -> Result<(), HandlerError>;
}

/// Acknowledgment for a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub offset: i64,
    pub partition: u32,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub partitions: u32,
    pub poll_interval: Duration,
    pub max_deliveries: u32,
    pub retry_backoff: Duration,
    pub batch_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            poll_interval: Duration::from_millis(500),
            max_deliveries: 10,
            retry_backoff: Duration::from_millis(200),
            batch_size: 100,
        }
    }
}

/// Handlers sharing one consumer group; each message goes to one of them.
pub(crate) struct HandlerPool {
    handlers: std::sync::RwLock<Vec<Arc<dyn MessageHandler>>>,
    next: AtomicUsize,
}

impl HandlerPool {
    fn new(first: Arc<dyn MessageHandler>) -> Self {
        Self {
            handlers: std::sync::RwLock::new(vec![first]),
            next: AtomicUsize::new(0),
        }
    }

    fn join(&self, handler: Arc<dyn MessageHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(handler);
        }
    }

    /// Round-robin pick.
    pub(crate) fn pick(&self) -> Option<Arc<dyn MessageHandler>> {
        let handlers = self.handlers.read().ok()?;
        if handlers.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % handlers.len();
        Some(handlers[i].clone())
    }
}

struct BusInner {
    store: Arc<Store>,
    config: BusConfig,
    notify: Arc<Notify>,
    groups: RwLock<HashMap<(Topic, String), Arc<HandlerPool>>>,
    stop: broadcast::Sender<()>,
}

#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(store: Arc<Store>, config: BusConfig) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(BusInner {
                store,
                config,
                notify: Arc::new(Notify::new()),
                groups: RwLock::new(HashMap::new()),
                stop,
            }),
        }
    }

    pub fn partition_for(&self, key: &str) -> u32 {
        partition_for(key, self.inner.config.partitions)
    }

    /// Serialize and durably append `message`. The returned [`Delivery`] means
    /// the message is committed to storage.
    pub fn publish<T: Serialize>(
        &self,
        topic: Topic,
        key: &str,
        message: &T,
    ) -> Result<Delivery, BusError> {
        let payload = serde_json::to_string(message)?;
        let partition = self.partition_for(key);
        let offset = self.inner.store.append_bus_message(
            topic.as_str(),
            partition,
            key,
            &payload,
            Utc::now(),
        )?;

        tracing::debug!(
            topic = topic.as_str(),
            partition,
            offset,
            key,
            "Published bus message"
        );
        self.inner.notify.notify_waiters();

        Ok(Delivery { offset, partition })
    }

    /// Attach `handler` to a consumer group. The first subscription of a group
    /// starts its partition workers; later ones share the work.
    pub async fn subscribe(
        &self,
        topic: Topic,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        let mut groups = self.inner.groups.write().await;

        if let Some(pool) = groups.get(&(topic, group.to_string())) {
            pool.join(handler);
            tracing::info!(topic = topic.as_str(), group, "Handler joined consumer group");
            return Ok(());
        }

        for partition in 0..self.inner.config.partitions {
            self.inner
                .store
                .ensure_bus_offset(topic.as_str(), group, partition)?;
        }

        let pool = Arc::new(HandlerPool::new(handler));
        groups.insert((topic, group.to_string()), pool.clone());
        drop(groups);

        tracing::info!(
            topic = topic.as_str(),
            group,
            partitions = self.inner.config.partitions,
            "Starting consumer group"
        );

        for partition in 0..self.inner.config.partitions {
            let ctx = worker::PartitionWorker {
                store: self.inner.store.clone(),
                config: self.inner.config.clone(),
                topic,
                group: group.to_string(),
                partition,
                pool: pool.clone(),
                notify: self.inner.notify.clone(),
            };
            tokio::spawn(ctx.run(self.inner.stop.subscribe()));
        }

        Ok(())
    }

    /// Stop every partition worker after its in-flight message.
    pub fn shutdown(&self) {
        let _ = self.inner.stop.send(());
    }
}

/// Decode a record's JSON payload.
pub fn decode<T: DeserializeOwned>(record: &BusRecord) -> Result<T, serde_json::Error> {
    serde_json::from_str(&record.payload)
}

/// FNV-1a, stable across builds so keys keep their partition after a restart.
fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % u64::from(partitions.max(1))) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// Records payloads; fails the first `fail_first` calls.
    struct Recorder {
        seen: Mutex<Vec<String>>,
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl Recorder {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                fail_first,
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, record: &BusRecord) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(format!("failure {}", call).into());
            }
            self.seen.lock().unwrap().push(record.payload.clone());
            Ok(())
        }
    }

    fn test_bus(max_deliveries: u32) -> (NamedTempFile, Arc<Store>, Bus) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let bus = Bus::new(
            store.clone(),
            BusConfig {
                partitions: 3,
                poll_interval: Duration::from_millis(10),
                max_deliveries,
                retry_backoff: Duration::from_millis(1),
                batch_size: 10,
            },
        );
        (tmp, store, bus)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_partitioning_is_stable() {
        assert_eq!(partition_for("42", 4), partition_for("42", 4));
        assert!(partition_for("anything", 4) < 4);
        assert_eq!(partition_for("x", 0), 0);
    }

    #[tokio::test]
    async fn test_same_key_keeps_publish_order() {
        let (_tmp, _store, bus) = test_bus(5);
        for i in 0..20 {
            tokio_test::assert_ok!(bus.publish(Topic::RawRequest, "7", &i));
        }

        let recorder = Recorder::new(0);
        bus.subscribe(Topic::RawRequest, "g", recorder.clone()).await.unwrap();
        wait_until(|| recorder.seen().len() == 20).await;

        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(recorder.seen(), expected);
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_failed_handler_gets_redelivery() {
        let (_tmp, store, bus) = test_bus(5);
        let recorder = Recorder::new(2);
        bus.subscribe(Topic::RawRequest, "g", recorder.clone()).await.unwrap();

        let delivery = bus.publish(Topic::RawRequest, "1", &"hello").unwrap();
        wait_until(|| recorder.seen().len() == 1).await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
        wait_until(|| {
            store
                .committed_bus_offset("raw_request", "g", delivery.partition)
                .unwrap()
                == delivery.offset
        })
        .await;
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_poison_message_is_parked() {
        let (_tmp, store, bus) = test_bus(3);
        let recorder = Recorder::new(usize::MAX);
        bus.subscribe(Topic::TransformedRequest, "g", recorder.clone()).await.unwrap();

        let delivery = bus.publish(Topic::TransformedRequest, "1", &"poison").unwrap();
        wait_until(|| !store.list_dead_letters("transformed_request").unwrap().is_empty()).await;

        let letters = store.list_dead_letters("transformed_request").unwrap();
        assert_eq!(letters[0].message_seq, delivery.offset);
        assert_eq!(letters[0].deliveries, 3);
        assert_eq!(letters[0].error, "failure 2");
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_group_members_share_messages() {
        let (_tmp, _store, bus) = test_bus(5);
        let a = Recorder::new(0);
        let b = Recorder::new(0);
        bus.subscribe(Topic::RawRequest, "shared", a.clone()).await.unwrap();
        bus.subscribe(Topic::RawRequest, "shared", b.clone()).await.unwrap();
        let other = Recorder::new(0);
        bus.subscribe(Topic::RawRequest, "other", other.clone()).await.unwrap();

        for i in 0..10 {
            bus.publish(Topic::RawRequest, &i.to_string(), &i).unwrap();
        }

        wait_until(|| a.seen().len() + b.seen().len() == 10 && other.seen().len() == 10).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.seen().len() + b.seen().len(), 10);
        assert!(!a.seen().is_empty());
        assert!(!b.seen().is_empty());
        bus.shutdown();
    }
}
