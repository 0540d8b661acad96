//! Partition worker: pulls uncommitted messages for one consumer group and
//! partition and hands them to the group's handlers in order.

use super::HandlerPool;
use crate::db::{BusRecord, Store};
use crate::envelope::Topic;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

pub(super) struct PartitionWorker {
    pub store: Arc<Store>,
    pub config: super::BusConfig,
    pub topic: Topic,
    pub group: String,
    pub partition: u32,
    pub pool: Arc<HandlerPool>,
    pub notify: Arc<Notify>,
}

/// What happened to a record.
enum Outcome {
    Committed,
    Parked,
    Stopped,
}

impl PartitionWorker {
    pub async fn run(self, mut stop_rx: broadcast::Receiver<()>) {
        let topic = self.topic.as_str();
        tracing::debug!(topic, group = %self.group, partition = self.partition, "Partition worker started");

        'outer: loop {
            let batch = match self.store.fetch_bus_messages(
                topic,
                &self.group,
                self.partition,
                self.config.batch_size,
            ) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(topic, partition = self.partition, "Failed to fetch bus messages: {}", e);
                    Vec::new()
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            for record in batch {
                match self.deliver(&record, &mut stop_rx).await {
                    Ok(Outcome::Committed) | Ok(Outcome::Parked) => {}
                    Ok(Outcome::Stopped) => break 'outer,
                    Err(e) => {
                        // Offset not stored; refetch and hand the record out again.
                        tracing::error!(
                            topic,
                            partition = self.partition,
                            seq = record.seq,
                            "Failed to commit bus offset: {}",
                            e
                        );
                        tokio::time::sleep(self.config.poll_interval).await;
                        continue 'outer;
                    }
                }
            }
        }

        tracing::debug!(topic, group = %self.group, partition = self.partition, "Partition worker stopped");
    }

    /// Deliver until a handler accepts the record or it runs out of attempts.
    async fn deliver(
        &self,
        record: &BusRecord,
        stop_rx: &mut broadcast::Receiver<()>,
    ) -> Result<Outcome, crate::db::DbError> {
        let topic = self.topic.as_str();
        let mut deliveries: u32 = 0;

        loop {
            let Some(handler) = self.pool.pick() else {
                return Ok(Outcome::Stopped);
            };

            deliveries += 1;
            let error = match handler.handle(record).await {
                Ok(()) => {
                    self.store
                        .commit_bus_offset(topic, &self.group, self.partition, record.seq)?;
                    return Ok(Outcome::Committed);
                }
                Err(e) => e.to_string(),
            };

            if deliveries >= self.config.max_deliveries {
                tracing::error!(
                    topic,
                    group = %self.group,
                    seq = record.seq,
                    deliveries,
                    "Parking bus message after repeated failures: {}",
                    error
                );
                self.store
                    .park_bus_message(record, &self.group, &error, deliveries)?;
                return Ok(Outcome::Parked);
            }

            let delay = self.backoff(deliveries);
            tracing::warn!(
                topic,
                group = %self.group,
                seq = record.seq,
                deliveries,
                "Handler failed, redelivering in {:?}: {}",
                delay,
                error
            );

            tokio::select! {
                _ = stop_rx.recv() => return Ok(Outcome::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Exponential back-off capped at 30s, plus up to 100ms of jitter.
    fn backoff(&self, deliveries: u32) -> Duration {
        let exp = self
            .config
            .retry_backoff
            .saturating_mul(1u32 << deliveries.saturating_sub(1).min(16));
        let jitter = Duration::from_millis(rand::random::<u64>() % 100);
        exp.min(Duration::from_secs(30)) + jitter
    }
}
