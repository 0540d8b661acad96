use super::{OutcomeRecorder, TargetResolver};
use crate::bus::{self, HandlerError, MessageHandler};
use crate::db::BusRecord;
use crate::envelope::DecodedPayloadEnvelope;
use crate::sender::DataTargetSender;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

/// Sends one data target may have in flight before further sends to it queue.
pub const MAX_IN_FLIGHT_PER_TARGET: usize = 16;

/// Counts spawned sends that have not finished.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    fn start(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Fans a decoded payload out to its data targets. Every send is spawned on
/// its own task and recorded when it finishes; the envelope is acknowledged
/// once the sends are started. Each target has its own lane of
/// `MAX_IN_FLIGHT_PER_TARGET` permits, so a slow target only holds up itself.
pub struct Dispatcher {
    resolver: TargetResolver,
    sender: Arc<dyn DataTargetSender>,
    recorder: OutcomeRecorder,
    lanes: Mutex<HashMap<i64, Arc<Semaphore>>>,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    pub fn new(
        resolver: TargetResolver,
        sender: Arc<dyn DataTargetSender>,
        recorder: OutcomeRecorder,
    ) -> Self {
        Self {
            resolver,
            sender,
            recorder,
            lanes: Mutex::new(HashMap::new()),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    fn lane(&self, target_id: i64) -> Arc<Semaphore> {
        let mut lanes = match self.lanes.lock() {
            Ok(lanes) => lanes,
            Err(poisoned) => poisoned.into_inner(),
        };
        lanes
            .entry(target_id)
            .or_insert_with(|| Arc::new(Semaphore::new(MAX_IN_FLIGHT_PER_TARGET)))
            .clone()
    }

    /// Starts a send per resolved target and returns how many were started.
    /// Connected targets whose configuration is unusable get an error entry
    /// in their delivery log instead.
    pub fn dispatch(&self, envelope: DecodedPayloadEnvelope) -> Result<usize, HandlerError> {
        let resolved = self
            .resolver
            .resolve(envelope.device_id, envelope.payload_decoder_id)?;

        for (target_id, reason) in &resolved.invalid {
            if let Err(e) = self.recorder.record_unusable(
                *target_id,
                envelope.device_id,
                envelope.payload_decoder_id,
                reason,
            ) {
                tracing::error!(target_id, "Failed to record unusable data target: {}", e);
            }
        }

        if resolved.targets.is_empty() {
            tracing::debug!(device_id = envelope.device_id, decoder_id = ?envelope.payload_decoder_id, "No data targets");
            return Ok(0);
        }

        let envelope = Arc::new(envelope);
        let started = resolved.targets.len();

        for target in resolved.targets {
            let sender = self.sender.clone();
            let recorder = self.recorder.clone();
            let envelope = envelope.clone();
            let lane = self.lane(target.id);
            let guard = self.in_flight.start();

            tokio::spawn(async move {
                let _guard = guard;
                let Ok(_permit) = lane.acquire_owned().await else {
                    return;
                };
                let outcome = sender.send(&target, &envelope.payload).await;
                if let Err(e) = recorder.record(
                    &target,
                    envelope.device_id,
                    envelope.payload_decoder_id,
                    &outcome,
                ) {
                    tracing::error!(target_id = target.id, "Failed to record send outcome: {}", e);
                }
            });
        }

        Ok(started)
    }

    /// Number of sends started and not yet recorded.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Resolves once no send is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, record: &BusRecord) -> Result<(), HandlerError> {
        let envelope: DecodedPayloadEnvelope = match bus::decode(record) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(seq = record.seq, "Discarding undecodable decoded envelope: {}", e);
                return Ok(());
            }
        };
        self.dispatch(envelope).map(|_| ())
    }
}
