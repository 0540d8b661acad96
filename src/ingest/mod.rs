//! Ingestion adapters.
//!
//! Every adapter authenticates its source, resolves the device and publishes
//! a [`RawUplinkEnvelope`](crate::envelope::RawUplinkEnvelope). Nothing is
//! published for a source that fails to resolve.

mod external;
mod listeners;
mod service;

pub use external::*;
pub use listeners::*;
pub use service::*;

use crate::bus::BusError;
use crate::db::DbError;

use std::time::Duration;
use thiserror::Error;

/// Attempts made to hand one MQTT uplink to the bus before it is left
/// unacknowledged.
pub const MQTT_ACCEPT_ATTEMPTS: u32 = 5;
const MQTT_ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("InvalidApiKey")]
    InvalidApiKey,
    #[error("api key does not match device type {device_type_id:?}")]
    DeviceTypeMismatch { device_type_id: Option<String> },
    #[error("no device matches {0}")]
    DeviceNotFound(String),
    #[error("bus unavailable: {0}")]
    Bus(#[from] BusError),
    #[error("database error: {0}")]
    Db(#[from] DbError),
}

impl IngestError {
    /// True when the source could not be authenticated or resolved, as
    /// opposed to an internal failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidApiKey | Self::DeviceTypeMismatch { .. } | Self::DeviceNotFound(_)
        )
    }
}

/// What to do with an MQTT publish once ingestion has been attempted.
#[derive(Debug)]
pub enum MqttDisposition {
    /// Published to the bus.
    Accepted,
    /// The source did not resolve; acknowledge so the broker stops sending it.
    Rejected(IngestError),
    /// Internal failure that outlasted every retry; leave it unacknowledged.
    Unavailable(IngestError),
}

impl MqttDisposition {
    pub fn should_ack(&self) -> bool {
        !matches!(self, Self::Unavailable(_))
    }
}

/// Run `accept` until it succeeds or rejects the uplink. Internal failures
/// are retried with exponential back-off, at most `MQTT_ACCEPT_ATTEMPTS` times.
pub async fn accept_mqtt_uplink<F>(mut accept: F) -> MqttDisposition
where
    F: FnMut() -> Result<(), IngestError>,
{
    let mut attempt: u32 = 1;
    loop {
        match accept() {
            Ok(()) => return MqttDisposition::Accepted,
            Err(e) if e.is_rejection() => return MqttDisposition::Rejected(e),
            Err(e) if attempt >= MQTT_ACCEPT_ATTEMPTS => return MqttDisposition::Unavailable(e),
            Err(e) => {
                let delay = MQTT_ACCEPT_BACKOFF * 2u32.pow(attempt - 1);
                tracing::warn!(attempt, "Retrying MQTT uplink in {:?}: {}", delay, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
