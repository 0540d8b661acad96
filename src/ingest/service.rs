use super::IngestError;
use crate::bus::{Bus, Delivery};
use crate::db::{Device, DeviceKind, Store};
use crate::envelope::{RawUplinkEnvelope, Topic};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Topic prefix devices publish under on the internal broker.
pub const INTERNAL_TOPIC_PREFIX: &str = "devices/";

/// The SigFox callback fields we route on. The whole body is forwarded as
/// the raw payload.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SigfoxCallback {
    /// Seconds since the epoch, as SigFox sends it.
    pub time: Option<i64>,
    pub device_type_id: Option<String>,
    pub device_id: Option<String>,
    pub data: Option<String>,
    pub seq_number: Option<i64>,
    pub ack: Option<bool>,
}

/// Result of an accepted SigFox callback.
#[derive(Debug)]
pub struct SigfoxAccepted {
    pub delivery: Delivery,
    /// `{"<deviceId>": {"downlinkData": "..."}}` when a downlink was pending.
    pub downlink: Option<Value>,
}

/// Resolves devices and publishes their uplinks. Shared by the HTTP
/// endpoints and the MQTT listeners.
#[derive(Clone)]
pub struct IngestService {
    store: Arc<Store>,
    bus: Bus,
}

impl IngestService {
    pub fn new(store: Arc<Store>, bus: Bus) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Generic HTTP device. `body` is parsed leniently.
    pub fn receive_generic_http(&self, api_key: &str, body: &[u8]) -> Result<Delivery, IngestError> {
        let device = self
            .store
            .find_by_api_key(api_key)?
            .ok_or(IngestError::InvalidApiKey)?;
        self.publish(&device, parse_lenient(body), now_ms())
    }

    /// SigFox backend callback. `api_key` must equal the body's `deviceTypeId`.
    pub fn receive_sigfox(&self, api_key: &str, body: &[u8]) -> Result<SigfoxAccepted, IngestError> {
        let raw = parse_lenient(body);
        let callback: SigfoxCallback = serde_json::from_value(raw.clone()).unwrap_or_default();

        let device_type_id = match callback.device_type_id {
            Some(id) if id == api_key => id,
            other => {
                tracing::warn!(device_type_id = ?other, "SigFox api key does not match device type");
                return Err(IngestError::DeviceTypeMismatch { device_type_id: other });
            }
        };
        let sigfox_id = callback.device_id.unwrap_or_default();

        let device = self
            .store
            .find_sigfox_device(&sigfox_id, &device_type_id)?
            .ok_or_else(|| {
                IngestError::DeviceNotFound(format!(
                    "SigFox device {} of type {}",
                    sigfox_id, device_type_id
                ))
            })?;

        let timestamp = callback
            .time
            .and_then(|secs| secs.checked_mul(1000))
            .unwrap_or_else(now_ms);
        let delivery = self.publish(&device, raw, timestamp)?;

        let downlink = match &device.kind {
            DeviceKind::SigFox { device_id, .. } => match self.store.take_downlink(device.id)? {
                Some(payload) => {
                    tracing::info!(device_id = device.id, sigfox_id = %device_id, "Handing out SigFox downlink");
                    Some(json!({ device_id.as_str(): { "downlinkData": payload } }))
                }
                None => None,
            },
            _ => None,
        };

        Ok(SigfoxAccepted { delivery, downlink })
    }

    /// LoRaWAN network server uplink; the device is resolved by `devEUI`.
    pub fn receive_lorawan(&self, body: &[u8]) -> Result<Delivery, IngestError> {
        let raw = parse_lenient(body);
        let dev_eui = raw
            .get("devEUI")
            .and_then(Value::as_str)
            .ok_or_else(|| IngestError::DeviceNotFound("uplink without devEUI".to_string()))?;

        let device = self
            .store
            .find_by_dev_eui(dev_eui)?
            .ok_or_else(|| IngestError::DeviceNotFound(format!("devEUI {}", dev_eui)))?;
        self.publish(&device, raw, now_ms())
    }

    /// Internal broker message on `devices/<deviceId>`.
    pub fn receive_internal_mqtt(&self, topic: &str, body: &[u8]) -> Result<Delivery, IngestError> {
        let device_id = device_id_from_topic(topic)
            .ok_or_else(|| IngestError::DeviceNotFound(format!("topic {}", topic)))?;
        let device = self
            .store
            .find_internal_mqtt_device(device_id)?
            .ok_or_else(|| IngestError::DeviceNotFound(format!("MQTT device {}", device_id)))?;
        self.publish(&device, parse_lenient(body), now_ms())
    }

    /// Message from an external broker subscription that belongs to `device`.
    pub fn receive_subscribed(&self, device: &Device, body: &[u8]) -> Result<Delivery, IngestError> {
        self.publish(device, parse_lenient(body), now_ms())
    }

    fn publish(&self, device: &Device, raw_payload: Value, unix_timestamp: i64) -> Result<Delivery, IngestError> {
        let envelope = RawUplinkEnvelope {
            device_id: device.id,
            raw_payload,
            device_type: device.device_type(),
            unix_timestamp,
        };
        let delivery = self.bus.publish(Topic::RawRequest, &envelope.key(), &envelope)?;

        tracing::debug!(
            device_id = device.id,
            device_type = device.device_type().as_str(),
            offset = delivery.offset,
            "Accepted uplink"
        );

        if let Err(e) = self.store.touch_device(device.id, Utc::now()) {
            tracing::warn!(device_id = device.id, "Failed to record last uplink time: {}", e);
        }

        Ok(delivery)
    }
}

/// Malformed JSON becomes an empty object.
pub fn parse_lenient(body: &[u8]) -> Value {
    match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!("Substituting empty payload for unparseable body: {}", e);
            Value::Object(Map::new())
        }
    }
}

/// Last path segment of an internal broker topic, as a device id.
pub fn device_id_from_topic(topic: &str) -> Option<i64> {
    topic
        .strip_prefix(INTERNAL_TOPIC_PREFIX)?
        .rsplit('/')
        .next()?
        .parse()
        .ok()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
