//! Messages carried between pipeline stages on the bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::DeviceType;

/// Bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Raw uplinks from ingestion, consumed by the decoder listener.
    RawRequest,
    /// Decoded payloads, consumed by the dispatcher.
    TransformedRequest,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawRequest => "raw_request",
            Self::TransformedRequest => "transformed_request",
        }
    }
}

/// An uplink as received by an ingestion adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUplinkEnvelope {
    pub device_id: i64,
    pub raw_payload: Value,
    pub device_type: DeviceType,
    /// Milliseconds since the epoch.
    pub unix_timestamp: i64,
}

impl RawUplinkEnvelope {
    /// Bus key; keeps one device's uplinks ordered.
    pub fn key(&self) -> String {
        self.device_id.to_string()
    }
}

/// A payload after decoding, or a raw payload passed through when
/// `payload_decoder_id` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedPayloadEnvelope {
    pub device_id: i64,
    #[serde(default)]
    pub payload_decoder_id: Option<i64>,
    pub payload: Value,
}

impl DecodedPayloadEnvelope {
    pub fn key(&self) -> String {
        self.device_id.to_string()
    }
}
