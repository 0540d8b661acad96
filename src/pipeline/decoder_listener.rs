use crate::bus::{self, Bus, HandlerError, MessageHandler};
use crate::db::{BusRecord, DbError, Store};
use crate::decoder::PayloadDecoderExecutor;
use crate::envelope::{DecodedPayloadEnvelope, RawUplinkEnvelope, Topic};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Decodes raw uplinks with every decoder connected to the device and
/// publishes one decoded envelope per successful decoder.
pub struct DecoderListener {
    store: Arc<Store>,
    bus: Bus,
    executor: PayloadDecoderExecutor,
}

impl DecoderListener {
    pub fn new(store: Arc<Store>, bus: Bus, executor: PayloadDecoderExecutor) -> Self {
        Self {
            store,
            bus,
            executor,
        }
    }

    /// Returns how many decoded envelopes were published.
    pub async fn process(&self, envelope: &RawUplinkEnvelope) -> Result<usize, HandlerError> {
        let device = match self.store.get_device(envelope.device_id) {
            Ok(device) => device,
            Err(DbError::NotFound) => {
                tracing::warn!(device_id = envelope.device_id, "Uplink for unknown device, skipping");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let connections = self.store.find_connections_by_device(device.id)?;
        let decoder_ids: BTreeSet<i64> = connections
            .iter()
            .filter_map(|c| c.payload_decoder_id)
            .collect();
        let has_passthrough = connections.iter().any(|c| c.payload_decoder_id.is_none());

        if decoder_ids.is_empty() {
            if !has_passthrough {
                tracing::debug!(device_id = device.id, "Device has no connections");
                return Ok(0);
            }
            self.publish(DecodedPayloadEnvelope {
                device_id: device.id,
                payload_decoder_id: None,
                payload: envelope.raw_payload.clone(),
            })?;
            return Ok(1);
        }

        let device_view = device.decoder_view();
        let mut published = 0;

        for decoder_id in decoder_ids {
            let decoder = match self.store.get_payload_decoder(decoder_id) {
                Ok(decoder) => decoder,
                Err(DbError::NotFound) => {
                    tracing::warn!(decoder_id, "Connected payload decoder no longer exists");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self
                .executor
                .execute(&decoder.decoding_function, &device_view, &envelope.raw_payload)
                .await
            {
                Ok(payload) => {
                    self.publish(DecodedPayloadEnvelope {
                        device_id: device.id,
                        payload_decoder_id: Some(decoder_id),
                        payload,
                    })?;
                    published += 1;
                }
                Err(e) => {
                    tracing::warn!(device_id = device.id, decoder_id, "Payload decoder failed: {}", e);
                }
            }
        }

        Ok(published)
    }

    fn publish(&self, envelope: DecodedPayloadEnvelope) -> Result<(), HandlerError> {
        self.bus
            .publish(Topic::TransformedRequest, &envelope.key(), &envelope)?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for DecoderListener {
    async fn handle(&self, record: &BusRecord) -> Result<(), HandlerError> {
        let envelope: RawUplinkEnvelope = match bus::decode(record) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(seq = record.seq, "Discarding undecodable raw envelope: {}", e);
                return Ok(());
            }
        };
        self.process(&envelope).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::db::{DeviceType, Fixtures, SeededIds};
    use crate::decoder::DecoderLimits;
    use crate::secrets::AesGcmSecretStore;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const FIXTURES: &str = r#"{
        "applications": [{ "name": "app" }],
        "payloadDecoders": [
            { "name": "celsius", "decodingFunction": "{'celsius': payload.t, 'device': device.name}" },
            { "name": "broken", "decodingFunction": "json_parse(payload.t)" },
            { "name": "unused", "decodingFunction": "payload" }
        ],
        "devices": [
            { "name": "decoded", "application": "app", "type": "GENERIC_HTTP", "apiKey": "a" },
            { "name": "raw", "application": "app", "type": "GENERIC_HTTP", "apiKey": "b" },
            { "name": "lonely", "application": "app", "type": "GENERIC_HTTP", "apiKey": "c" }
        ],
        "dataTargets": [
            { "name": "t1", "application": "app", "type": "HTTP_PUSH", "url": "http://a.invalid" },
            { "name": "t2", "application": "app", "type": "HTTP_PUSH", "url": "http://b.invalid" }
        ],
        "connections": [
            { "device": "decoded", "payloadDecoder": "celsius", "dataTarget": "t1" },
            { "device": "decoded", "payloadDecoder": "broken", "dataTarget": "t1" },
            { "device": "decoded", "dataTarget": "t2" },
            { "device": "raw", "dataTarget": "t2" }
        ]
    }"#;

    fn setup() -> (NamedTempFile, Arc<Store>, DecoderListener, SeededIds) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let secrets = AesGcmSecretStore::from_base64_key(&AesGcmSecretStore::generate_key()).unwrap();
        let fixtures: Fixtures = serde_json::from_str(FIXTURES).unwrap();
        let ids = store.load_fixtures(&fixtures, &secrets).unwrap();
        let bus = Bus::new(store.clone(), BusConfig::default());
        let executor = PayloadDecoderExecutor::new(DecoderLimits {
            timeout: Duration::from_secs(2),
            ..DecoderLimits::default()
        });
        let listener = DecoderListener::new(store.clone(), bus, executor);
        (tmp, store, listener, ids)
    }

    fn raw(device_id: i64) -> RawUplinkEnvelope {
        RawUplinkEnvelope {
            device_id,
            raw_payload: json!({"t": 21.5}),
            device_type: DeviceType::GenericHttp,
            unix_timestamp: 0,
        }
    }

    fn decoded(store: &Store) -> Vec<DecodedPayloadEnvelope> {
        let mut out = Vec::new();
        for partition in 0..BusConfig::default().partitions {
            for record in store
                .fetch_bus_messages("transformed_request", "test", partition, 100)
                .unwrap()
            {
                out.push(bus::decode(&record).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_broken_decoder_does_not_block_sibling() {
        let (_tmp, store, listener, ids) = setup();
        let published = listener.process(&raw(ids.devices["decoded"])).await.unwrap();
        assert_eq!(published, 1);

        let out = decoded(&store);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload_decoder_id, Some(ids.payload_decoders["celsius"]));
        assert_eq!(out[0].payload, json!({"celsius": 21.5, "device": "decoded"}));
    }

    #[tokio::test]
    async fn test_passthrough_only_without_decoders() {
        let (_tmp, store, listener, ids) = setup();
        listener.process(&raw(ids.devices["raw"])).await.unwrap();

        let out = decoded(&store);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload_decoder_id, None);
        assert_eq!(out[0].payload, json!({"t": 21.5}));
    }

    #[tokio::test]
    async fn test_unconnected_and_unknown_devices_publish_nothing() {
        let (_tmp, store, listener, ids) = setup();
        assert_eq!(listener.process(&raw(ids.devices["lonely"])).await.unwrap(), 0);
        assert_eq!(listener.process(&raw(9999)).await.unwrap(), 0);
        assert!(decoded(&store).is_empty());
    }

    #[tokio::test]
    async fn test_each_redelivery_decodes_again() {
        let (_tmp, store, listener, ids) = setup();
        let envelope = raw(ids.devices["raw"]);
        listener.process(&envelope).await.unwrap();
        listener.process(&envelope).await.unwrap();
        assert_eq!(decoded(&store).len(), 2);
    }
}
