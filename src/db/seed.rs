//! JSON fixtures for seeding a registry.
//!
//! Entities reference each other by name. Credentials in a fixtures file are
//! plaintext and get sealed on insert.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::models::*;
use super::store::{DbError, Store};
use crate::secrets::{SecretError, SecretStore};

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("failed to read fixtures: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid fixtures: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("unknown {kind} '{name}'")]
    UnknownReference { kind: &'static str, name: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Fixtures {
    pub applications: Vec<FixtureApplication>,
    pub payload_decoders: Vec<FixtureDecoder>,
    pub devices: Vec<FixtureDevice>,
    pub data_targets: Vec<FixtureTarget>,
    pub connections: Vec<FixtureConnection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureApplication {
    pub name: String,
    #[serde(default)]
    pub organization_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureDecoder {
    pub name: String,
    #[serde(default)]
    pub organization_id: i64,
    pub decoding_function: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureDevice {
    pub name: String,
    pub application: String,
    #[serde(flatten)]
    pub kind: FixtureDeviceKind,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixtureDeviceKind {
    #[serde(rename_all = "camelCase")]
    GenericHttp { api_key: String },
    #[serde(rename_all = "camelCase")]
    Lorawan { dev_eui: String },
    #[serde(rename_all = "camelCase")]
    Sigfox {
        device_id: String,
        device_type_id: String,
        #[serde(default)]
        downlink_payload: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MqttInternalBroker {
        #[serde(default)]
        username: Option<String>,
    },
    MqttExternalBroker(MqttSubscription),
    MqttSubscriber(MqttSubscription),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureTarget {
    pub name: String,
    pub application: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(flatten)]
    pub kind: FixtureTargetKind,
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixtureTargetKind {
    HttpPush {
        url: String,
        #[serde(default)]
        auth: FixtureAuth,
    },
    Fiware {
        url: String,
        #[serde(default)]
        auth: FixtureAuth,
        #[serde(default)]
        tenant: Option<String>,
        #[serde(default)]
        context: Option<String>,
    },
    Mqtt {
        url: String,
        #[serde(default)]
        port: Option<u16>,
        topic: String,
        #[serde(default)]
        qos: u8,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    OpenDataDk {},
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FixtureAuth {
    #[default]
    None,
    Basic {
        username: String,
        #[serde(default)]
        password: Option<String>,
    },
    Header {
        value: String,
    },
    #[serde(rename_all = "camelCase")]
    Oauth2 {
        client_id: String,
        #[serde(default)]
        client_secret: Option<String>,
        token_endpoint: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureConnection {
    pub device: String,
    #[serde(default)]
    pub payload_decoder: Option<String>,
    pub data_target: String,
}

/// Name to ID maps for everything a fixtures load created.
#[derive(Debug, Default)]
pub struct SeededIds {
    pub applications: HashMap<String, i64>,
    pub payload_decoders: HashMap<String, i64>,
    pub devices: HashMap<String, i64>,
    pub data_targets: HashMap<String, i64>,
}

impl Fixtures {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn lookup(map: &HashMap<String, i64>, kind: &'static str, name: &str) -> Result<i64, SeedError> {
    map.get(name).copied().ok_or_else(|| SeedError::UnknownReference {
        kind,
        name: name.to_string(),
    })
}

fn seal_opt(secrets: &dyn SecretStore, value: &Option<String>) -> Result<Option<String>, SeedError> {
    Ok(value.as_deref().map(|v| secrets.seal(v)).transpose()?)
}

fn seal_auth(secrets: &dyn SecretStore, auth: &FixtureAuth) -> Result<HttpAuth, SeedError> {
    Ok(match auth {
        FixtureAuth::None => HttpAuth::None,
        FixtureAuth::Basic { username, password } => HttpAuth::Basic {
            username: username.clone(),
            password: seal_opt(secrets, password)?,
        },
        FixtureAuth::Header { value } => HttpAuth::Header {
            value: value.clone(),
        },
        FixtureAuth::Oauth2 {
            client_id,
            client_secret,
            token_endpoint,
        } => HttpAuth::OAuth2 {
            client_id: client_id.clone(),
            client_secret: seal_opt(secrets, client_secret)?,
            token_endpoint: token_endpoint.clone(),
        },
    })
}

impl Store {
    /// Insert every entity in `fixtures`, sealing credentials on the way in.
    pub fn load_fixtures(
        &self,
        fixtures: &Fixtures,
        secrets: &dyn SecretStore,
    ) -> Result<SeededIds, SeedError> {
        let mut ids = SeededIds::default();

        for app in &fixtures.applications {
            let mut row = Application {
                id: 0,
                name: app.name.clone(),
                organization_id: app.organization_id,
            };
            ids.applications
                .insert(app.name.clone(), self.add_application(&mut row)?);
        }

        for decoder in &fixtures.payload_decoders {
            let mut row = PayloadDecoder {
                id: 0,
                name: decoder.name.clone(),
                organization_id: decoder.organization_id,
                decoding_function: decoder.decoding_function.clone(),
            };
            ids.payload_decoders
                .insert(decoder.name.clone(), self.add_payload_decoder(&mut row)?);
        }

        for device in &fixtures.devices {
            let seal_sub = |sub: &MqttSubscription| -> Result<MqttSubscription, SeedError> {
                Ok(MqttSubscription {
                    password: seal_opt(secrets, &sub.password)?,
                    device_certificate_key: seal_opt(secrets, &sub.device_certificate_key)?,
                    ..sub.clone()
                })
            };
            let kind = match &device.kind {
                FixtureDeviceKind::GenericHttp { api_key } => DeviceKind::GenericHttp {
                    api_key: api_key.clone(),
                },
                FixtureDeviceKind::Lorawan { dev_eui } => DeviceKind::LoRaWan {
                    dev_eui: dev_eui.clone(),
                },
                FixtureDeviceKind::Sigfox {
                    device_id,
                    device_type_id,
                    downlink_payload,
                } => DeviceKind::SigFox {
                    device_id: device_id.clone(),
                    device_type_id: device_type_id.clone(),
                    downlink_payload: downlink_payload.clone(),
                },
                FixtureDeviceKind::MqttInternalBroker { username } => {
                    DeviceKind::MqttInternalBroker {
                        username: username.clone(),
                    }
                }
                FixtureDeviceKind::MqttExternalBroker(sub) => {
                    DeviceKind::MqttExternalBroker(seal_sub(sub)?)
                }
                FixtureDeviceKind::MqttSubscriber(sub) => DeviceKind::MqttSubscriber(seal_sub(sub)?),
            };
            let mut row = Device {
                id: 0,
                name: device.name.clone(),
                application_id: lookup(&ids.applications, "application", &device.application)?,
                kind,
                invalid_config: false,
                last_received_at: None,
            };
            ids.devices
                .insert(device.name.clone(), self.add_device(&mut row)?);
        }

        for target in &fixtures.data_targets {
            let timeout = Duration::from_millis(target.timeout_ms);
            let kind = match &target.kind {
                FixtureTargetKind::HttpPush { url, auth } => DataTargetKind::HttpPush {
                    url: url.clone(),
                    timeout,
                    auth: seal_auth(secrets, auth)?,
                },
                FixtureTargetKind::Fiware {
                    url,
                    auth,
                    tenant,
                    context,
                } => DataTargetKind::Fiware {
                    url: url.clone(),
                    timeout,
                    auth: seal_auth(secrets, auth)?,
                    tenant: tenant.clone(),
                    context: context.clone(),
                },
                FixtureTargetKind::Mqtt {
                    url,
                    port,
                    topic,
                    qos,
                    username,
                    password,
                } => DataTargetKind::Mqtt(MqttTarget {
                    url: url.clone(),
                    port: *port,
                    topic: topic.clone(),
                    qos: *qos,
                    timeout,
                    username: username.clone(),
                    password: seal_opt(secrets, password)?,
                }),
                FixtureTargetKind::OpenDataDk {} => DataTargetKind::OpenDataDk,
            };
            let mut row = DataTarget {
                id: 0,
                name: target.name.clone(),
                application_id: lookup(&ids.applications, "application", &target.application)?,
                kind,
                last_message_date: None,
            };
            ids.data_targets
                .insert(target.name.clone(), self.add_data_target(&mut row)?);
        }

        for connection in &fixtures.connections {
            let payload_decoder_id = match &connection.payload_decoder {
                Some(name) => Some(lookup(&ids.payload_decoders, "payload decoder", name)?),
                None => None,
            };
            let mut row = Connection {
                id: 0,
                device_id: lookup(&ids.devices, "device", &connection.device)?,
                payload_decoder_id,
                data_target_id: lookup(&ids.data_targets, "data target", &connection.data_target)?,
            };
            self.add_connection(&mut row)?;
        }

        tracing::info!(
            "Loaded fixtures: {} devices, {} decoders, {} data targets, {} connections",
            ids.devices.len(),
            ids.payload_decoders.len(),
            ids.data_targets.len(),
            fixtures.connections.len()
        );

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::AesGcmSecretStore;
    use tempfile::NamedTempFile;

    const FIXTURES: &str = r#"{
        "applications": [{ "name": "city", "organizationId": 1 }],
        "payloadDecoders": [{ "name": "celsius", "decodingFunction": "payload" }],
        "devices": [
            { "name": "d1", "application": "city", "type": "GENERIC_HTTP", "apiKey": "abc123" },
            { "name": "ext", "application": "city", "type": "MQTT_EXTERNAL_BROKER",
              "url": "mqtt://broker.invalid", "port": 1883, "topic": "t", "password": "pw" }
        ],
        "dataTargets": [
            { "name": "hook", "application": "city", "type": "HTTP_PUSH", "url": "http://hook.invalid",
              "auth": { "kind": "basic", "username": "u", "password": "p" } },
            { "name": "catalog", "application": "city", "type": "OPEN_DATA_DK" }
        ],
        "connections": [
            { "device": "d1", "dataTarget": "hook" },
            { "device": "d1", "payloadDecoder": "celsius", "dataTarget": "catalog" }
        ]
    }"#;

    #[test]
    fn test_fixtures_seal_credentials() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let secrets = AesGcmSecretStore::from_base64_key(&AesGcmSecretStore::generate_key()).unwrap();

        let fixtures: Fixtures = serde_json::from_str(FIXTURES).unwrap();
        let ids = store.load_fixtures(&fixtures, &secrets).unwrap();

        let hook = store.get_data_target(ids.data_targets["hook"]).unwrap();
        match hook.kind {
            DataTargetKind::HttpPush {
                auth: HttpAuth::Basic { username, password },
                ..
            } => {
                assert_eq!(username, "u");
                let sealed = password.unwrap();
                assert_ne!(sealed, "p");
                assert_eq!(secrets.reveal(&sealed).unwrap().as_deref(), Some("p"));
            }
            other => panic!("unexpected kind {:?}", other),
        }

        let ext = store.get_device(ids.devices["ext"]).unwrap();
        let sub = ext.kind.subscription().unwrap();
        assert_eq!(secrets.reveal(sub.password.as_deref().unwrap()).unwrap().as_deref(), Some("pw"));

        let connections = store.find_connections_by_device(ids.devices["d1"]).unwrap();
        assert_eq!(connections.len(), 2);
    }

    #[test]
    fn test_unknown_reference_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let secrets = AesGcmSecretStore::from_base64_key(&AesGcmSecretStore::generate_key()).unwrap();
        let fixtures: Fixtures = serde_json::from_str(
            r#"{ "devices": [{ "name": "d", "application": "missing", "type": "LORAWAN", "devEui": "01" }] }"#,
        )
        .unwrap();

        let err = store.load_fixtures(&fixtures, &secrets).unwrap_err();
        assert!(matches!(err, SeedError::UnknownReference { kind: "application", .. }));
    }
}
