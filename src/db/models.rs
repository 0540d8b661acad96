//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Groups devices and data targets under an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub organization_id: i64,
}

/// Device discriminator as stored in the `devices.type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    GenericHttp,
    Lorawan,
    Sigfox,
    MqttInternalBroker,
    MqttExternalBroker,
    MqttSubscriber,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenericHttp => "GENERIC_HTTP",
            Self::Lorawan => "LORAWAN",
            Self::Sigfox => "SIGFOX",
            Self::MqttInternalBroker => "MQTT_INTERNAL_BROKER",
            Self::MqttExternalBroker => "MQTT_EXTERNAL_BROKER",
            Self::MqttSubscriber => "MQTT_SUBSCRIBER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GENERIC_HTTP" => Some(Self::GenericHttp),
            "LORAWAN" => Some(Self::Lorawan),
            "SIGFOX" => Some(Self::Sigfox),
            "MQTT_INTERNAL_BROKER" => Some(Self::MqttInternalBroker),
            "MQTT_EXTERNAL_BROKER" => Some(Self::MqttExternalBroker),
            "MQTT_SUBSCRIBER" => Some(Self::MqttSubscriber),
            _ => None,
        }
    }
}

/// Connection settings for a device whose data we pull from someone else's broker.
///
/// `password` and `device_certificate_key` are sealed and must go through the
/// secret store before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttSubscription {
    pub url: String,
    pub port: u16,
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ca_certificate: Option<String>,
    #[serde(default)]
    pub device_certificate: Option<String>,
    #[serde(default)]
    pub device_certificate_key: Option<String>,
}

/// Transport-specific identity of a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceKind {
    GenericHttp {
        api_key: String,
    },
    LoRaWan {
        dev_eui: String,
    },
    SigFox {
        device_id: String,
        device_type_id: String,
        downlink_payload: Option<String>,
    },
    MqttInternalBroker {
        username: Option<String>,
    },
    MqttExternalBroker(MqttSubscription),
    MqttSubscriber(MqttSubscription),
}

impl DeviceKind {
    pub fn device_type(&self) -> DeviceType {
        match self {
            Self::GenericHttp { .. } => DeviceType::GenericHttp,
            Self::LoRaWan { .. } => DeviceType::Lorawan,
            Self::SigFox { .. } => DeviceType::Sigfox,
            Self::MqttInternalBroker { .. } => DeviceType::MqttInternalBroker,
            Self::MqttExternalBroker(_) => DeviceType::MqttExternalBroker,
            Self::MqttSubscriber(_) => DeviceType::MqttSubscriber,
        }
    }

    /// Broker settings for devices we subscribe to on an external broker.
    pub fn subscription(&self) -> Option<&MqttSubscription> {
        match self {
            Self::MqttExternalBroker(sub) | Self::MqttSubscriber(sub) => Some(sub),
            _ => None,
        }
    }
}

/// A registered IoT device.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub application_id: i64,
    pub kind: DeviceKind,
    pub invalid_config: bool,
    pub last_received_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn device_type(&self) -> DeviceType {
        self.kind.device_type()
    }

    /// Device metadata handed to payload decoders. Never carries credentials.
    pub fn decoder_view(&self) -> Value {
        let mut view = json!({
            "id": self.id,
            "name": self.name,
            "type": self.device_type().as_str(),
            "applicationId": self.application_id,
        });

        let extra = match &self.kind {
            DeviceKind::GenericHttp { .. } => json!({}),
            DeviceKind::LoRaWan { dev_eui } => json!({ "deviceEUI": dev_eui }),
            DeviceKind::SigFox {
                device_id,
                device_type_id,
                ..
            } => json!({ "deviceId": device_id, "deviceTypeId": device_type_id }),
            DeviceKind::MqttInternalBroker { .. } => json!({}),
            DeviceKind::MqttExternalBroker(sub) | DeviceKind::MqttSubscriber(sub) => {
                json!({ "mqttTopic": sub.topic })
            }
        };

        if let (Some(view), Value::Object(extra)) = (view.as_object_mut(), extra) {
            view.extend(extra);
        }
        view
    }
}

/// Tenant-authored decoding logic, referenced by connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadDecoder {
    pub id: i64,
    pub name: String,
    pub organization_id: i64,
    pub decoding_function: String,
}

/// Data target discriminator as stored in the `data_targets.type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataTargetType {
    HttpPush,
    Fiware,
    Mqtt,
    OpenDataDk,
}

impl DataTargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpPush => "HTTP_PUSH",
            Self::Fiware => "FIWARE",
            Self::Mqtt => "MQTT",
            Self::OpenDataDk => "OPEN_DATA_DK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HTTP_PUSH" => Some(Self::HttpPush),
            "FIWARE" => Some(Self::Fiware),
            "MQTT" => Some(Self::Mqtt),
            "OPEN_DATA_DK" => Some(Self::OpenDataDk),
            _ => None,
        }
    }
}

/// Outbound authorization for HTTP based targets. Secrets are sealed.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpAuth {
    None,
    Basic {
        username: String,
        password: Option<String>,
    },
    Header {
        value: String,
    },
    OAuth2 {
        client_id: String,
        client_secret: Option<String>,
        token_endpoint: String,
    },
}

/// Broker settings for an MQTT data target. `password` is sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttTarget {
    pub url: String,
    pub port: Option<u16>,
    pub topic: String,
    pub qos: u8,
    pub timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataTargetKind {
    HttpPush {
        url: String,
        timeout: Duration,
        auth: HttpAuth,
    },
    Fiware {
        url: String,
        timeout: Duration,
        auth: HttpAuth,
        tenant: Option<String>,
        context: Option<String>,
    },
    Mqtt(MqttTarget),
    /// Pull-based; never pushed to.
    OpenDataDk,
}

impl DataTargetKind {
    pub fn target_type(&self) -> DataTargetType {
        match self {
            Self::HttpPush { .. } => DataTargetType::HttpPush,
            Self::Fiware { .. } => DataTargetType::Fiware,
            Self::Mqtt(_) => DataTargetType::Mqtt,
            Self::OpenDataDk => DataTargetType::OpenDataDk,
        }
    }
}

/// An external system receiving decoded payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTarget {
    pub id: i64,
    pub name: String,
    pub application_id: i64,
    pub kind: DataTargetKind,
    pub last_message_date: Option<DateTime<Utc>>,
}

impl DataTarget {
    pub fn target_type(&self) -> DataTargetType {
        self.kind.target_type()
    }
}

/// Routing link: payloads from `device_id` decoded by `payload_decoder_id`
/// (or undecoded, when `None`) go to `data_target_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: i64,
    pub device_id: i64,
    pub payload_decoder_id: Option<i64>,
    pub data_target_id: i64,
}

/// Terminal outcome of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    Ok,
    Error,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(Self::Ok),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryLogEntry {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub data_target_id: i64,
    pub device_id: Option<i64>,
    pub payload_decoder_id: Option<i64>,
    pub status: SendStatus,
    pub status_code: Option<u16>,
    pub message: Option<String>,
}

/// A stored bus message.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub seq: i64,
    pub topic: String,
    pub partition: u32,
    pub key: String,
    pub payload: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_seq: i64,
    pub topic: String,
    pub consumer_group: String,
    pub partition: u32,
    pub error: String,
    pub deliveries: u32,
}
