//! MQTT data target sender.
//!
//! Every send opens a short-lived connection, publishes once and waits for the
//! broker to acknowledge at the requested QoS.

use super::{SendError, SendReport};
use crate::broker::{BrokerError, BrokerSettings};
use crate::db::MqttTarget;
use crate::secrets::SecretStore;

use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const CLIENT_PREFIX: &str = "uplink-relay-target";

impl From<BrokerError> for SendError {
    fn from(e: BrokerError) -> Self {
        SendError::Config(e.to_string())
    }
}

pub struct MqttSender {
    secrets: Arc<dyn SecretStore>,
}

impl MqttSender {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    pub async fn send(&self, target: &MqttTarget, payload: &Value) -> Result<SendReport, SendError> {
        let qos = qos_from_level(target.qos)?;
        let body = serde_json::to_vec(payload)
            .map_err(|e| SendError::Config(format!("payload is not serializable: {}", e)))?;
        let (client, mut eventloop) = self.connect(target)?;

        client
            .publish(target.topic.clone(), qos, false, body)
            .await
            .map_err(|e| SendError::Mqtt(e.to_string()))?;

        let acked = tokio::time::timeout(target.timeout, wait_for_ack(&mut eventloop, qos)).await;
        let _ = client.disconnect().await;

        match acked {
            Ok(Ok(())) => {
                tracing::debug!(topic = %target.topic, "MQTT target publish acknowledged");
                Ok(SendReport::default())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SendError::Timeout(target.timeout)),
        }
    }

    /// Connect with the target's settings and wait for the broker's ConnAck.
    pub async fn test_connection(&self, target: &MqttTarget) -> Result<(), SendError> {
        let (client, mut eventloop) = self.connect(target)?;

        let connected = tokio::time::timeout(target.timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(SendError::Mqtt(e.to_string())),
                }
            }
        })
        .await;
        let _ = client.disconnect().await;

        match connected {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(target.timeout)),
        }
    }

    fn connect(&self, target: &MqttTarget) -> Result<(AsyncClient, EventLoop), SendError> {
        let settings = self.settings(target)?;
        let options = settings.options(CLIENT_PREFIX)?;
        Ok(AsyncClient::new(options, 10))
    }

    fn settings(&self, target: &MqttTarget) -> Result<BrokerSettings, SendError> {
        Ok(BrokerSettings {
            url: target.url.clone(),
            port: target.port,
            username: target.username.clone(),
            password: self.secrets.reveal_opt(target.password.as_deref())?,
            ..BrokerSettings::default()
        })
    }
}

async fn wait_for_ack(eventloop: &mut EventLoop, qos: QoS) -> Result<(), SendError> {
    loop {
        let event = eventloop
            .poll()
            .await
            .map_err(|e| SendError::Mqtt(e.to_string()))?;
        match (qos, event) {
            (QoS::AtMostOnce, Event::Outgoing(Outgoing::Publish(_))) => return Ok(()),
            (QoS::AtLeastOnce, Event::Incoming(Packet::PubAck(_))) => return Ok(()),
            (QoS::ExactlyOnce, Event::Incoming(Packet::PubComp(_))) => return Ok(()),
            _ => {}
        }
    }
}

fn qos_from_level(level: u8) -> Result<QoS, SendError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(SendError::Config(format!("invalid QoS level {}", other))),
    }
}
