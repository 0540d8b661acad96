//! Long-lived MQTT listeners for the brokers the relay itself depends on.
//!
//! Unlike external device subscriptions these reconnect forever: losing the
//! internal broker or the network server is an outage, not a device
//! misconfiguration. Sessions are persistent and publishes are acknowledged
//! only once they are on the bus, so an uplink that cannot be queued is sent
//! again by the broker after the reconnect.

use super::{accept_mqtt_uplink, IngestError, IngestService, MqttDisposition, INTERNAL_TOPIC_PREFIX};
use crate::broker::BrokerSettings;

use rumqttc::{AsyncClient, Event, Packet, QoS};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemListener {
    /// Devices publishing to `devices/<deviceId>` on the internal broker.
    InternalBroker,
    /// LoRaWAN network server uplink events.
    Lorawan,
}

impl SystemListener {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::InternalBroker => "devices/#",
            Self::Lorawan => "application/+/device/+/event/up",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::InternalBroker => "internal-broker",
            Self::Lorawan => "lorawan",
        }
    }

    /// Stable so the broker can resume the session.
    pub fn client_id(&self) -> String {
        format!("uplink-relay-{}", self.name())
    }

    fn handle(&self, service: &IngestService, topic: &str, payload: &[u8]) -> Result<(), IngestError> {
        match self {
            Self::InternalBroker if topic.starts_with(INTERNAL_TOPIC_PREFIX) => {
                service.receive_internal_mqtt(topic, payload)?;
            }
            Self::InternalBroker => tracing::warn!(topic, "Unknown MQTT topic"),
            Self::Lorawan => {
                service.receive_lorawan(payload)?;
            }
        }
        Ok(())
    }
}

/// Spawn `listener` against the broker in `settings`. Runs until `stop_rx`
/// fires, reconnecting after `retry_delay` on every connection error.
pub fn spawn_system_listener(
    listener: SystemListener,
    settings: BrokerSettings,
    service: IngestService,
    retry_delay: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(listener = listener.name(), url = %settings.url, "Starting MQTT listener");
        let mut attempt: u32 = 0;

        loop {
            match run_connection(listener, &settings, &service, &mut stop_rx).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    tracing::error!(
                        listener = listener.name(),
                        attempt,
                        "MQTT connection error: {}",
                        e
                    );
                }
            }

            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = tokio::time::sleep(retry_delay) => {}
            }
        }

        tracing::info!(listener = listener.name(), "MQTT listener stopped");
    })
}

async fn run_connection(
    listener: SystemListener,
    settings: &BrokerSettings,
    service: &IngestService,
    stop_rx: &mut broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let options = settings.session_options(&listener.client_id())?;
    let (client, mut eventloop) = AsyncClient::new(options, 100);
    client.subscribe(listener.topic(), QoS::AtLeastOnce).await?;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                let _ = client.disconnect().await;
                return Ok(());
            }
            event = eventloop.poll() => match event? {
                Event::Incoming(Packet::Publish(publish)) => {
                    let disposition =
                        accept_mqtt_uplink(|| listener.handle(service, &publish.topic, &publish.payload)).await;
                    match disposition {
                        MqttDisposition::Accepted => {}
                        MqttDisposition::Rejected(e) => {
                            tracing::warn!(topic = %publish.topic, "Dropping MQTT uplink: {}", e);
                        }
                        MqttDisposition::Unavailable(e) => {
                            // Reconnect without acking; the broker resends it.
                            tracing::error!(topic = %publish.topic, "Failed to accept MQTT uplink: {}", e);
                            return Err(e.into());
                        }
                    }
                    client.ack(&publish).await?;
                }
                Event::Incoming(Packet::ConnAck(_)) => {
                    tracing::info!(listener = listener.name(), "Connected to MQTT broker");
                }
                Event::Incoming(Packet::SubAck(_)) => {
                    tracing::debug!(listener = listener.name(), topic = listener.topic(), "Subscribed");
                }
                _ => {}
            },
        }
    }
}
