//! One MQTT client per external-broker device.
//!
//! A client that loses its connection marks the device's MQTT configuration
//! invalid and is torn down; it is not reconnected until the registry is
//! asked to start it again.
//!
//! Clients keep a broker session per device and acknowledge a publish only
//! after it is on the bus. When the bus stays unavailable through every
//! retry the client is restarted without acking, so the broker resends the
//! message on the resumed session.

use super::{accept_mqtt_uplink, IngestService, MqttDisposition};
use crate::broker::BrokerSettings;
use crate::db::{Device, DbError, MqttSubscription, Store};
use crate::secrets::{SecretError, SecretStore};

use rumqttc::{AsyncClient, Event, Packet, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// Why a client ended.
enum ClientExit {
    Stopped,
    Failed(String),
    /// Uplinks could not be queued; reconnect later without flagging the device.
    Unavailable(String),
}

/// Wait before restarting a client whose uplinks could not be queued.
const UNAVAILABLE_RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ExternalMqttRegistry {
    service: IngestService,
    secrets: Arc<dyn SecretStore>,
    clients: Arc<RwLock<HashMap<i64, broadcast::Sender<()>>>>,
}

impl ExternalMqttRegistry {
    pub fn new(service: IngestService, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            service,
            secrets,
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn store(&self) -> &Arc<Store> {
        self.service.store()
    }

    /// Start clients for every external-broker device with a valid
    /// configuration. Safe to call repeatedly.
    pub async fn start(&self) -> Result<usize, DbError> {
        let devices = self.store().list_external_mqtt_devices()?;
        let started = self.create_clients(devices).await;
        tracing::info!(started, "External MQTT clients started");
        Ok(started)
    }

    /// Start a client for each device that does not already have one.
    /// Returns how many were started.
    pub async fn create_clients(&self, devices: Vec<Device>) -> usize {
        let mut started = 0;
        for device in devices {
            if self.add_device(device).await {
                started += 1;
            }
        }
        started
    }

    /// Insert-if-absent. Returns false when the device already has a client or
    /// its configuration cannot be turned into one.
    pub async fn add_device(&self, device: Device) -> bool {
        let mut clients = self.clients.write().await;
        if clients.contains_key(&device.id) {
            return false;
        }

        let Some(subscription) = device.kind.subscription().cloned() else {
            tracing::warn!(device_id = device.id, "Device is not an external MQTT device");
            return false;
        };

        let settings = match self.settings(&subscription) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::error!(device_id = device.id, "Cannot reveal MQTT credentials: {}", e);
                self.mark_invalid(device.id);
                return false;
            }
        };
        let options = match settings.session_options(&format!("uplink-relay-device-{}", device.id)) {
            Ok(options) => options,
            Err(e) => {
                tracing::error!(device_id = device.id, "Invalid MQTT configuration: {}", e);
                self.mark_invalid(device.id);
                return false;
            }
        };

        let (stop_tx, _) = broadcast::channel(1);
        clients.insert(device.id, stop_tx.clone());
        drop(clients);

        tracing::info!(device_id = device.id, url = %subscription.url, topic = %subscription.topic, "Starting external MQTT client");

        let registry = self.clone();
        let mut stop_rx = stop_tx.subscribe();
        tokio::spawn(async move {
            let exit = loop {
                let (client, eventloop) = AsyncClient::new(options.clone(), 100);
                match registry
                    .run_client(&device, &subscription.topic, client, eventloop, &mut stop_rx)
                    .await
                {
                    ClientExit::Unavailable(reason) => {
                        tracing::error!(
                            device_id = device.id,
                            "Restarting external MQTT client after uplinks could not be queued: {}",
                            reason
                        );
                        tokio::select! {
                            _ = stop_rx.recv() => break ClientExit::Stopped,
                            _ = tokio::time::sleep(UNAVAILABLE_RESTART_DELAY) => {}
                        }
                    }
                    exit => break exit,
                }
            };

            let mut clients = registry.clients.write().await;
            if clients.get(&device.id).is_some_and(|tx| tx.same_channel(&stop_tx)) {
                clients.remove(&device.id);
            }
            drop(clients);

            if let ClientExit::Failed(reason) = exit {
                tracing::warn!(device_id = device.id, "External MQTT client ended: {}", reason);
                registry.mark_invalid(device.id);
            }
        });

        true
    }

    /// Stop and forget a device's client.
    pub async fn remove_device(&self, device_id: i64) -> bool {
        let mut clients = self.clients.write().await;
        match clients.remove(&device_id) {
            Some(stop_tx) => {
                let _ = stop_tx.send(());
                tracing::debug!(device_id, "Removed external MQTT client");
                true
            }
            None => false,
        }
    }

    pub async fn active_devices(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.clients.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn shutdown(&self) {
        let mut clients = self.clients.write().await;
        for (_, stop_tx) in clients.drain() {
            let _ = stop_tx.send(());
        }
    }

    fn settings(&self, sub: &MqttSubscription) -> Result<BrokerSettings, SecretError> {
        Ok(BrokerSettings {
            url: sub.url.clone(),
            port: Some(sub.port),
            username: sub.username.clone(),
            password: self.secrets.reveal_opt(sub.password.as_deref())?,
            ca_certificate: sub.ca_certificate.clone(),
            client_certificate: sub.device_certificate.clone(),
            client_key: self.secrets.reveal_opt(sub.device_certificate_key.as_deref())?,
        })
    }

    fn mark_invalid(&self, device_id: i64) {
        if let Err(e) = self.store().mark_mqtt_config_invalid(device_id) {
            tracing::error!(device_id, "Failed to flag MQTT configuration: {}", e);
        }
    }

    async fn run_client(
        &self,
        device: &Device,
        topic: &str,
        client: AsyncClient,
        mut eventloop: rumqttc::EventLoop,
        stop_rx: &mut broadcast::Receiver<()>,
    ) -> ClientExit {
        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
            return ClientExit::Failed(e.to_string());
        }

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    let _ = client.disconnect().await;
                    return ClientExit::Stopped;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let disposition = accept_mqtt_uplink(|| {
                            self.service.receive_subscribed(device, &publish.payload).map(|_| ())
                        })
                        .await;
                        if let MqttDisposition::Unavailable(e) = disposition {
                            let _ = client.disconnect().await;
                            return ClientExit::Unavailable(e.to_string());
                        }
                        if let Err(e) = client.ack(&publish).await {
                            return ClientExit::Failed(e.to_string());
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::debug!(device_id = device.id, "Connected to external broker");
                    }
                    Ok(_) => {}
                    Err(e) => return ClientExit::Failed(e.to_string()),
                },
            }
        }
    }
}
