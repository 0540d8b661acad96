//! uplink-relay - IoT uplink ingestion, decoding and delivery service.
//!
//! Devices push uplinks over HTTP, SigFox callbacks or MQTT. Each uplink is
//! queued on a durable bus, decoded by tenant-authored decoders and fanned
//! out to the data targets its device is connected to.

mod broker;
mod bus;
mod config;
mod db;
mod decoder;
mod envelope;
mod ingest;
mod pipeline;
mod scheduler;
mod secrets;
mod sender;
mod web;

use bus::Bus;
use config::ServerConfig;
use db::{Fixtures, Store};
use decoder::PayloadDecoderExecutor;
use envelope::Topic;
use ingest::{spawn_system_listener, ExternalMqttRegistry, IngestService, SystemListener};
use pipeline::{
    DecoderListener, Dispatcher, OutcomeRecorder, TargetResolver, DECODER_GROUP, DISPATCH_GROUP,
};
use scheduler::RetentionManager;
use secrets::{AesGcmSecretStore, SecretStore};
use sender::Senders;
use web::Server;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for started data target sends.
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uplink_relay=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load()?;
    tracing::info!("Starting uplink-relay on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let secrets: Arc<dyn SecretStore> = Arc::new(AesGcmSecretStore::from_base64_key(&cfg.secret_key)?);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    if let Some(path) = &cfg.seed_file {
        let fixtures = Fixtures::from_file(path)?;
        let ids = store.load_fixtures(&fixtures, secrets.as_ref())?;
        tracing::info!(
            path = %path,
            devices = ids.devices.len(),
            data_targets = ids.data_targets.len(),
            "Loaded fixtures"
        );
    }

    // Pipeline
    let bus = Bus::new(store.clone(), cfg.bus.clone());
    let executor = PayloadDecoderExecutor::new(cfg.decoder.clone());
    let senders = Arc::new(Senders::new(secrets.clone()));

    let listener = DecoderListener::new(store.clone(), bus.clone(), executor.clone());
    bus.subscribe(Topic::RawRequest, DECODER_GROUP, Arc::new(listener))
        .await?;

    let dispatcher = Arc::new(Dispatcher::new(
        TargetResolver::new(store.clone()),
        senders.clone(),
        OutcomeRecorder::new(store.clone(), cfg.delivery_log_max_events),
    ));
    bus.subscribe(Topic::TransformedRequest, DISPATCH_GROUP, dispatcher.clone())
        .await?;

    // MQTT ingestion
    let ingest = IngestService::new(store.clone(), bus.clone());
    let registry = ExternalMqttRegistry::new(ingest.clone(), secrets.clone());
    registry.start().await?;

    let (listeners_stop, _) = broadcast::channel(1);
    let mut listener_tasks = Vec::new();
    for (listener, settings) in [
        (SystemListener::InternalBroker, cfg.internal_mqtt.clone()),
        (SystemListener::Lorawan, cfg.lorawan_mqtt.clone()),
    ] {
        if let Some(settings) = settings {
            listener_tasks.push(spawn_system_listener(
                listener,
                settings,
                ingest.clone(),
                cfg.mqtt_retry_delay,
                listeners_stop.subscribe(),
            ));
        }
    }

    // Maintenance
    let retention = RetentionManager::new(store.clone(), cfg.bus_retention);
    retention.start();

    // Start web server
    let server = Server::new(cfg, store, bus.clone(), executor, senders);
    let result = server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await;

    let _ = listeners_stop.send(());
    for task in listener_tasks {
        let _ = task.await;
    }
    registry.shutdown().await;
    retention.stop();
    bus.shutdown();
    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, dispatcher.wait_idle()).await.is_err() {
        tracing::warn!(in_flight = dispatcher.in_flight(), "Stopping with data target sends still in flight");
    }
    tracing::info!("uplink-relay stopped");

    result
}
