//! Configuration module for uplink-relay.
//!
//! Loads configuration from `UPLINK_*` environment variables. Anything the
//! relay cannot run without is checked here so startup fails fast.

use crate::broker::BrokerSettings;
use crate::bus::BusConfig;
use crate::decoder::DecoderLimits;

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uplink-relay.db")
    pub db_path: String,
    /// Base64 AES-256 key for sealed credentials. Required.
    pub secret_key: String,
    /// Optional JSON fixtures loaded at startup.
    pub seed_file: Option<String>,
    pub bus: BusConfig,
    /// Consumed bus messages older than this are purged.
    pub bus_retention: Duration,
    pub decoder: DecoderLimits,
    /// Delivery log entries kept per data target, 0 for unlimited.
    pub delivery_log_max_events: usize,
    pub internal_mqtt: Option<BrokerSettings>,
    pub lorawan_mqtt: Option<BrokerSettings>,
    pub mqtt_retry_delay: Duration,
    /// Mounts the `/kafka/*` bus injection endpoints.
    pub diagnostic_routes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "uplink-relay.db".to_string(),
            secret_key: String::new(),
            seed_file: None,
            bus: BusConfig::default(),
            bus_retention: Duration::from_secs(7 * 24 * 3600),
            decoder: DecoderLimits::default(),
            delivery_log_max_events: 50,
            internal_mqtt: None,
            lorawan_mqtt: None,
            mqtt_retry_delay: Duration::from_millis(5000),
            diagnostic_routes: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        parse_into(&get, "UPLINK_HTTP_PORT", &mut cfg.http_port)?;
        if let Some(path) = get("UPLINK_DB_PATH") {
            cfg.db_path = path;
        }
        cfg.secret_key = get("UPLINK_SECRET_KEY").ok_or(ConfigError::Missing("UPLINK_SECRET_KEY"))?;
        cfg.seed_file = get("UPLINK_SEED_FILE");

        parse_into(&get, "UPLINK_BUS_PARTITIONS", &mut cfg.bus.partitions)?;
        if cfg.bus.partitions == 0 {
            return Err(ConfigError::Invalid {
                var: "UPLINK_BUS_PARTITIONS",
                value: "0".to_string(),
                reason: "at least one partition is required".to_string(),
            });
        }
        parse_millis(&get, "UPLINK_BUS_POLL_INTERVAL_MS", &mut cfg.bus.poll_interval)?;
        parse_into(&get, "UPLINK_BUS_MAX_DELIVERIES", &mut cfg.bus.max_deliveries)?;
        let mut retention_secs = cfg.bus_retention.as_secs();
        parse_into(&get, "UPLINK_BUS_RETENTION_SECS", &mut retention_secs)?;
        cfg.bus_retention = Duration::from_secs(retention_secs);

        parse_millis(&get, "UPLINK_DECODER_TIMEOUT_MS", &mut cfg.decoder.timeout)?;
        parse_into(&get, "UPLINK_DECODER_MAX_SOURCE_BYTES", &mut cfg.decoder.max_source_bytes)?;
        parse_into(&get, "UPLINK_DECODER_MAX_INPUT_BYTES", &mut cfg.decoder.max_input_bytes)?;
        parse_into(&get, "UPLINK_DECODER_MAX_OUTPUT_BYTES", &mut cfg.decoder.max_output_bytes)?;
        parse_into(&get, "UPLINK_DECODER_MAX_CONCURRENCY", &mut cfg.decoder.max_concurrency)?;
        parse_into(&get, "UPLINK_DECODER_MAX_STEPS", &mut cfg.decoder.max_steps)?;

        parse_into(&get, "UPLINK_DELIVERY_LOG_MAX_EVENTS", &mut cfg.delivery_log_max_events)?;

        cfg.internal_mqtt = get("UPLINK_INTERNAL_MQTT_URL").map(|url| BrokerSettings {
            username: get("UPLINK_INTERNAL_MQTT_USERNAME"),
            password: get("UPLINK_INTERNAL_MQTT_PASSWORD"),
            ..BrokerSettings::with_url(url)
        });
        cfg.lorawan_mqtt = get("UPLINK_LORAWAN_MQTT_URL").map(BrokerSettings::with_url);
        for (var, settings) in [
            ("UPLINK_INTERNAL_MQTT_URL", &cfg.internal_mqtt),
            ("UPLINK_LORAWAN_MQTT_URL", &cfg.lorawan_mqtt),
        ] {
            if let Some(settings) = settings {
                settings.endpoint().map_err(|e| ConfigError::Invalid {
                    var,
                    value: settings.url.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        parse_millis(&get, "UPLINK_MQTT_RETRY_DELAY_MS", &mut cfg.mqtt_retry_delay)?;

        if let Some(value) = get("UPLINK_DIAGNOSTIC_ROUTES") {
            cfg.diagnostic_routes = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "UPLINK_DIAGNOSTIC_ROUTES",
                        value,
                        reason: "expected true or false".to_string(),
                    })
                }
            };
        }

        Ok(cfg)
    }
}

fn parse_into<T, G>(get: &G, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(value) = get(var) {
        *slot = value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: value.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn parse_millis<G>(get: &G, var: &'static str, slot: &mut Duration) -> Result<(), ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let mut millis = slot.as_millis() as u64;
    parse_into(get, var, &mut millis)?;
    *slot = Duration::from_millis(millis);
    Ok(())
}
