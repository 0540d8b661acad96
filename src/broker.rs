//! MQTT connection options shared by the ingestion listeners and the MQTT
//! data target sender.

use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const MAX_PACKET_BYTES: usize = 256 * 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("invalid broker url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid TLS settings: {0}")]
    Tls(String),
}

/// Host, port and transport parsed out of a broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Accepts `mqtt://`, `tcp://`, `mqtts://`, `ssl://` and bare hosts. An
    /// explicit `port` wins over one embedded in the URL.
    pub fn parse(url: &str, port: Option<u16>) -> Result<Self, BrokerError> {
        let invalid = |reason: &str| BrokerError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (tls, rest) = match url.split_once("://") {
            Some(("mqtt" | "tcp", rest)) => (false, rest),
            Some(("mqtts" | "ssl" | "tls", rest)) => (true, rest),
            Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme {}", scheme))),
            None => (false, url),
        };
        let rest = rest.trim_end_matches('/');

        let (host, url_port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                (host, Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() || host.contains('/') {
            return Err(invalid("missing host"));
        }

        let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
        Ok(Self {
            host: host.to_string(),
            port: port.or(url_port).unwrap_or(default_port),
            tls,
        })
    }
}

/// Everything needed to open a broker connection. Secrets are already revealed.
#[derive(Debug, Clone, Default)]
pub struct BrokerSettings {
    pub url: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_certificate: Option<String>,
    pub client_certificate: Option<String>,
    pub client_key: Option<String>,
}

impl BrokerSettings {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn endpoint(&self) -> Result<BrokerEndpoint, BrokerError> {
        BrokerEndpoint::parse(&self.url, self.port)
    }

    /// Build rumqttc options with a fresh client id under `client_prefix`.
    pub fn options(&self, client_prefix: &str) -> Result<MqttOptions, BrokerError> {
        self.build(client_id(client_prefix))
    }

    /// Options for a subscriber that acknowledges publishes itself. The broker
    /// keeps the session under `client_id`, so QoS 1 messages left
    /// unacknowledged are sent again after a reconnect.
    pub fn session_options(&self, client_id: &str) -> Result<MqttOptions, BrokerError> {
        let mut options = self.build(client_id.to_string())?;
        options.set_clean_session(false);
        options.set_manual_acks(true);
        Ok(options)
    }

    fn build(&self, client_id: String) -> Result<MqttOptions, BrokerError> {
        let endpoint = self.endpoint()?;
        let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_BYTES, MAX_PACKET_BYTES);

        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }

        if let Some(tls) = self.tls_configuration(endpoint.tls)? {
            options.set_transport(Transport::Tls(tls));
        }

        Ok(options)
    }

    fn tls_configuration(&self, url_wants_tls: bool) -> Result<Option<TlsConfiguration>, BrokerError> {
        let client_auth = match (&self.client_certificate, &self.client_key) {
            (Some(cert), Some(key)) => Some((cert.as_bytes().to_vec(), key.as_bytes().to_vec())),
            (Some(_), None) => {
                return Err(BrokerError::Tls("client certificate without a private key".to_string()))
            }
            (None, Some(_)) => {
                return Err(BrokerError::Tls("private key without a client certificate".to_string()))
            }
            (None, None) => None,
        };

        match (&self.ca_certificate, client_auth) {
            (Some(ca), client_auth) => Ok(Some(TlsConfiguration::Simple {
                ca: ca.as_bytes().to_vec(),
                alpn: None,
                client_auth,
            })),
            (None, Some(_)) => Err(BrokerError::Tls(
                "client certificates need a CA certificate".to_string(),
            )),
            (None, None) if url_wants_tls => Ok(Some(TlsConfiguration::default())),
            (None, None) => Ok(None),
        }
    }
}

fn client_id(prefix: &str) -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &short[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_urls() {
        assert_eq!(
            BrokerEndpoint::parse("mqtt://broker.local:1884", None).unwrap(),
            BrokerEndpoint {
                host: "broker.local".to_string(),
                port: 1884,
                tls: false
            }
        );
        assert_eq!(BrokerEndpoint::parse("tcp://10.0.0.1", None).unwrap().port, 1883);
        assert_eq!(BrokerEndpoint::parse("localhost", None).unwrap().host, "localhost");
    }

    #[test]
    fn test_parse_tls_urls_and_port_override() {
        let endpoint = BrokerEndpoint::parse("mqtts://secure.example/", None).unwrap();
        assert!(endpoint.tls);
        assert_eq!(endpoint.port, 8883);

        let endpoint = BrokerEndpoint::parse("ssl://secure.example:9000", Some(443)).unwrap();
        assert_eq!(endpoint.port, 443);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(BrokerEndpoint::parse("http://example.com", None).is_err());
        assert!(BrokerEndpoint::parse("mqtt://host:notaport", None).is_err());
        assert!(BrokerEndpoint::parse("mqtt://:1883", None).is_err());
    }

    #[test]
    fn test_options_carry_credentials() {
        let settings = BrokerSettings {
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            ..BrokerSettings::with_url("mqtt://broker.local")
        };
        let options = settings.options("uplink-relay").unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(
            options.credentials(),
            Some(("user".to_string(), "pass".to_string()))
        );
        assert!(options.client_id().starts_with("uplink-relay-"));
    }

    #[test]
    fn test_session_options_keep_the_session() {
        let options = BrokerSettings::with_url("mqtt://broker.local")
            .session_options("uplink-relay-lorawan")
            .unwrap();
        assert_eq!(options.client_id(), "uplink-relay-lorawan");
        assert!(!options.clean_session());
        assert!(options.manual_acks());

        let options = BrokerSettings::with_url("mqtt://broker.local").options("x").unwrap();
        assert!(options.clean_session());
        assert!(!options.manual_acks());
    }

    #[test]
    fn test_client_cert_needs_key_and_ca() {
        let settings = BrokerSettings {
            client_certificate: Some("cert".to_string()),
            ..BrokerSettings::with_url("mqtts://broker.local")
        };
        assert!(matches!(settings.options("x"), Err(BrokerError::Tls(_))));

        let settings = BrokerSettings {
            client_certificate: Some("cert".to_string()),
            client_key: Some("key".to_string()),
            ..BrokerSettings::with_url("mqtts://broker.local")
        };
        assert!(matches!(settings.options("x"), Err(BrokerError::Tls(_))));

        let settings = BrokerSettings {
            ca_certificate: Some("ca".to_string()),
            client_certificate: Some("cert".to_string()),
            client_key: Some("key".to_string()),
            ..BrokerSettings::with_url("mqtt://broker.local")
        };
        assert!(settings.options("x").is_ok());
    }
}
