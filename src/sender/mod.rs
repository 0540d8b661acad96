//! Data target senders.
//!
//! Each target type has its own delivery strategy. A send either returns a
//! [`SendReport`] or a [`SendError`]; nothing escapes as a panic or an
//! unhandled error, so sibling sends are never affected.

mod fiware;
mod http;
mod mqtt;
mod oauth;

pub use fiware::*;
pub use http::*;
pub use mqtt::*;
pub use oauth::*;

use crate::db::{DataTarget, DataTargetKind, DataTargetType, HttpAuth};
use crate::secrets::{SecretError, SecretStore};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Send error types.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("credentials unavailable: {0}")]
    Secret(#[from] SecretError),
    #[error("mqtt error: {0}")]
    Mqtt(String),
    #[error("{} targets are not pushed to", .0.as_str())]
    Unsupported(DataTargetType),
}

/// A completed send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendReport {
    /// HTTP status of the response, when there was one.
    pub status_code: Option<u16>,
    pub message: Option<String>,
}

/// Seam between the dispatcher and the concrete senders.
#[async_trait]
pub trait DataTargetSender: Send + Sync {
    async fn send(&self, target: &DataTarget, payload: &Value) -> Result<SendReport, SendError>;
}

/// Routes each target to the sender for its type.
pub struct Senders {
    http: HttpPushSender,
    fiware: FiwareSender,
    mqtt: MqttSender,
}

impl Senders {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        let tokens = Arc::new(OAuthTokenProvider::new());
        Self {
            http: HttpPushSender::new(secrets.clone(), tokens.clone()),
            fiware: FiwareSender::new(secrets.clone(), tokens),
            mqtt: MqttSender::new(secrets),
        }
    }

    pub fn mqtt(&self) -> &MqttSender {
        &self.mqtt
    }
}

#[async_trait]
impl DataTargetSender for Senders {
    async fn send(&self, target: &DataTarget, payload: &Value) -> Result<SendReport, SendError> {
        match &target.kind {
            DataTargetKind::HttpPush { url, timeout, auth } => {
                self.http.send(url, *timeout, auth, payload).await
            }
            DataTargetKind::Fiware {
                url,
                timeout,
                auth,
                tenant,
                context,
            } => {
                let options = FiwareOptions {
                    tenant: tenant.as_deref(),
                    context: context.as_deref(),
                };
                self.fiware.send(url, *timeout, auth, &options, payload).await
            }
            DataTargetKind::Mqtt(config) => self.mqtt.send(config, payload).await,
            DataTargetKind::OpenDataDk => Err(SendError::Unsupported(DataTargetType::OpenDataDk)),
        }
    }
}

/// Map a reqwest error the same way for every HTTP based sender.
pub(crate) fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> SendError {
    if e.is_timeout() {
        SendError::Timeout(timeout)
    } else {
        SendError::Network(e.to_string())
    }
}

/// Apply the target's authorization to a request, revealing sealed secrets.
pub(crate) async fn authorize(
    request: reqwest::RequestBuilder,
    auth: &HttpAuth,
    secrets: &dyn SecretStore,
    tokens: &OAuthTokenProvider,
    timeout: Duration,
) -> Result<reqwest::RequestBuilder, SendError> {
    Ok(match auth {
        HttpAuth::None => request,
        HttpAuth::Basic { username, password } => {
            let password = secrets.reveal_opt(password.as_deref())?;
            request.basic_auth(username, password)
        }
        HttpAuth::Header { value } => request.header(reqwest::header::AUTHORIZATION, value),
        HttpAuth::OAuth2 {
            client_id,
            client_secret,
            token_endpoint,
        } => {
            let client_secret = secrets
                .reveal_opt(client_secret.as_deref())?
                .unwrap_or_default();
            let token = tokens
                .token(client_id, &client_secret, token_endpoint, timeout)
                .await?;
            request.bearer_auth(token)
        }
    })
}
