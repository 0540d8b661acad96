//! HTTP push sender.

use super::{authorize, map_reqwest_error, OAuthTokenProvider, SendError, SendReport};
use crate::db::HttpAuth;
use crate::secrets::SecretStore;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// POSTs the payload as JSON to the target URL.
pub struct HttpPushSender {
    client: reqwest::Client,
    secrets: Arc<dyn SecretStore>,
    tokens: Arc<OAuthTokenProvider>,
}

impl HttpPushSender {
    pub fn new(secrets: Arc<dyn SecretStore>, tokens: Arc<OAuthTokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            secrets,
            tokens,
        }
    }

    /// Any HTTP response counts as delivered; a non-2xx status is only
    /// logged. Transport failures and timeouts are errors.
    pub async fn send(
        &self,
        url: &str,
        timeout: Duration,
        auth: &HttpAuth,
        payload: &Value,
    ) -> Result<SendReport, SendError> {
        let request = self.client.post(url).timeout(timeout).json(payload);
        let request = authorize(request, auth, self.secrets.as_ref(), &self.tokens, timeout).await?;

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        let status = response.status();

        if !status.is_success() {
            tracing::warn!(url, status = status.as_u16(), "HTTP push target answered non-2xx");
        } else {
            tracing::debug!(url, status = status.as_u16(), "HTTP push delivered");
        }

        Ok(SendReport {
            status_code: Some(status.as_u16()),
            message: (!status.is_success()).then(|| format!("target answered {}", status)),
        })
    }
}
