//! FIWARE NGSI-LD sender. Payloads are upserted as entities.

use super::{authorize, map_reqwest_error, OAuthTokenProvider, SendError, SendReport};
use crate::db::HttpAuth;
use crate::secrets::SecretStore;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, LINK};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const UPSERT_PATH: &str = "/ngsi-ld/v1/entityOperations/upsert/";

#[derive(Debug, Default, Clone, Copy)]
pub struct FiwareOptions<'a> {
    pub tenant: Option<&'a str>,
    /// JSON-LD `@context` URL, sent as a `Link` header.
    pub context: Option<&'a str>,
}

pub struct FiwareSender {
    client: reqwest::Client,
    secrets: Arc<dyn SecretStore>,
    tokens: Arc<OAuthTokenProvider>,
}

impl FiwareSender {
    pub fn new(secrets: Arc<dyn SecretStore>, tokens: Arc<OAuthTokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            secrets,
            tokens,
        }
    }

    pub async fn send(
        &self,
        url: &str,
        timeout: Duration,
        auth: &HttpAuth,
        options: &FiwareOptions<'_>,
        payload: &Value,
    ) -> Result<SendReport, SendError> {
        let endpoint = format!("{}{}", url.trim_end_matches('/'), UPSERT_PATH);
        let body = serde_json::to_vec(payload)
            .map_err(|e| SendError::Config(format!("payload is not serializable: {}", e)))?;

        let request = self
            .client
            .post(&endpoint)
            .timeout(timeout)
            .headers(ngsi_headers(options)?)
            .body(body);
        let request = authorize(request, auth, self.secrets.as_ref(), &self.tokens, timeout).await?;

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        let status = response.status();

        if !status.is_success() {
            tracing::warn!(endpoint = %endpoint, status = status.as_u16(), "FIWARE broker answered non-2xx");
        }

        Ok(SendReport {
            status_code: Some(status.as_u16()),
            message: (!status.is_success()).then(|| format!("broker answered {}", status)),
        })
    }
}

/// With a context the body is plain JSON plus a `Link` header; without one
/// the body itself is JSON-LD.
fn ngsi_headers(options: &FiwareOptions<'_>) -> Result<HeaderMap, SendError> {
    let invalid = |what: &str| SendError::Config(format!("invalid FIWARE {}", what));
    let mut headers = HeaderMap::new();

    match options.context {
        Some(context) => {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            let link = format!(
                "<{}>; rel=\"http://www.w3.org/ns/json-ld#context\"; type=\"application/ld+json\"",
                context
            );
            headers.insert(
                LINK,
                HeaderValue::from_str(&link).map_err(|_| invalid("context"))?,
            );
        }
        None => {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/ld+json"));
        }
    }

    if let Some(tenant) = options.tenant {
        headers.insert(
            "ngsild-tenant",
            HeaderValue::from_str(tenant).map_err(|_| invalid("tenant"))?,
        );
    }

    Ok(headers)
}
