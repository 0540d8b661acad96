//! OAuth2 client-credentials tokens for HTTP based targets.

use super::{map_reqwest_error, SendError};

use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Tokens are treated as expired this long before the endpoint says so.
const CLOCK_SKEW: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Fetches and caches tokens per (client id, client secret).
pub struct OAuthTokenProvider {
    client: reqwest::Client,
    cache: Mutex<HashMap<(String, String), CachedToken>>,
}

impl OAuthTokenProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn token(
        &self,
        client_id: &str,
        client_secret: &str,
        token_endpoint: &str,
        timeout: Duration,
    ) -> Result<String, SendError> {
        let key = (client_id.to_string(), client_secret.to_string());
        if let Some(cached) = self.cache.lock().await.get(&key) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }

        let response = self
            .client
            .post(token_endpoint)
            .timeout(timeout)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        if !response.status().is_success() {
            return Err(SendError::Auth(format!(
                "token endpoint answered {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SendError::Auth(format!("unreadable token response: {}", e)))?;

        let ttl = Duration::from_secs(body.expires_in).saturating_sub(CLOCK_SKEW);
        tracing::debug!(client_id, ttl_secs = ttl.as_secs(), "Caching OAuth2 token");

        if !ttl.is_zero() {
            self.cache.lock().await.insert(
                key,
                CachedToken {
                    token: body.access_token.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }

        Ok(body.access_token)
    }
}

impl Default for OAuthTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn token_server(expires_in: u64) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/token",
            post(move |body: String| {
                let counter = counter.clone();
                async move {
                    assert!(body.contains("grant_type=client_credentials"));
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({ "access_token": format!("tok-{}", n), "expires_in": expires_in }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}/token", addr), hits)
    }

    #[tokio::test]
    async fn test_token_is_cached_per_client() {
        let (endpoint, hits) = token_server(3600).await;
        let provider = OAuthTokenProvider::new();
        let timeout = Duration::from_secs(2);

        let a = provider.token("id", "secret", &endpoint, timeout).await.unwrap();
        let b = provider.token("id", "secret", &endpoint, timeout).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let c = provider.token("id", "other", &endpoint, timeout).await.unwrap();
        assert_ne!(a, c);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_short_lived_tokens_are_not_cached() {
        let (endpoint, hits) = token_server(10).await;
        let provider = OAuthTokenProvider::new();
        let timeout = Duration::from_secs(2);

        provider.token("id", "s", &endpoint, timeout).await.unwrap();
        provider.token("id", "s", &endpoint, timeout).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
