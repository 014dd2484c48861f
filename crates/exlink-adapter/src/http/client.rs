/*
[INPUT]:  HTTP configuration (base URL, timeouts), API credentials, signer, nonce authority
[OUTPUT]: Signed private REST calls decoded from the exchange envelope
[POS]:    HTTP layer - core client implementation
[UPDATE]: When adding connection options or changing client behavior
*/

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::auth::NonceAuthority;
use crate::http::{ExchangeError, RequestSigner, Result};
use crate::types::ApiEnvelope;

const DEFAULT_REST_URL: &str = "https://api.kraken.com";

/// HTTP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub rest_url: String,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rest_url: DEFAULT_REST_URL.to_string(),
            timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Credentials for private requests. The secret never enters this crate.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    /// Nonce namespace; one counter per key id.
    pub key_id: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// Private REST client.
pub struct ExchangeClient {
    http_client: Client,
    base_url: Url,
    config: ClientConfig,
    credentials: Credentials,
    signer: Arc<dyn RequestSigner>,
    nonces: Arc<NonceAuthority>,
}

impl fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("base_url", &self.base_url.as_str())
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl ExchangeClient {
    pub fn new(
        config: ClientConfig,
        credentials: Credentials,
        signer: Arc<dyn RequestSigner>,
        nonces: Arc<NonceAuthority>,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()?;
        let base_url = Url::parse(&config.rest_url)?;

        Ok(Self {
            http_client,
            base_url,
            config,
            credentials,
            signer,
            nonces,
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn nonces(&self) -> &Arc<NonceAuthority> {
        &self.nonces
    }

    /// POST a private method. A rejected nonce is repaired and retried once.
    pub(crate) async fn private_post<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T> {
        match self.private_post_once(method, &params).await {
            Err(ExchangeError::InvalidNonce) => {
                warn!(method, "nonce rejected, recovering and retrying once");
                self.nonces
                    .recover_from_error(&self.credentials.key_id)
                    .await?;
                self.private_post_once(method, &params).await
            }
            other => other,
        }
    }

    async fn private_post_once<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<T> {
        let path = format!("/0/private/{method}");
        let mut body = match params {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(ExchangeError::Config(format!(
                    "params for {method} must be an object, got {other}"
                )));
            }
        };

        let nonce = self.nonces.issue(&self.credentials.key_id).await?;
        body.insert("nonce".to_string(), Value::from(nonce));
        let body = serde_json::to_string(&Value::Object(body))?;
        let signature = self.signer.sign(&path, nonce, &body).await?;

        let url = self.base_url.join(&path)?;
        debug!(method, nonce, "private REST call");
        let builder = self
            .http_client
            .post(url)
            .header("API-Key", &self.credentials.api_key)
            .header("API-Nonce", nonce.to_string())
            .header("API-Sign", signature)
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        self.send_envelope(builder).await
    }

    async fn send_envelope<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await.map_err(|err| self.map_transport(err))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok())
                .unwrap_or(1);
            return Err(ExchangeError::RateLimit { retry_after });
        }

        let text = response.text().await.map_err(|err| self.map_transport(err))?;

        if status.is_server_error() {
            return Err(ExchangeError::Unavailable(format!(
                "HTTP {status}: {}",
                truncate(&text, 200)
            )));
        }

        match serde_json::from_str::<ApiEnvelope<T>>(&text) {
            Ok(envelope) => envelope.into_result(),
            Err(_) if !status.is_success() => {
                Err(ExchangeError::api_error(status, truncate(&text, 200)))
            }
            Err(err) => Err(ExchangeError::InvalidResponse(format!(
                "undecodable envelope: {err}"
            ))),
        }
    }

    fn map_transport(&self, err: reqwest::Error) -> ExchangeError {
        if err.is_timeout() {
            ExchangeError::Timeout {
                duration_ms: self.config.timeout_ms,
            }
        } else {
            ExchangeError::Http(err)
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
