use crate::circuit_breaker::{create_gateway_circuit_breaker, GatewayBreaker};
use crate::config::Config;
use crate::errors::{FetchError, PipelineError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Query parameters whose values never reach the logs.
const SECRET_PARAMS: [&str; 3] = ["key", "api_key", "token"];

/// Transport policy shared by every gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Bound on a single call, not on a record or a batch.
    pub timeout: Duration,
    pub max_retries: u32,
    /// Doubles after each transient failure.
    pub initial_backoff: Duration,
    /// In-flight calls per gateway.
    pub concurrency: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            concurrency: 4,
        }
    }
}

impl From<&Config> for GatewaySettings {
    fn from(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(config.gateway_timeout_secs),
            max_retries: config.gateway_max_retries,
            initial_backoff: Duration::from_millis(config.gateway_backoff_ms),
            concurrency: config.gateway_concurrency,
        }
    }
}

/// HTTP transport for one external source: timeout, retry with backoff for
/// transient failures, a concurrency limit and a circuit breaker.
#[derive(Clone)]
pub struct HttpGateway {
    name: &'static str,
    client: reqwest::Client,
    base_url: String,
    settings: GatewaySettings,
    permits: Arc<Semaphore>,
    breaker: Arc<GatewayBreaker>,
}

impl HttpGateway {
    pub fn new(
        name: &'static str,
        base_url: &str,
        settings: GatewaySettings,
    ) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("lead-sniper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                PipelineError::Configuration(format!("Failed to create {} client: {}", name, e))
            })?;

        Ok(Self {
            name,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            permits: Arc::new(Semaphore::new(settings.concurrency.max(1))),
            settings,
            breaker: Arc::new(create_gateway_circuit_breaker()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Url, FetchError> {
        let raw = format!("{}{}", self.base_url, path);
        let url = if query.is_empty() {
            reqwest::Url::parse(&raw)
        } else {
            reqwest::Url::parse_with_params(&raw, query.iter().map(|(k, v)| (*k, v.as_str())))
        };
        url.map_err(|e| FetchError::Semantic {
            status: 0,
            message: format!("Failed to build {} URL: {}", self.name, e),
        })
    }

    /// GET returning the raw body text.
    pub async fn get_text(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<String, FetchError> {
        let url = self.url(path, query)?;
        tracing::debug!("{} GET {}", self.name, redact(&url));
        self.execute(|| self.client.get(url.clone())).await
    }

    /// GET returning a decoded JSON body.
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, FetchError> {
        let body = self.get_text(path, query).await?;
        decode(self.name, &body)
    }

    /// POST a JSON body, decoding the JSON answer.
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value, FetchError> {
        let url = self.url(path, &[])?;
        tracing::debug!("{} POST {}", self.name, redact(&url));
        let text = self.execute(|| self.client.post(url.clone()).json(body)).await?;
        decode(self.name, &text)
    }

    async fn execute<F>(&self, build: F) -> Result<String, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        if !self.breaker.is_call_permitted() {
            tracing::warn!("⚠️ Circuit open for {}, skipping call", self.name);
            return Err(FetchError::CircuitOpen(self.name.to_string()));
        }

        let mut backoff = self.settings.initial_backoff;
        let mut attempt = 0;
        loop {
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| FetchError::Transient(format!("{} gateway closed", self.name)))?;
                self.send_once(build()).await
            };

            match result {
                Ok(body) => {
                    self.breaker.on_success();
                    return Ok(body);
                }
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "⚠️ {} attempt {}/{} failed: {}. Retrying in {:?}",
                        self.name,
                        attempt,
                        self.settings.max_retries,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.breaker.on_error();
                    } else {
                        self.breaker.on_success();
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn send_once(&self, request: reqwest::RequestBuilder) -> Result<String, FetchError> {
        let response = request
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = format!(
                "{} returned {}: {}",
                self.name,
                status,
                error_text.chars().take(200).collect::<String>()
            );
            return if status.is_client_error() && status.as_u16() != 429 {
                Err(FetchError::Semantic {
                    status: status.as_u16(),
                    message,
                })
            } else {
                Err(FetchError::Transient(message))
            };
        }

        Ok(response.text().await?)
    }
}

fn decode(name: &str, body: &str) -> Result<Value, FetchError> {
    serde_json::from_str(body)
        .map_err(|e| FetchError::Decode(format!("Failed to parse {} response: {}", name, e)))
}

/// URL with secret query values replaced by `[REDACTED]`.
pub fn redact(url: &reqwest::Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let value = if SECRET_PARAMS.contains(&k.as_ref()) {
                "[REDACTED]".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), value)
        })
        .collect();
    if pairs.is_empty() {
        return redacted.to_string();
    }
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}
