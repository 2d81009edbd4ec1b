//! reqwest implementation of the puzzle API transport.
//!
//! Every endpoint answers with the `{ isSuccess, message, payload }`
//! envelope. A non-2xx reply that still carries an envelope is handed back
//! as a response so the core can classify it; only failures that produced no
//! usable reply become a [`TransportError`].

use std::time::Duration;

use async_trait::async_trait;
use puzzle_client_core::config::{
    DEFAULT_REQUEST_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT_MS, join_endpoint, normalize_base_url,
};
use puzzle_client_core::{
    ApiEnvelope, ApiRequest, ApiResponse, ApiTransport, ClientConfig, ConfigError, HttpMethod,
    TransportError,
};
use reqwest::StatusCode;
use tracing::{debug, warn};
use uuid::Uuid;

const MIN_TIMEOUT_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl HttpTransportConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

impl From<&ClientConfig> for HttpTransportConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            base_url: config.api_base_url.clone(),
            timeout_ms: config.request_timeout_ms,
            request_attempts: config.request_attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let base_url = normalize_base_url(&config.base_url).map_err(|error| match error {
            ConfigError::EmptyBaseUrl => TransportError::BaseUrlMissing,
            _ => TransportError::InvalidBaseUrl,
        })?;
        Ok(Self {
            base_url,
            timeout: Duration::from_millis(config.timeout_ms.max(MIN_TIMEOUT_MS)),
            request_attempts: config.request_attempts.max(1),
            http: reqwest::Client::new(),
        })
    }

    pub fn from_client_config(config: &ClientConfig) -> Result<Self, TransportError> {
        Self::new(HttpTransportConfig::from(config))
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        join_endpoint(&self.base_url, path)
    }

    /// POST is never retried; the server may already have accepted it.
    fn attempts_for(&self, method: HttpMethod) -> usize {
        if method.is_idempotent() {
            self.request_attempts
        } else {
            1
        }
    }

    fn build(
        &self,
        url: &str,
        request: &ApiRequest,
        bearer_token: Option<&str>,
        request_id: &str,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method_for(request.method), url)
            .header("x-request-id", request_id)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn request(
        &self,
        request: &ApiRequest,
        bearer_token: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        let url = self
            .endpoint(&request.path)
            .ok_or(TransportError::InvalidPath)?;
        let attempts = self.attempts_for(request.method);
        let mut last_error: Option<String> = None;

        for attempt in 0..attempts {
            let request_id = format!("req_{}", Uuid::new_v4().simple());
            debug!(
                method = request.method.as_str(),
                %url,
                %request_id,
                attempt,
                "sending api request"
            );
            match self
                .build(&url, request, bearer_token, &request_id)
                .send()
                .await
            {
                Ok(response) => return decode_response(response).await,
                Err(error) => {
                    warn!(%url, %request_id, attempt, %error, "api request failed");
                    last_error = Some(error.to_string());
                    if attempt + 1 >= attempts {
                        break;
                    }
                }
            }
        }

        Err(TransportError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

/// Maps a raw status and body onto an [`ApiResponse`].
///
/// Bodies that are not an envelope are a decode failure on 2xx and a
/// declined response carrying the body text otherwise.
pub fn decode_envelope(status: StatusCode, body: &[u8]) -> Result<ApiResponse, TransportError> {
    match serde_json::from_slice::<ApiEnvelope>(body) {
        Ok(envelope) => Ok(ApiResponse {
            status: status.as_u16(),
            body: envelope,
        }),
        Err(error) if status.is_success() => Err(TransportError::Decode {
            message: error.to_string(),
        }),
        Err(_) => Ok(format_http_error(status, body)),
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> ApiResponse {
    let message = non_empty_string(&String::from_utf8_lossy(body))
        .or_else(|| status.canonical_reason().map(ToString::to_string))
        .unwrap_or_else(|| "<empty>".to_string());
    ApiResponse::declined(
        status.as_u16(),
        format!("Status Code {}: {message}", status.as_u16()),
    )
}

async fn decode_response(response: reqwest::Response) -> Result<ApiResponse, TransportError> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| TransportError::Read {
            message: error.to_string(),
        })?;
    decode_envelope(status, &bytes)
}

fn method_for(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn non_empty_string(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
