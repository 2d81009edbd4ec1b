use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::error::ClientError;
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    #[must_use]
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Self::Post)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequirement {
    None,
    AccessToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub auth: AuthRequirement,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            auth: AuthRequirement::None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn authenticated(mut self) -> Self {
        self.auth = AuthRequirement::AccessToken;
        self
    }
}

/// Body shape every API endpoint replies with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope {
    #[serde(default)]
    pub is_success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Vec<Value>,
}

impl ApiEnvelope {
    pub fn success(payload: Vec<Value>) -> Self {
        Self {
            is_success: true,
            message: String::new(),
            payload,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            message: message.into(),
            payload: Vec::new(),
        }
    }

    /// Deserializes the first payload element.
    pub fn first_payload<T>(&self) -> Result<T, ClientError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let first = self
            .payload
            .first()
            .ok_or_else(|| ClientError::infrastructure("response payload is empty"))?;
        T::deserialize(first).map_err(|error| {
            ClientError::infrastructure(format!("failed to decode response payload: {error}"))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: ApiEnvelope,
}

impl ApiResponse {
    pub fn ok(payload: Vec<Value>) -> Self {
        Self {
            status: 200,
            body: ApiEnvelope::success(payload),
        }
    }

    pub fn declined(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiEnvelope::failure(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("api base url is missing")]
    BaseUrlMissing,
    #[error("api base url must use http:// or https://")]
    InvalidBaseUrl,
    #[error("invalid request path")]
    InvalidPath,
    #[error("request failed: {message}")]
    Request { message: String },
    #[error("response read failed: {message}")]
    Read { message: String },
    #[error("response decode failed: {message}")]
    Decode { message: String },
}

impl TransportError {
    /// Underlying cause without the variant prefix; may be empty.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::BaseUrlMissing => "api base url is missing",
            Self::InvalidBaseUrl => "api base url must use http:// or https://",
            Self::InvalidPath => "invalid request path",
            Self::Request { message } | Self::Read { message } | Self::Decode { message } => {
                message
            }
        }
    }
}

#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn request(
        &self,
        request: &ApiRequest,
        bearer_token: Option<&str>,
    ) -> Result<ApiResponse, TransportError>;
}

/// Result of one exchange, decided once at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiOutcome {
    Success(ApiEnvelope),
    BusinessFailure { status: u16, message: String },
    InfrastructureFailure { message: String },
}

impl ApiOutcome {
    #[must_use]
    pub fn classify(result: Result<ApiResponse, TransportError>) -> Self {
        match result {
            Ok(response) if response.body.is_success && (200..=299).contains(&response.status) => {
                Self::Success(response.body)
            }
            Ok(response) => Self::BusinessFailure {
                status: response.status,
                message: response.body.message,
            },
            Err(error) => Self::InfrastructureFailure {
                message: error.detail().to_string(),
            },
        }
    }

    pub fn into_result(self) -> Result<ApiEnvelope, ClientError> {
        match self {
            Self::Success(envelope) => Ok(envelope),
            Self::BusinessFailure { status, message } => {
                Err(ClientError::BusinessFailure { status, message })
            }
            Self::InfrastructureFailure { message } => {
                Err(ClientError::InfrastructureFailure { message })
            }
        }
    }
}

/// Sender used by every component that talks to the API on behalf of the
/// signed-in user.
pub struct ApiClient {
    transport: Arc<dyn ApiTransport>,
    session: Arc<SessionManager>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn ApiTransport>, session: Arc<SessionManager>) -> Self {
        Self { transport, session }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiEnvelope, ClientError> {
        let bearer_token = match request.auth {
            AuthRequirement::None => None,
            AuthRequirement::AccessToken => {
                if self.session.check_and_invalidate_if_expired() {
                    return Err(ClientError::AuthenticationExpired);
                }
                self.session.bearer_token()
            }
        };

        debug!(method = request.method.as_str(), path = %request.path, "api request");
        let result = self
            .transport
            .request(&request, bearer_token.as_deref())
            .await;

        if let Ok(response) = &result
            && self.session.token_has_expired(response)
        {
            return Err(ClientError::AuthenticationExpired);
        }

        ApiOutcome::classify(result).into_result()
    }
}
