use thiserror::Error;

pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong, please try again.";
pub const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired, please sign in again.";
pub const TIMEOUT_MESSAGE: &str = "This is taking longer than expected, please try again later.";
pub const CANCELLED_MESSAGE: &str = "The request was cancelled.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthenticationExpired,
    BusinessFailure,
    InfrastructureFailure,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationExpired => "authentication_expired",
            Self::BusinessFailure => "business_failure",
            Self::InfrastructureFailure => "infrastructure_failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Failure outcome shared by every public operation of the client core.
///
/// `Clone` so a single-flight refresh can hand the same failure to every
/// waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("authentication expired")]
    AuthenticationExpired,
    #[error("request declined ({status}): {message}")]
    BusinessFailure { status: u16, message: String },
    #[error("transport failure: {message}")]
    InfrastructureFailure { message: String },
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn business(status: u16, message: impl Into<String>) -> Self {
        Self::BusinessFailure {
            status,
            message: message.into(),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::InfrastructureFailure {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationExpired => ErrorKind::AuthenticationExpired,
            Self::BusinessFailure { .. } => ErrorKind::BusinessFailure,
            Self::InfrastructureFailure { .. } => ErrorKind::InfrastructureFailure,
            Self::Timeout => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Text suitable for a toast. Server and transport messages are passed
    /// through verbatim; timeouts and cancellations never leak transport text.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::AuthenticationExpired => SESSION_EXPIRED_MESSAGE.to_string(),
            Self::BusinessFailure { message, .. } | Self::InfrastructureFailure { message } => {
                non_empty(message).unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_string())
            }
            Self::Timeout => TIMEOUT_MESSAGE.to_string(),
            Self::Cancelled => CANCELLED_MESSAGE.to_string(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
