use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::reference_cache::CacheTtl;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:5000";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;
pub const DEFAULT_JOB_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_JOB_MAX_WAIT_MS: u64 = 60_000;
pub const DEFAULT_SIGN_IN_PATH: &str = "/login";

pub const ENV_API_BASE_URL: &str = "PUZZLE_API_BASE_URL";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "PUZZLE_REQUEST_TIMEOUT_MS";
pub const ENV_REQUEST_ATTEMPTS: &str = "PUZZLE_REQUEST_ATTEMPTS";
pub const ENV_JOB_POLL_INTERVAL_MS: &str = "PUZZLE_JOB_POLL_INTERVAL_MS";
pub const ENV_JOB_MAX_WAIT_MS: &str = "PUZZLE_JOB_MAX_WAIT_MS";
pub const ENV_REFERENCE_CACHE_TTL: &str = "PUZZLE_REFERENCE_CACHE_TTL";
pub const ENV_SIGN_IN_PATH: &str = "PUZZLE_SIGN_IN_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("base url must use http:// or https:// and include a host")]
    InvalidBaseUrl,
    #[error("invalid PUZZLE_REQUEST_TIMEOUT_MS: {0}")]
    InvalidRequestTimeout(String),
    #[error("invalid PUZZLE_REQUEST_ATTEMPTS: {0}")]
    InvalidRequestAttempts(String),
    #[error("invalid PUZZLE_JOB_POLL_INTERVAL_MS: {0}")]
    InvalidJobPollInterval(String),
    #[error("invalid PUZZLE_JOB_MAX_WAIT_MS: {0}")]
    InvalidJobMaxWait(String),
    #[error("invalid PUZZLE_REFERENCE_CACHE_TTL: {0}")]
    InvalidReferenceCacheTtl(String),
    #[error("invalid PUZZLE_SIGN_IN_PATH: {0}")]
    InvalidSignInPath(String),
}

/// Relative API paths. Job paths take the job id as a trailing segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRoutes {
    pub login: String,
    pub signup: String,
    pub jobs: String,
    pub values: String,
    pub mission_statement: String,
}

impl Default for ApiRoutes {
    fn default() -> Self {
        Self {
            login: "/api/v1/login".to_string(),
            signup: "/api/v1/signup".to_string(),
            jobs: "/api/v1/jobs".to_string(),
            values: "/api/v1/values".to_string(),
            mission_statement: "/api/v1/values/missionstatement".to_string(),
        }
    }
}

impl ApiRoutes {
    #[must_use]
    pub fn job_status(&self, job_id: &str) -> String {
        format!("{}/{}/status", self.jobs, job_id.trim())
    }

    #[must_use]
    pub fn job_result(&self, job_id: &str) -> String {
        format!("{}/{}", self.jobs, job_id.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    pub request_attempts: usize,
    pub job_poll_interval: Duration,
    pub job_max_wait: Duration,
    pub reference_cache_ttl: CacheTtl,
    pub sign_in_path: String,
    pub routes: ApiRoutes,
}

impl ClientConfig {
    pub fn new(api_base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base_url: normalize_base_url(api_base_url)?,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
            job_poll_interval: Duration::from_millis(DEFAULT_JOB_POLL_INTERVAL_MS),
            job_max_wait: Duration::from_millis(DEFAULT_JOB_MAX_WAIT_MS),
            reference_cache_ttl: CacheTtl::NextDay,
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_string(),
            routes: ApiRoutes::default(),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url =
            env_non_empty(ENV_API_BASE_URL).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let mut config = Self::new(&base_url)?;

        if let Some(raw) = env_non_empty(ENV_REQUEST_TIMEOUT_MS) {
            config.request_timeout_ms = parse_positive_u64(&raw)
                .ok_or_else(|| ConfigError::InvalidRequestTimeout(raw.clone()))?;
        }
        if let Some(raw) = env_non_empty(ENV_REQUEST_ATTEMPTS) {
            config.request_attempts = raw
                .parse::<usize>()
                .ok()
                .filter(|attempts| *attempts > 0)
                .ok_or_else(|| ConfigError::InvalidRequestAttempts(raw.clone()))?;
        }
        if let Some(raw) = env_non_empty(ENV_JOB_POLL_INTERVAL_MS) {
            let millis = parse_positive_u64(&raw)
                .ok_or_else(|| ConfigError::InvalidJobPollInterval(raw.clone()))?;
            config.job_poll_interval = Duration::from_millis(millis);
        }
        if let Some(raw) = env_non_empty(ENV_JOB_MAX_WAIT_MS) {
            let millis = parse_positive_u64(&raw)
                .ok_or_else(|| ConfigError::InvalidJobMaxWait(raw.clone()))?;
            config.job_max_wait = Duration::from_millis(millis);
        }
        if let Some(raw) = env_non_empty(ENV_REFERENCE_CACHE_TTL) {
            config.reference_cache_ttl = parse_cache_ttl(&raw)
                .ok_or_else(|| ConfigError::InvalidReferenceCacheTtl(raw.clone()))?;
        }
        if let Some(raw) = env_non_empty(ENV_SIGN_IN_PATH) {
            if !raw.starts_with('/') {
                return Err(ConfigError::InvalidSignInPath(raw));
            }
            config.sign_in_path = raw;
        }

        Ok(config)
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        join_endpoint(&self.api_base_url, path)
    }
}

#[must_use]
pub fn join_endpoint(base_url: &str, path: &str) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(format!("{base_url}{trimmed}"))
    } else {
        Some(format!("{base_url}/{trimmed}"))
    }
}

pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyBaseUrl);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidBaseUrl);
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(ConfigError::InvalidBaseUrl);
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ConfigError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

/// Accepts `next_day` or a whole number of seconds.
#[must_use]
pub fn parse_cache_ttl(raw: &str) -> Option<CacheTtl> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "next_day" | "next-day" | "daily" => Some(CacheTtl::NextDay),
        other => parse_positive_u64(other)
            .and_then(|seconds| i64::try_from(seconds).ok())
            .map(|seconds| CacheTtl::Fixed(chrono::Duration::seconds(seconds))),
    }
}

fn parse_positive_u64(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|value| *value > 0)
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
}
