use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderId;

/// HTTP statuses that indicate a transient condition worth retrying.
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Failure classes surfaced by providers and the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    Timeout,
    RateLimited,
    ApiError,
    ParseError,
    InvalidResponse,
    ProviderDown,
    AllProvidersFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ApiError => "API_ERROR",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::InvalidResponse => "INVALID_RESPONSE",
            ErrorCode::ProviderDown => "PROVIDER_DOWN",
            ErrorCode::AllProvidersFailed => "ALL_PROVIDERS_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an HTTP status to its failure class and retryability.
pub fn classify_status(status: u16) -> (ErrorCode, bool) {
    let retryable = RETRYABLE_STATUS_CODES.contains(&status);
    let code = match status {
        408 => ErrorCode::Timeout,
        429 => ErrorCode::RateLimited,
        500..=599 => ErrorCode::ProviderDown,
        _ => ErrorCode::ApiError,
    };
    (code, retryable)
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A classified weather fetch failure.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct WeatherError {
    pub code: ErrorCode,
    pub message: String,
    pub provider: Option<ProviderId>,
    pub status: Option<u16>,
    pub retryable: bool,
    #[source]
    source: Option<BoxError>,
}

impl WeatherError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            provider: None,
            status: None,
            retryable: false,
            source: None,
        }
    }

    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Transport-level failure (DNS, connect, reset). Always retryable.
    pub fn network(provider: ProviderId, source: reqwest::Error) -> Self {
        Self::new(
            ErrorCode::NetworkError,
            format!("{provider}: network request failed: {source}"),
        )
        .with_provider(provider)
        .retryable(true)
        .with_source(source)
    }

    pub fn timeout(provider: ProviderId, timeout_ms: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("{provider}: request timed out after {timeout_ms}ms"),
        )
        .with_provider(provider)
        .retryable(true)
    }

    /// Non-success HTTP response, classified by status.
    pub fn from_status(provider: ProviderId, status: u16, body: &str) -> Self {
        let (code, retryable) = classify_status(status);
        Self::new(
            code,
            format!(
                "{provider}: request failed with status {status}: {}",
                truncate_body(body)
            ),
        )
        .with_provider(provider)
        .with_status(status)
        .retryable(retryable)
    }

    pub fn parse(provider: ProviderId, source: serde_json::Error) -> Self {
        Self::new(
            ErrorCode::ParseError,
            format!("{provider}: failed to parse response: {source}"),
        )
        .with_provider(provider)
        .with_source(source)
    }

    pub fn invalid_response(provider: ProviderId, detail: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidResponse,
            format!("{provider}: invalid response: {detail}"),
        )
        .with_provider(provider)
    }

    pub fn all_providers_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::AllProvidersFailed, detail)
    }
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let cut = (0..=MAX).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &body[..cut])
    } else {
        body.to_string()
    }
}
