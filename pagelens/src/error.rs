use serde::{Deserialize, Serialize};

/// Machine-checkable error classification.
///
/// Every failure in the pipeline carries one of these kinds so callers
/// can branch on them without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NetworkFailure,
    RateLimited,
    QuotaExceeded,
    ProviderUnavailable,
    ContentTooShort,
    ContentTooLong,
    UpstreamModel,
    Duplicate,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::ContentTooShort => "content_too_short",
            ErrorKind::ContentTooLong => "content_too_long",
            ErrorKind::UpstreamModel => "upstream_model",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors produced by the pipeline.
///
/// Fetcher and provider layers classify failures at the point of
/// occurrence; the orchestrator only consults `kind()` and
/// `is_retryable()` to decide retry vs fail-item vs continue-on-error.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("content too short: {got} chars (minimum {min})")]
    ContentTooShort { got: usize, min: usize },

    #[error("content too long: estimated {estimated} tokens (limit {limit})")]
    ContentTooLong { estimated: usize, limit: usize },

    #[error("upstream model error: {message}")]
    UpstreamModel { message: String, transient: bool },

    #[error("duplicate content: fingerprint {0} already in history")]
    Duplicate(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidInput(_) => ErrorKind::InvalidInput,
            PipelineError::Network(_) => ErrorKind::NetworkFailure,
            PipelineError::RateLimited(_) => ErrorKind::RateLimited,
            PipelineError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            PipelineError::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            PipelineError::ContentTooShort { .. } => ErrorKind::ContentTooShort,
            PipelineError::ContentTooLong { .. } => ErrorKind::ContentTooLong,
            PipelineError::UpstreamModel { .. } => ErrorKind::UpstreamModel,
            PipelineError::Duplicate(_) => ErrorKind::Duplicate,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether another attempt may succeed. Upstream model errors are
    /// retryable only when classified transient at the call site.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Network(_) | PipelineError::RateLimited(_) => true,
            PipelineError::UpstreamModel { transient, .. } => *transient,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::Network(format!("request timed out: {err}"))
        } else if err.is_connect() {
            PipelineError::Network(format!("connection failed: {err}"))
        } else if err.is_builder() {
            PipelineError::Internal(format!("http client error: {err}"))
        } else {
            PipelineError::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
