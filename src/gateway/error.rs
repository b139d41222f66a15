//! Error types for the provider gateway.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Where a rate limit came from. Remote limits carry the provider's 429 context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitSource {
    Local,
    Remote,
}

/// HTTP metadata captured from a failed provider response.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Provider error code, e.g. "rate_limit_exceeded".
    pub provider_code: Option<String>,
    /// `x-request-id` header, quoted in pipeline error details.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.http_status.is_none() && self.provider_code.is_none() && self.request_id.is_none()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(status) = self.http_status {
            parts.push(format!("status={status}"));
        }
        if let Some(code) = &self.provider_code {
            parts.push(format!("provider_code={code}"));
        }
        if let Some(id) = &self.request_id {
            parts.push(format!("request_id={id}"));
        }
        f.write_str(&parts.join(" "))
    }
}

/// Failures from embedding and chat calls.
///
/// Pipeline stages retry `RateLimited`; the gateway retries `is_transient` errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited ({limit_source:?}), retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        limit_source: RateLimitSource,
        context: Option<ErrorContext>,
    },

    /// Rejected by the provider as malformed or too large.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Content-policy refusal.
    #[error("refused: {message}")]
    Refused {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Completion did not match the requested response schema.
    #[error("malformed structured output ({schema}): {message}")]
    Malformed { schema: String, message: String },

    /// Any other non-2xx; 5xx responses are retryable.
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    #[error("timeout after {0:?}")]
    Timeout(Duration, Option<ErrorContext>),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing API key or unusable client settings.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn rate_limited_local(retry_after: Duration) -> Self {
        Self::RateLimited {
            retry_after,
            limit_source: RateLimitSource::Local,
            context: None,
        }
    }

    pub fn rate_limited_remote(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            limit_source: RateLimitSource::Remote,
            context: Some(context),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused {
            message: message.into(),
            context: None,
        }
    }

    pub fn malformed(schema: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            schema: schema.into(),
            message: message.into(),
        }
    }

    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout(_, _) => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::InvalidRequest { .. } => false,
            Self::Refused { .. } => false,
            Self::Malformed { .. } => false,
            Self::Config(_) => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Retryable, but not a rate limit. The gateway retries these itself.
    pub fn is_transient(&self) -> bool {
        self.is_retryable() && !self.is_rate_limited()
    }

    /// Short code for logs and usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited {
                limit_source: RateLimitSource::Local,
                ..
            } => "rate_limited_local",
            Self::RateLimited {
                limit_source: RateLimitSource::Remote,
                ..
            } => "rate_limited_remote",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Refused { .. } => "refused",
            Self::Malformed { .. } => "malformed_output",
            Self::Provider { .. } => "provider_error",
            Self::Timeout(_, _) => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. } => context.as_ref(),
            Self::InvalidRequest { context, .. } => context.as_ref(),
            Self::Refused { context, .. } => context.as_ref(),
            Self::Provider { context, .. } => context.as_ref(),
            Self::Timeout(_, context) => context.as_ref(),
            Self::Malformed { .. } => None,
            Self::Http(_) => None,
            Self::Config(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_are_retryable_but_not_transient() {
        let err = ProviderError::rate_limited_local(Duration::from_secs(1));
        assert!(err.is_retryable());
        assert!(err.is_rate_limited());
        assert!(!err.is_transient());
        assert_eq!(err.code(), "rate_limited_local");
    }

    #[test]
    fn server_errors_are_transient() {
        let err = ProviderError::provider("openrouter", "HTTP 502", true);
        assert!(err.is_transient());
        assert!(!ProviderError::malformed("analysis", "missing answer").is_retryable());
    }

    #[test]
    fn context_renders_only_known_fields() {
        let ctx = ErrorContext::new().with_status(429).with_request_id("req-1");
        assert_eq!(ctx.to_string(), "status=429 request_id=req-1");
        assert!(ErrorContext::new().is_empty());

        let err = ProviderError::rate_limited_remote(Duration::from_secs(60), ctx);
        assert_eq!(err.code(), "rate_limited_remote");
        assert_eq!(
            err.context().and_then(|c| c.request_id.as_deref()),
            Some("req-1")
        );
    }
}
