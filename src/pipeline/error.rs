//! Pipeline error taxonomy.

use thiserror::Error;
use uuid::Uuid;

use super::types::{StageName, TraceStep};
use crate::gateway::ProviderError;

/// Every way a pipeline run can end without an answer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// The gatekeeper refused the question.
    #[error("question rejected: {reason}")]
    Rejected { reason: String },

    /// The gatekeeper needs more detail before spending on synthesis.
    #[error("clarification needed: {question}")]
    ClarificationNeeded { question: String },

    /// Provider rate limit persisted through the stage's retries.
    #[error("quota exceeded in {stage} after {attempts} attempts")]
    QuotaExceeded { stage: StageName, attempts: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Any other external-call failure.
    #[error("{stage} failed: {message}")]
    Unhandled { stage: StageName, message: String },
}

impl PipelineError {
    pub fn unhandled(stage: StageName, message: impl Into<String>) -> Self {
        Self::Unhandled {
            stage,
            message: message.into(),
        }
    }

    /// Map a provider failure that the stage will not retry.
    pub fn from_provider(stage: StageName, err: &ProviderError) -> Self {
        match err.context().filter(|c| !c.is_empty()) {
            Some(ctx) => Self::unhandled(stage, format!("{} ({}; {ctx})", err, err.code())),
            None => Self::unhandled(stage, format!("{} ({})", err, err.code())),
        }
    }

    /// HTTP-equivalent status for the caller.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Rejected { .. } | Self::ClarificationNeeded { .. } | Self::InvalidInput(_) => 400,
            Self::QuotaExceeded { .. } | Self::Unhandled { .. } => 500,
        }
    }

    /// Whether the caller may resubmit the same query later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "rejected",
            Self::ClarificationNeeded { .. } => "clarification_needed",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::InvalidInput(_) => "invalid_input",
            Self::Unhandled { .. } => "unhandled",
        }
    }

    /// The stage this error is attributed to, if any.
    pub fn stage(&self) -> Option<StageName> {
        match self {
            Self::Rejected { .. } | Self::ClarificationNeeded { .. } => Some(StageName::Gatekeeper),
            Self::QuotaExceeded { stage, .. } | Self::Unhandled { stage, .. } => Some(*stage),
            Self::InvalidInput(_) => None,
        }
    }
}

/// A terminal error together with everything the run recorded before it.
#[derive(Debug, Clone, Error)]
#[error("pipeline {session_id} failed: {error}")]
pub struct PipelineFailure {
    pub session_id: Uuid,
    #[source]
    pub error: PipelineError,
    pub trace: Vec<TraceStep>,
}

impl PipelineFailure {
    pub fn stages(&self) -> Vec<StageName> {
        self.trace.iter().map(|s| s.stage).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ErrorContext;
    use std::time::Duration;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            PipelineError::Rejected { reason: "x".into() }.status_code(),
            400
        );
        assert_eq!(PipelineError::InvalidInput("x".into()).status_code(), 400);
        let quota = PipelineError::QuotaExceeded {
            stage: StageName::Analyst,
            attempts: 3,
        };
        assert_eq!(quota.status_code(), 500);
        assert!(quota.is_retryable());
        assert!(!PipelineError::unhandled(StageName::Retriever, "boom").is_retryable());
    }

    #[test]
    fn provider_errors_keep_their_code() {
        let err = PipelineError::from_provider(
            StageName::Analyst,
            &ProviderError::Timeout(Duration::from_secs(3), None),
        );
        assert_eq!(err.stage(), Some(StageName::Analyst));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn provider_context_is_quoted_in_details() {
        let provider_err = ProviderError::Provider {
            provider: "openrouter",
            message: "upstream overloaded".into(),
            retryable: true,
            context: Some(ErrorContext::new().with_status(503).with_request_id("req-9")),
        };
        let err = PipelineError::from_provider(StageName::Writer, &provider_err);
        let text = err.to_string();
        assert!(text.contains("provider_error"), "{text}");
        assert!(text.contains("status=503 request_id=req-9"), "{text}");
    }
}
