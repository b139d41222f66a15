//! Final answer composition.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::error::PipelineError;
use super::retry::RetryPolicy;
use super::types::{Analysis, AuditResult, StageName};
use crate::evidence::EvidenceChunk;
use crate::gateway::{Attribution, CapabilityProvider, ChatModel, ChatRequest};
use crate::prompts;

/// Everything the writer may draw on.
#[derive(Debug, Clone, Copy)]
pub struct WriterInput<'a> {
    pub question: &'a str,
    pub analysis: &'a Analysis,
    pub audit: &'a AuditResult,
    pub evidence: &'a [EvidenceChunk],
    pub tenant_id: &'a str,
    pub session_id: Uuid,
}

#[async_trait]
pub trait Writer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(&self, input: WriterInput<'_>) -> Result<String, PipelineError>;
}

/// Returns the analyst's draft verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughWriter;

#[async_trait]
impl Writer for PassthroughWriter {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    async fn write(&self, input: WriterInput<'_>) -> Result<String, PipelineError> {
        Ok(input.analysis.answer.clone())
    }
}

/// One extra completion that folds the audit feedback into the draft.
pub struct PolishingWriter {
    provider: Arc<dyn CapabilityProvider>,
    model: String,
    chunk_char_budget: usize,
    policy: RetryPolicy,
}

impl PolishingWriter {
    pub fn new(provider: Arc<dyn CapabilityProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            chunk_char_budget: 450,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_chunk_budget(mut self, budget: usize) -> Self {
        self.chunk_char_budget = budget;
        self
    }
}

#[async_trait]
impl Writer for PolishingWriter {
    fn name(&self) -> &'static str {
        "polishing"
    }

    async fn write(&self, input: WriterInput<'_>) -> Result<String, PipelineError> {
        let prompt = prompts::render_polish(
            input.question,
            &input.analysis.answer,
            input.audit,
            input.evidence,
            self.chunk_char_budget,
        );
        let request = ChatRequest::new(
            ChatModel::openrouter(&self.model),
            prompt.to_messages(),
            Attribution::new("pipeline::writer")
                .with_tenant(input.tenant_id)
                .with_session(input.session_id),
        )
        .temperature(0.2);

        let resp = self
            .policy
            .run(StageName::Writer, || self.provider.chat(request.clone()))
            .await?;

        let polished = resp.content.trim();
        if polished.is_empty() {
            tracing::warn!(session_id = %input.session_id, "polishing returned empty text; keeping draft");
            return Ok(input.analysis.answer.clone());
        }
        Ok(polished.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::gateway::{ChatResponse, EmbedRequest, EmbedResponse, FinishReason, ProviderError};

    struct FixedReply {
        content: String,
        prompts: Mutex<Vec<String>>,
    }

    impl FixedReply {
        fn new(content: &str) -> Self {
            Self {
                content: content.into(),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CapabilityProvider for FixedReply {
        async fn embed(&self, _req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
            Err(ProviderError::invalid_request("embed not scripted"))
        }

        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.prompts.lock().unwrap().push(format!("{:?}", req.messages));
            Ok(ChatResponse {
                content: self.content.clone(),
                input_tokens: 10,
                output_tokens: 5,
                latency: Duration::from_millis(1),
                finish_reason: FinishReason::Stop,
            })
        }
    }

    fn analysis() -> Analysis {
        Analysis {
            answer: "draft".into(),
            key_insights: vec![],
            evidence_references: vec![],
            confidence: Some(0.6),
        }
    }

    fn audit() -> AuditResult {
        AuditResult {
            quality_score: 0.6,
            grounding_check: true,
            coverage_check: false,
            missing_aspects: vec!["Answer is too short".into()],
        }
    }

    fn input<'a>(analysis: &'a Analysis, audit: &'a AuditResult) -> WriterInput<'a> {
        WriterInput {
            question: "What is retained?",
            analysis,
            audit,
            evidence: &[],
            tenant_id: "acme",
            session_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn passthrough_returns_draft() {
        let (analysis, audit) = (analysis(), audit());
        let out = PassthroughWriter.write(input(&analysis, &audit)).await.unwrap();
        assert_eq!(out, "draft");
    }

    #[tokio::test]
    async fn polishing_uses_provider_text_and_audit_feedback() {
        let provider = Arc::new(FixedReply::new("  Polished answer.  "));
        let writer = PolishingWriter::new(provider.clone(), "openai/gpt-4o-mini");
        let (analysis, audit) = (analysis(), audit());

        let out = writer.write(input(&analysis, &audit)).await.unwrap();
        assert_eq!(out, "Polished answer.");

        let prompts = provider.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Answer is too short"));
    }

    #[tokio::test]
    async fn polishing_keeps_draft_on_empty_reply() {
        let writer = PolishingWriter::new(Arc::new(FixedReply::new("   ")), "openai/gpt-4o-mini");
        let (analysis, audit) = (analysis(), audit());
        let out = writer.write(input(&analysis, &audit)).await.unwrap();
        assert_eq!(out, "draft");
    }
}
