//! Alternate path for questions that carry attachments.
//!
//! Bypasses gatekeeping, planning and auditing. Media (image/video) takes
//! precedence over documents; only the first usable document is analysed.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::error::PipelineError;
use super::retriever::{RetrievalRequest, Retriever};
use super::retry::RetryPolicy;
use super::types::{Attachment, DocumentRef, Query, StageName, StepStatus, TraceStep};
use crate::config::MultimodalConfig;
use crate::evidence::EvidenceChunk;
use crate::gateway::structured;
use crate::gateway::{
    Attribution, CapabilityProvider, ChatModel, ChatRequest, ContentPart, ProviderError,
    ResponseSchema,
};
use crate::prompts;
use crate::trace::TraceRecorder;

const SCHEMA_NAME: &str = "media_answer";

/// Inlined text documents are cut to this many characters.
const MAX_INLINE_CHARS: usize = 100_000;

const SUPPORTED_DOCUMENT_TYPES: &[&str] = &[
    "application/pdf",
    "text/plain",
    "text/markdown",
    "text/x-markdown",
    "text/csv",
    "application/json",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

pub fn is_supported_document(attachment: &Attachment) -> bool {
    let mime = attachment.mime_type.to_ascii_lowercase();
    SUPPORTED_DOCUMENT_TYPES.contains(&mime.as_str())
}

#[derive(Debug, Deserialize)]
struct RawMediaAnswer {
    answer: String,
    #[serde(default)]
    confidence: Option<f32>,
}

fn media_schema() -> ResponseSchema {
    ResponseSchema::new(
        SCHEMA_NAME,
        json!({
            "type": "object",
            "properties": {
                "answer": { "type": "string" },
                "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
            },
            "required": ["answer", "confidence"],
            "additionalProperties": false
        }),
    )
}

/// Attachments split by how they will be sent.
#[derive(Debug, Default)]
pub struct Partition<'a> {
    pub media: Vec<&'a Attachment>,
    pub documents: Vec<&'a Attachment>,
    pub ignored: Vec<&'a Attachment>,
}

pub fn partition(attachments: &[Attachment], max_bytes: usize) -> Partition<'_> {
    let mut out = Partition::default();
    for attachment in attachments {
        if attachment.data.is_empty() || attachment.data.len() > max_bytes {
            out.ignored.push(attachment);
        } else if attachment.is_media() {
            out.media.push(attachment);
        } else if is_supported_document(attachment) {
            out.documents.push(attachment);
        } else {
            out.ignored.push(attachment);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultimodalOutcome {
    pub answer: String,
    pub quality_score: f32,
    pub stage: StageName,
}

pub struct MultimodalBranch {
    provider: Arc<dyn CapabilityProvider>,
    retriever: Option<Arc<Retriever>>,
    config: MultimodalConfig,
    chunk_char_budget: usize,
    baseline_score: f32,
    policy: RetryPolicy,
}

impl MultimodalBranch {
    pub fn new(provider: Arc<dyn CapabilityProvider>, config: MultimodalConfig) -> Self {
        Self {
            provider,
            retriever: None,
            config,
            chunk_char_budget: 450,
            baseline_score: 0.75,
            policy: RetryPolicy::default(),
        }
    }

    /// Enables the lightweight evidence lookup.
    pub fn with_retriever(mut self, retriever: Arc<Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_scoring(mut self, chunk_char_budget: usize, baseline_score: f32) -> Self {
        self.chunk_char_budget = chunk_char_budget;
        self.baseline_score = baseline_score;
        self
    }

    /// Run the branch, appending its steps to `trace`. Failures are returned
    /// without a step; the orchestrator records the error step.
    pub async fn run(
        &self,
        query: &Query,
        session_id: Uuid,
        trace: &mut TraceRecorder,
    ) -> Result<MultimodalOutcome, PipelineError> {
        let parts = partition(&query.attachments, self.config.max_attachment_bytes);
        for ignored in &parts.ignored {
            tracing::info!(
                session_id = %session_id,
                filename = %ignored.filename,
                mime_type = %ignored.mime_type,
                bytes = ignored.data.len(),
                "ignoring unusable attachment"
            );
        }
        if parts.media.is_empty() && parts.documents.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "none of the {} attachment(s) is a supported image, video or document",
                query.attachments.len()
            )));
        }

        let evidence = self.lookup_evidence(query, session_id, trace).await;
        let documents_used = document_refs(&evidence);

        let started = Instant::now();
        let (stage, prompt, content_parts, summary) = if !parts.media.is_empty() {
            let prompt = prompts::render_multimodal(
                &query.question,
                parts.media.len(),
                &evidence,
                self.chunk_char_budget,
            );
            let content: Vec<ContentPart> = parts.media.iter().map(|a| media_part(a)).collect();
            let summary = format!("Analyzed {} media attachment(s)", parts.media.len());
            (StageName::MultimodalAnalysis, prompt, content, summary)
        } else {
            let document = parts.documents[0];
            let (inline, content) = if document.is_text() {
                let text = String::from_utf8_lossy(&document.data);
                let text = prompts::truncate_chars(&text, MAX_INLINE_CHARS).to_string();
                (Some(text), Vec::new())
            } else {
                (
                    None,
                    vec![ContentPart::File {
                        filename: document.filename.clone(),
                        mime_type: document.mime_type.clone(),
                        data: document.data.clone(),
                    }],
                )
            };
            let prompt = prompts::render_document(
                &query.question,
                &document.filename,
                inline.as_deref(),
                &evidence,
                self.chunk_char_budget,
            );
            let summary = format!("Analyzed document {}", document.filename);
            (StageName::DocumentAnalysis, prompt, content, summary)
        };

        let request = ChatRequest::new(
            ChatModel::openrouter(&self.config.model),
            prompt.to_messages_with_parts(content_parts),
            Attribution::new("pipeline::multimodal")
                .with_tenant(&query.tenant_id)
                .with_session(session_id),
        )
        .max_tokens(self.config.max_tokens)
        .schema(media_schema());

        let raw = self
            .policy
            .run(stage, || async {
                let resp = self.provider.chat(request.clone()).await?;
                let raw: RawMediaAnswer = structured::decode(SCHEMA_NAME, &resp.content)?;
                if raw.answer.trim().is_empty() {
                    return Err(ProviderError::malformed(SCHEMA_NAME, "empty answer"));
                }
                Ok(raw)
            })
            .await?;

        let quality_score = raw
            .confidence
            .filter(|c| c.is_finite())
            .unwrap_or(self.baseline_score)
            .clamp(0.0, 1.0);

        trace.push(
            TraceStep::new(stage, StepStatus::Success, summary)
                .duration_ms(started.elapsed().as_millis() as u64)
                .documents(documents_used)
                .details(format!(
                    "confidence={quality_score:.2}; evidence={}; ignored_attachments={}",
                    evidence.len(),
                    parts.ignored.len()
                )),
        );

        Ok(MultimodalOutcome {
            answer: raw.answer.trim().to_string(),
            quality_score,
            stage,
        })
    }

    /// Best-effort retrieval; a failure becomes a warning step.
    async fn lookup_evidence(
        &self,
        query: &Query,
        session_id: Uuid,
        trace: &mut TraceRecorder,
    ) -> Vec<EvidenceChunk> {
        let Some(retriever) = &self.retriever else {
            return Vec::new();
        };
        if self.config.evidence_limit == 0 {
            return Vec::new();
        }

        let started = Instant::now();
        let request = RetrievalRequest::new(&query.question, &query.tenant_id)
            .limit(Some(self.config.evidence_limit))
            .session(session_id);
        match retriever.retrieve(request).await {
            Ok(retrieval) => {
                let mut chunks = retrieval.chunks.clone();
                chunks.truncate(self.config.evidence_limit);
                trace.push(
                    TraceStep::new(StageName::Retriever, StepStatus::Success, retrieval.summary())
                        .duration_ms(started.elapsed().as_millis() as u64)
                        .documents(retrieval.documents.clone()),
                );
                chunks
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "multimodal evidence lookup failed");
                trace.push(
                    TraceStep::new(
                        StageName::Retriever,
                        StepStatus::Warning,
                        "Evidence lookup failed; continuing without evidence",
                    )
                    .duration_ms(started.elapsed().as_millis() as u64)
                    .details(e.to_string()),
                );
                Vec::new()
            }
        }
    }
}

fn media_part(attachment: &Attachment) -> ContentPart {
    if attachment.mime_type.to_ascii_lowercase().starts_with("video/") {
        ContentPart::Video {
            mime_type: attachment.mime_type.clone(),
            data: attachment.data.clone(),
        }
    } else {
        ContentPart::Image {
            mime_type: attachment.mime_type.clone(),
            data: attachment.data.clone(),
        }
    }
}

fn document_refs(evidence: &[EvidenceChunk]) -> Vec<DocumentRef> {
    let mut refs: Vec<DocumentRef> = Vec::new();
    for chunk in evidence {
        if !refs.iter().any(|r| r.id == chunk.document_id) {
            refs.push(DocumentRef {
                id: chunk.document_id.clone(),
                title: chunk.title.clone(),
            });
        }
    }
    refs
}
