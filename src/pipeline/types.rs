//! Stage inputs and outputs.
//!
//! Each stage produces one of these typed values and hands an immutable
//! reference to the next stage. Serialized field names are camelCase so the
//! result can be returned to an HTTP layer unchanged.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evidence::DocType;

// =============================================================================
// QUERY
// =============================================================================

/// A file attached to a question.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into().trim().to_ascii_lowercase(),
            data,
        }
    }

    /// Images and video go to the multimodal completion.
    pub fn is_media(&self) -> bool {
        let mime = self.mime_type.to_ascii_lowercase();
        mime.starts_with("image/") || mime.starts_with("video/")
    }

    /// Textual documents are inlined into the prompt instead of attached.
    pub fn is_text(&self) -> bool {
        let mime = self.mime_type.to_ascii_lowercase();
        mime.starts_with("text/") || mime == "application/json"
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// One submitted question. Immutable once handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub question: String,
    pub tenant_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub context_tags: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Overrides the configured retrieval limit (still clamped).
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(question: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            tenant_id: tenant_id.into(),
            user_id: None,
            context_tags: Vec::new(),
            attachments: Vec::new(),
            limit: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.context_tags = tags;
        self
    }

    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

// =============================================================================
// STAGE OUTPUTS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GatekeeperDecision {
    Approved,
    Rejected { reason: String },
    NeedsClarification { question: String },
}

impl GatekeeperDecision {
    pub fn status(&self) -> &'static str {
        match self {
            GatekeeperDecision::Approved => "approved",
            GatekeeperDecision::Rejected { .. } => "rejected",
            GatekeeperDecision::NeedsClarification { .. } => "needs_clarification",
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, GatekeeperDecision::Approved)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    Focused,
    Broad,
    Comprehensive,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::Focused => "focused",
            SearchStrategy::Broad => "broad",
            SearchStrategy::Comprehensive => "comprehensive",
        }
    }

    /// One step wider; `Comprehensive` stays put.
    pub fn widen(self) -> Self {
        match self {
            SearchStrategy::Focused => SearchStrategy::Broad,
            SearchStrategy::Broad | SearchStrategy::Comprehensive => SearchStrategy::Comprehensive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub focus: BTreeSet<DocType>,
    pub strategy: SearchStrategy,
    #[serde(default)]
    pub sub_queries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub answer: String,
    pub key_insights: Vec<String>,
    /// 0-based indices into the evidence slice the analyst was given.
    pub evidence_references: Vec<usize>,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditResult {
    pub quality_score: f32,
    pub grounding_check: bool,
    pub coverage_check: bool,
    pub missing_aspects: Vec<String>,
}

impl AuditResult {
    pub fn passes_gate(&self, threshold: f32) -> bool {
        self.quality_score >= threshold
    }

    /// Below threshold with something concrete to go look for.
    pub fn needs_reanalysis(&self, threshold: f32) -> bool {
        !self.passes_gate(threshold) && !self.missing_aspects.is_empty()
    }
}

// =============================================================================
// TRACE
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageName {
    Retriever,
    Gatekeeper,
    Planner,
    Analyst,
    Auditor,
    Writer,
    MultimodalAnalysis,
    DocumentAnalysis,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Retriever => "RETRIEVER",
            StageName::Gatekeeper => "GATEKEEPER",
            StageName::Planner => "PLANNER",
            StageName::Analyst => "ANALYST",
            StageName::Auditor => "AUDITOR",
            StageName::Writer => "WRITER",
            StageName::MultimodalAnalysis => "MULTIMODAL_ANALYSIS",
            StageName::DocumentAnalysis => "DOCUMENT_ANALYSIS",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Warning,
    Error,
    Pending,
    Processing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct DocumentRef {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceStep {
    pub stage: StageName,
    pub summary: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub documents_used: Vec<DocumentRef>,
    pub status: StepStatus,
    #[serde(default)]
    pub details: String,
}

impl TraceStep {
    pub fn new(stage: StageName, status: StepStatus, summary: impl Into<String>) -> Self {
        Self {
            stage,
            summary: summary.into(),
            duration_ms: 0,
            documents_used: Vec::new(),
            status,
            details: String::new(),
        }
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn documents(mut self, docs: Vec<DocumentRef>) -> Self {
        self.documents_used = docs;
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub session_id: Uuid,
    pub answer: String,
    pub quality_score: f32,
    pub trace: Vec<TraceStep>,
    pub total_latency_ms: u64,
}

impl PipelineResult {
    pub fn stages(&self) -> Vec<StageName> {
        self.trace.iter().map(|s| s.stage).collect()
    }
}
