//! Evidence synthesis via one structured completion.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::error::PipelineError;
use super::retry::RetryPolicy;
use super::types::{Analysis, Plan, StageName};
use crate::config::AnalystConfig;
use crate::evidence::EvidenceChunk;
use crate::gateway::structured;
use crate::gateway::{
    Attribution, CapabilityProvider, ChatModel, ChatRequest, ProviderError, ResponseSchema,
};
use crate::prompts;

const SCHEMA_NAME: &str = "analysis";

/// Wire shape of the analyst completion before validation.
#[derive(Debug, Deserialize)]
struct RawAnalysis {
    answer: String,
    #[serde(default)]
    key_insights: Vec<String>,
    #[serde(default)]
    evidence_references: Vec<i64>,
    #[serde(default)]
    confidence: Option<f32>,
}

pub fn analysis_schema() -> ResponseSchema {
    ResponseSchema::new(
        SCHEMA_NAME,
        json!({
            "type": "object",
            "properties": {
                "answer": { "type": "string" },
                "key_insights": { "type": "array", "items": { "type": "string" } },
                "evidence_references": { "type": "array", "items": { "type": "integer" } },
                "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
            },
            "required": ["answer", "key_insights", "evidence_references", "confidence"],
            "additionalProperties": false
        }),
    )
}

pub struct Analyst {
    provider: Arc<dyn CapabilityProvider>,
    config: AnalystConfig,
    policy: RetryPolicy,
}

impl Analyst {
    pub fn new(provider: Arc<dyn CapabilityProvider>, config: AnalystConfig) -> Self {
        Self {
            provider,
            config,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn analyze(
        &self,
        question: &str,
        evidence: &[EvidenceChunk],
        plan: &Plan,
        tenant_id: &str,
        session_id: Uuid,
    ) -> Result<Analysis, PipelineError> {
        let prompt =
            prompts::render_analyst(question, evidence, plan, self.config.chunk_char_budget);
        let request = ChatRequest::new(
            ChatModel::openrouter(&self.config.model),
            prompt.to_messages(),
            Attribution::new("pipeline::analyst")
                .with_tenant(tenant_id)
                .with_session(session_id),
        )
        .temperature(self.config.temperature)
        .max_tokens(self.config.max_tokens)
        .schema(analysis_schema());

        let analysis = self
            .policy
            .run(StageName::Analyst, || async {
                let resp = self.provider.chat(request.clone()).await?;
                let raw: RawAnalysis = structured::decode(SCHEMA_NAME, &resp.content)?;
                validate(raw, evidence.len())
            })
            .await?;

        tracing::debug!(
            tenant = tenant_id,
            session_id = %session_id,
            references = analysis.evidence_references.len(),
            confidence = analysis.confidence,
            "analysis complete"
        );
        Ok(analysis)
    }
}

/// Enforce the analysis contract: non-empty answer, citations that index into
/// the supplied evidence, confidence in `[0, 1]`.
fn validate(raw: RawAnalysis, evidence_len: usize) -> Result<Analysis, ProviderError> {
    let answer = raw.answer.trim().to_string();
    if answer.is_empty() {
        return Err(ProviderError::malformed(SCHEMA_NAME, "empty answer"));
    }

    let mut references = Vec::new();
    for cited in raw.evidence_references {
        let Some(index) = cited
            .checked_sub(1)
            .and_then(|i| usize::try_from(i).ok())
        else {
            continue;
        };
        if index < evidence_len && !references.contains(&index) {
            references.push(index);
        }
    }

    let key_insights = raw
        .key_insights
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let confidence = raw
        .confidence
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0));

    Ok(Analysis {
        answer,
        key_insights,
        evidence_references: references,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(refs: Vec<i64>, confidence: Option<f32>) -> RawAnalysis {
        RawAnalysis {
            answer: "  Logs are kept for 90 days.  ".into(),
            key_insights: vec!["90 days".into(), "  ".into()],
            evidence_references: refs,
            confidence,
        }
    }

    #[test]
    fn references_are_zero_based_and_in_range() {
        let analysis = validate(raw(vec![1, 3, 3, 0, -2, 9], Some(0.8)), 3).unwrap();
        assert_eq!(analysis.evidence_references, vec![0, 2]);
        assert_eq!(analysis.answer, "Logs are kept for 90 days.");
        assert_eq!(analysis.key_insights, vec!["90 days".to_string()]);
    }

    #[test]
    fn no_evidence_means_no_references() {
        let analysis = validate(raw(vec![1, 2], None), 0).unwrap();
        assert!(analysis.evidence_references.is_empty());
        assert_eq!(analysis.confidence, None);
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(validate(raw(vec![], Some(1.7)), 0).unwrap().confidence, Some(1.0));
        assert_eq!(validate(raw(vec![], Some(-0.2)), 0).unwrap().confidence, Some(0.0));
        assert_eq!(validate(raw(vec![], Some(f32::NAN)), 0).unwrap().confidence, None);
    }

    #[test]
    fn empty_answer_is_malformed() {
        let mut r = raw(vec![], None);
        r.answer = "   ".into();
        assert!(matches!(
            validate(r, 0),
            Err(ProviderError::Malformed { .. })
        ));
    }

    #[test]
    fn schema_requires_every_field() {
        let schema = analysis_schema();
        assert_eq!(schema.name, "analysis");
        assert_eq!(schema.schema["required"].as_array().unwrap().len(), 4);
    }
}
