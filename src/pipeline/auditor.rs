//! Deterministic quality scoring of the draft answer.

use super::types::{Analysis, AuditResult};
use crate::config::AuditorConfig;
use crate::evidence::EvidenceChunk;

pub const MISSING_EVIDENCE: &str = "No supporting evidence was found in the document corpus";
pub const LOW_CONFIDENCE: &str = "Analyst confidence is low; the evidence may not fully cover the question";

#[derive(Debug, Clone, Default)]
pub struct Auditor {
    config: AuditorConfig,
}

impl Auditor {
    pub fn new(config: AuditorConfig) -> Self {
        Self { config }
    }

    pub fn audit(&self, _question: &str, evidence: &[EvidenceChunk], analysis: &Analysis) -> AuditResult {
        let grounding_check = !evidence.is_empty();
        let coverage_check = analysis.answer.trim().chars().count() >= self.config.min_answer_chars;
        let quality_score = analysis
            .confidence
            .unwrap_or(self.config.baseline_score)
            .clamp(0.0, 1.0);

        let mut missing_aspects = Vec::new();
        if !grounding_check {
            missing_aspects.push(MISSING_EVIDENCE.to_string());
        }
        if quality_score < self.config.low_confidence_threshold {
            missing_aspects.push(LOW_CONFIDENCE.to_string());
        }

        AuditResult {
            quality_score,
            grounding_check,
            coverage_check,
            missing_aspects,
        }
    }
}
