//! Deterministic admission control. Never calls a provider.

use regex::{Regex, RegexBuilder};

use super::types::GatekeeperDecision;
use crate::config::GatekeeperConfig;
use crate::evidence::EvidenceChunk;

const REJECTION_GUIDANCE: &str = "This question appears to request inappropriate content \
(security attacks or other harmful activity). Please rephrase it as a question about \
your organisation's own documents, policies, or operations.";

pub struct Gatekeeper {
    harmful: Option<Regex>,
    vague_phrases: Vec<String>,
    min_question_chars: usize,
}

impl Gatekeeper {
    pub fn new(config: &GatekeeperConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            harmful: build_harmful_pattern(&config.harmful_keywords)?,
            vague_phrases: config
                .vague_phrases
                .iter()
                .map(|p| normalize(p))
                .filter(|p| !p.is_empty())
                .collect(),
            min_question_chars: config.min_question_chars,
        })
    }

    /// Classify a question. `evidence` is accepted for context but does not
    /// affect approval: missing evidence is the auditor's concern.
    pub fn evaluate(&self, question: &str, _evidence: &[EvidenceChunk]) -> GatekeeperDecision {
        if let Some(keyword) = self.harmful_match(question) {
            tracing::info!(keyword = %keyword, "question rejected by keyword policy");
            return GatekeeperDecision::Rejected {
                reason: REJECTION_GUIDANCE.to_string(),
            };
        }

        let trimmed = question.trim();
        if trimmed.chars().count() < self.min_question_chars {
            return GatekeeperDecision::NeedsClarification {
                question: format!(
                    "Your question is too short to answer reliably. Could you add more detail \
                     about what you need (at least {} characters)?",
                    self.min_question_chars
                ),
            };
        }

        let normalized = normalize(trimmed);
        if self.vague_phrases.iter().any(|p| *p == normalized) {
            return GatekeeperDecision::NeedsClarification {
                question: "Could you be more specific? For example, name the policy, system, \
                           or incident you are asking about."
                    .to_string(),
            };
        }

        GatekeeperDecision::Approved
    }

    fn harmful_match<'q>(&self, question: &'q str) -> Option<&'q str> {
        self.harmful
            .as_ref()
            .and_then(|re| re.find(question))
            .map(|m| m.as_str())
    }
}

/// One alternation of word-bounded keywords, allowing common suffixes
/// ("hacking", "steals") but not past tense. Multi-word keywords match any
/// whitespace run.
fn build_harmful_pattern(keywords: &[String]) -> Result<Option<Regex>, regex::Error> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|k| k.split_whitespace().map(regex::escape).collect::<Vec<_>>().join(r"\s+"))
        .filter(|k| !k.is_empty())
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    let pattern = format!(r"\b(?:{})(?:s|ing|er|ers)?\b", alternatives.join("|"));
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map(Some)
}

/// Lowercase, strip punctuation, collapse whitespace.
fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
