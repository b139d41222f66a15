//! Prompt templates for the synthesis stages.
//!
//! Domain logic for rendering analyst, multimodal, document and polishing
//! prompts. Provider-agnostic.

use crate::evidence::EvidenceChunk;
use crate::gateway::{ContentPart, Message};
use crate::pipeline::{AuditResult, Plan};

// =============================================================================
// Rendered prompts
// =============================================================================

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }

    /// System prompt plus a user message carrying binary parts.
    pub fn to_messages_with_parts(&self, parts: Vec<ContentPart>) -> Vec<Message> {
        vec![
            Message::system(&self.system),
            Message::user_with_parts(&self.user, parts),
        ]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Truncate to at most `budget` chars, never splitting a code point.
pub fn truncate_chars(text: &str, budget: usize) -> &str {
    match text.char_indices().nth(budget) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Numbered `<evidence>` block; indices are 1-based to match citations.
pub fn render_evidence(evidence: &[EvidenceChunk], budget: usize) -> String {
    if evidence.is_empty() {
        return "<evidence>\n(no matching documents were found)\n</evidence>".to_string();
    }
    let items: Vec<String> = evidence
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let text = chunk.text.trim();
            let excerpt = truncate_chars(text, budget);
            let ellipsis = if excerpt.len() < text.len() { "..." } else { "" };
            format!(
                "[{n}] <source title=\"{title}\" type=\"{doc_type}\">\n{body}{ellipsis}\n</source>",
                n = i + 1,
                title = escape_xml_chars(&chunk.title),
                doc_type = chunk.doc_type,
                body = escape_xml_chars(excerpt),
            )
        })
        .collect();
    format!("<evidence>\n{}\n</evidence>", items.join("\n\n"))
}

// =============================================================================
// Templates
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Single pass over the template, so substituted text is never rescanned
    /// for placeholders.
    fn fill(&self, replacements: &[(&str, &str)]) -> PromptInstance {
        let render = |template: &str| {
            let mut out = String::with_capacity(template.len());
            let mut rest = template;
            while let Some(start) = rest.find('{') {
                out.push_str(&rest[..start]);
                let tail = &rest[start..];
                match replacements.iter().find(|(key, _)| tail.starts_with(key)) {
                    Some((key, value)) => {
                        out.push_str(value);
                        rest = &tail[key.len()..];
                    }
                    None => {
                        out.push('{');
                        rest = &tail[1..];
                    }
                }
            }
            out.push_str(rest);
            out.trim().to_string()
        };
        PromptInstance {
            template_slug: self.slug,
            system: render(self.system),
            user: render(self.user),
        }
    }
}

pub const ANALYST_PROMPT: PromptTemplate = PromptTemplate {
    slug: "analyst_v1",
    system: r#"You are an operations analyst answering questions about an organisation's internal documents. Answer ONLY from the numbered evidence. If the evidence does not cover part of the question, say so plainly instead of guessing.

Return only JSON:
{"answer": "<markdown answer>", "key_insights": ["..."], "evidence_references": [1, 2], "confidence": 0.0-1.0}

evidence_references lists the 1-based numbers of the evidence items you relied on. confidence reflects how completely the evidence supports the answer."#,
    user: r#"<question>
{question}
</question>

<plan>{plan}</plan>

{evidence}

json:"#,
};

pub const MULTIMODAL_PROMPT: PromptTemplate = PromptTemplate {
    slug: "multimodal_v1",
    system: r#"You are an operations analyst. Answer the question using the attached media and, where relevant, the supporting evidence. Describe only what is actually visible or audible; do not invent details.

Return only JSON: {"answer": "<markdown answer>", "confidence": 0.0-1.0}"#,
    user: r#"<question>
{question}
</question>

{media_count} attached media file(s) follow this message.

{evidence}

json:"#,
};

pub const DOCUMENT_PROMPT: PromptTemplate = PromptTemplate {
    slug: "document_v1",
    system: r#"You are an operations analyst. Answer the question using the attached document and, where relevant, the supporting evidence. Quote or cite the document where you can.

Return only JSON: {"answer": "<markdown answer>", "confidence": 0.0-1.0}"#,
    user: r#"<question>
{question}
</question>

<document name="{filename}">
{document}
</document>

{evidence}

json:"#,
};

pub const POLISH_PROMPT: PromptTemplate = PromptTemplate {
    slug: "polish_v1",
    system: r#"You are an editor finalising an answer for an operations team. Improve clarity and structure without adding facts that are not in the draft or the evidence. Where the review lists missing aspects, state briefly that the documents do not cover them.

Return only the final answer as markdown."#,
    user: r#"<question>
{question}
</question>

<draft>
{draft}
</draft>

<review score="{score}">
{missing}
</review>

{evidence}"#,
};

// =============================================================================
// Renderers
// =============================================================================

pub fn render_analyst(
    question: &str,
    evidence: &[EvidenceChunk],
    plan: &Plan,
    budget: usize,
) -> PromptInstance {
    let focus: Vec<&str> = plan.focus.iter().map(|t| t.as_str()).collect();
    let plan_text = format!(
        "strategy={}; focus={}",
        plan.strategy.as_str(),
        focus.join(",")
    );
    ANALYST_PROMPT.fill(&[
        ("{plan}", &plan_text),
        ("{evidence}", &render_evidence(evidence, budget)),
        ("{question}", &escape_xml_chars(question.trim())),
    ])
}

pub fn render_multimodal(
    question: &str,
    media_count: usize,
    evidence: &[EvidenceChunk],
    budget: usize,
) -> PromptInstance {
    MULTIMODAL_PROMPT.fill(&[
        ("{media_count}", &media_count.to_string()),
        ("{evidence}", &render_evidence(evidence, budget)),
        ("{question}", &escape_xml_chars(question.trim())),
    ])
}

/// `inline_text` is the document body for text formats; binary documents are
/// attached as a file part instead.
pub fn render_document(
    question: &str,
    filename: &str,
    inline_text: Option<&str>,
    evidence: &[EvidenceChunk],
    budget: usize,
) -> PromptInstance {
    let document = match inline_text {
        Some(text) => escape_xml_chars(text),
        None => "(attached as a file)".to_string(),
    };
    DOCUMENT_PROMPT.fill(&[
        ("{filename}", &escape_xml_chars(filename)),
        ("{document}", &document),
        ("{evidence}", &render_evidence(evidence, budget)),
        ("{question}", &escape_xml_chars(question.trim())),
    ])
}

pub fn render_polish(
    question: &str,
    draft: &str,
    audit: &AuditResult,
    evidence: &[EvidenceChunk],
    budget: usize,
) -> PromptInstance {
    let missing = if audit.missing_aspects.is_empty() {
        "No gaps reported.".to_string()
    } else {
        audit
            .missing_aspects
            .iter()
            .map(|m| format!("- {}", escape_xml_chars(m)))
            .collect::<Vec<_>>()
            .join("\n")
    };
    POLISH_PROMPT.fill(&[
        ("{draft}", &escape_xml_chars(draft.trim())),
        ("{score}", &format!("{:.2}", audit.quality_score)),
        ("{missing}", &missing),
        ("{evidence}", &render_evidence(evidence, budget)),
        ("{question}", &escape_xml_chars(question.trim())),
    ])
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::DocType;
    use crate::pipeline::SearchStrategy;

    fn chunk(title: &str, text: &str) -> EvidenceChunk {
        EvidenceChunk {
            chunk_id: "c1".into(),
            text: text.into(),
            document_id: "d1".into(),
            title: title.into(),
            doc_type: DocType::Policy,
            score: 0.9,
        }
    }

    fn plan() -> Plan {
        Plan {
            focus: [DocType::Policy].into_iter().collect(),
            strategy: SearchStrategy::Broad,
            sub_queries: vec![],
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("short", 50), "short");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
    }

    #[test]
    fn analyst_prompt_numbers_and_truncates_evidence() {
        let long = "x".repeat(1_000);
        let p = render_analyst(
            "What is retained?",
            &[chunk("Retention", "Logs are kept 90 days."), chunk("Other", &long)],
            &plan(),
            450,
        );
        assert_eq!(p.template_slug, "analyst_v1");
        assert!(p.user.contains("[1] <source title=\"Retention\" type=\"POLICY\">"));
        assert!(p.user.contains("[2] <source"));
        assert!(p.user.contains(&format!("{}...", "x".repeat(450))));
        assert!(!p.user.contains(&"x".repeat(451)));
        assert!(p.user.contains("strategy=broad; focus=POLICY"));
    }

    #[test]
    fn empty_evidence_is_stated() {
        let p = render_analyst("What is retained?", &[], &plan(), 450);
        assert!(p.user.contains("no matching documents"));
    }

    #[test]
    fn xml_escaping() {
        let p = render_analyst(
            "<script>alert('x')</script>",
            &[chunk("</source>", "body")],
            &plan(),
            450,
        );
        assert!(p.user.contains("&lt;script&gt;"));
        assert!(!p.user.contains("<script>"));
        assert!(p.user.contains("title=\"&lt;/source&gt;\""));
    }

    #[test]
    fn placeholders_in_user_text_are_not_expanded() {
        let p = render_analyst("What does {evidence} mean?", &[], &plan(), 450);
        assert!(p.user.contains("What does {evidence} mean?"));
    }

    #[test]
    fn polish_prompt_lists_missing_aspects() {
        let audit = AuditResult {
            quality_score: 0.4,
            grounding_check: false,
            coverage_check: true,
            missing_aspects: vec!["No supporting evidence".into()],
        };
        let p = render_polish("q", "draft", &audit, &[], 450);
        assert!(p.user.contains("score=\"0.40\""));
        assert!(p.user.contains("- No supporting evidence"));
    }

    #[test]
    fn document_prompt_inlines_text_only() {
        let inline = render_document("q", "notes.md", Some("# Notes"), &[], 450);
        assert!(inline.user.contains("# Notes"));
        let binary = render_document("q", "report.pdf", None, &[], 450);
        assert!(binary.user.contains("(attached as a file)"));
    }
}
