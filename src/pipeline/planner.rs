//! Strategy selection from the evidence actually retrieved.

use std::collections::BTreeSet;

use super::types::{Plan, SearchStrategy};
use crate::evidence::{DocType, EvidenceChunk};

#[derive(Debug, Clone)]
pub struct Planner {
    focused_threshold: usize,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(5)
    }
}

impl Planner {
    pub fn new(focused_threshold: usize) -> Self {
        Self {
            focused_threshold: focused_threshold.max(1),
        }
    }

    pub fn plan(&self, _question: &str, evidence: &[EvidenceChunk]) -> Plan {
        let strategy = match evidence.len() {
            0 => SearchStrategy::Comprehensive,
            n if n >= self.focused_threshold => SearchStrategy::Focused,
            _ => SearchStrategy::Broad,
        };
        let focus: BTreeSet<DocType> = if evidence.is_empty() {
            DocType::universal()
        } else {
            evidence.iter().map(|c| c.doc_type).collect()
        };
        Plan {
            focus,
            strategy,
            sub_queries: Vec::new(),
        }
    }

    /// Plan for a re-analysis pass: one step broader over every type.
    pub fn widened(&self, previous: &Plan) -> Plan {
        Plan {
            focus: DocType::universal(),
            strategy: previous.strategy.widen(),
            sub_queries: previous.sub_queries.clone(),
        }
    }
}

pub fn describe(plan: &Plan) -> String {
    let focus: Vec<&str> = plan.focus.iter().map(|t| t.as_str()).collect();
    format!("{} strategy over {}", plan.strategy.as_str(), focus.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc_type: DocType) -> EvidenceChunk {
        EvidenceChunk {
            chunk_id: "c".into(),
            text: "t".into(),
            document_id: "d".into(),
            title: "T".into(),
            doc_type,
            score: 0.5,
        }
    }

    #[test]
    fn empty_evidence_is_comprehensive_over_everything() {
        let plan = Planner::default().plan("q", &[]);
        assert_eq!(plan.strategy, SearchStrategy::Comprehensive);
        assert_eq!(plan.focus, DocType::universal());
        assert!(plan.sub_queries.is_empty());
    }

    #[test]
    fn strategy_tracks_evidence_count() {
        let planner = Planner::default();
        let few = vec![chunk(DocType::Incident), chunk(DocType::Policy)];
        let plan = planner.plan("q", &few);
        assert_eq!(plan.strategy, SearchStrategy::Broad);
        assert_eq!(
            plan.focus.into_iter().collect::<Vec<_>>(),
            vec![DocType::Policy, DocType::Incident]
        );

        let many = vec![chunk(DocType::Policy); 5];
        let plan = planner.plan("q", &many);
        assert_eq!(plan.strategy, SearchStrategy::Focused);
        assert_eq!(plan.focus.len(), 1);
    }

    #[test]
    fn widened_plan_covers_all_types() {
        let planner = Planner::default();
        let plan = planner.plan("q", &vec![chunk(DocType::Runbook); 5]);
        let wider = planner.widened(&plan);
        assert_eq!(wider.strategy, SearchStrategy::Broad);
        assert_eq!(wider.focus, DocType::universal());
        assert_eq!(describe(&wider), "broad strategy over POLICY, INCIDENT, ARCHITECTURE, RUNBOOK, OTHER");
    }
}
