//! Pipeline state machine.
//!
//! ```text
//! RETRIEVING -> GATEKEEPING -> PLANNING -> ANALYZING -> AUDITING -> WRITING -> DONE
//!                    |                                     |
//!                    +-> REJECTED / CLARIFICATION_NEEDED   +-> RETRIEVING (quality gate)
//! MULTIMODAL -> DONE
//! any stage  -> FAILED
//! ```
//!
//! Every executed state appends exactly one trace step, including failures.
//! Runs share nothing mutable, so one orchestrator serves concurrent queries.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::Instrument;
use uuid::Uuid;

use super::analyst::Analyst;
use super::auditor::Auditor;
use super::error::{PipelineError, PipelineFailure};
use super::gatekeeper::Gatekeeper;
use super::multimodal::MultimodalBranch;
use super::planner::{self, Planner};
use super::retriever::{Embedder, Retrieval, RetrievalRequest, Retriever};
use super::retry::RetryPolicy;
use super::types::*;
use super::writer::{PassthroughWriter, PolishingWriter, Writer, WriterInput};
use crate::config::{ConfigError, PipelineConfig, QualityGateConfig};
use crate::evidence::{ChunkResolver, EvidenceStore};
use crate::gateway::CapabilityProvider;
use crate::store::StoreError;
use crate::trace::{TraceRecorder, TraceSink};

// =============================================================================
// Collaborators
// =============================================================================

/// Stores completed runs. Called once per successful run.
#[async_trait]
pub trait SessionPersister: Send + Sync {
    async fn save(&self, query: &Query, result: &PipelineResult) -> Result<Uuid, StoreError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersister;

#[async_trait]
impl SessionPersister for NoopPersister {
    async fn save(&self, _query: &Query, result: &PipelineResult) -> Result<Uuid, StoreError> {
        Ok(result.session_id)
    }
}

// =============================================================================
// States
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Retrieving,
    Gatekeeping,
    Planning,
    Analyzing,
    Auditing,
    Writing,
    Done,
    Rejected,
    ClarificationNeeded,
    Failed,
    Multimodal,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Retrieving => "RETRIEVING",
            PipelineState::Gatekeeping => "GATEKEEPING",
            PipelineState::Planning => "PLANNING",
            PipelineState::Analyzing => "ANALYZING",
            PipelineState::Auditing => "AUDITING",
            PipelineState::Writing => "WRITING",
            PipelineState::Done => "DONE",
            PipelineState::Rejected => "REJECTED",
            PipelineState::ClarificationNeeded => "CLARIFICATION_NEEDED",
            PipelineState::Failed => "FAILED",
            PipelineState::Multimodal => "MULTIMODAL",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done
                | PipelineState::Rejected
                | PipelineState::ClarificationNeeded
                | PipelineState::Failed
        )
    }

    /// Stage whose trace step this state produces.
    pub fn stage(&self) -> Option<StageName> {
        match self {
            PipelineState::Retrieving => Some(StageName::Retriever),
            PipelineState::Gatekeeping => Some(StageName::Gatekeeper),
            PipelineState::Planning => Some(StageName::Planner),
            PipelineState::Analyzing => Some(StageName::Analyst),
            PipelineState::Auditing => Some(StageName::Auditor),
            PipelineState::Writing => Some(StageName::Writer),
            PipelineState::Multimodal => Some(StageName::MultimodalAnalysis),
            _ => None,
        }
    }
}

/// One retrieve/plan/analyse/audit pass.
#[derive(Debug, Clone)]
struct Candidate {
    retrieval: Retrieval,
    analysis: Analysis,
    audit: AuditResult,
}

/// State plus the data it carries into the next transition.
enum Transition {
    Retrieving { pass: u32, previous_plan: Option<Plan> },
    Gatekeeping { retrieval: Retrieval },
    Planning { pass: u32, retrieval: Retrieval, previous_plan: Option<Plan> },
    Analyzing { pass: u32, retrieval: Retrieval, plan: Plan },
    Auditing { pass: u32, retrieval: Retrieval, plan: Plan, analysis: Analysis },
    Writing { candidate: Candidate },
    Multimodal,
    Done { answer: String, quality_score: f32 },
    Rejected { reason: String },
    ClarificationNeeded { question: String },
    Failed(PipelineError),
}

impl Transition {
    fn state(&self) -> PipelineState {
        match self {
            Transition::Retrieving { .. } => PipelineState::Retrieving,
            Transition::Gatekeeping { .. } => PipelineState::Gatekeeping,
            Transition::Planning { .. } => PipelineState::Planning,
            Transition::Analyzing { .. } => PipelineState::Analyzing,
            Transition::Auditing { .. } => PipelineState::Auditing,
            Transition::Writing { .. } => PipelineState::Writing,
            Transition::Multimodal => PipelineState::Multimodal,
            Transition::Done { .. } => PipelineState::Done,
            Transition::Rejected { .. } => PipelineState::Rejected,
            Transition::ClarificationNeeded { .. } => PipelineState::ClarificationNeeded,
            Transition::Failed(_) => PipelineState::Failed,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct PipelineOrchestrator {
    retriever: Arc<Retriever>,
    gatekeeper: Gatekeeper,
    planner: Planner,
    analyst: Analyst,
    auditor: Auditor,
    writer: Arc<dyn Writer>,
    multimodal: MultimodalBranch,
    persister: Arc<dyn SessionPersister>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    gate: QualityGateConfig,
    policy: RetryPolicy,
}

impl PipelineOrchestrator {
    /// Wire every stage from one validated configuration.
    pub fn from_config(
        config: &PipelineConfig,
        provider: Arc<dyn CapabilityProvider>,
        store: Arc<dyn EvidenceStore>,
        resolver: Arc<dyn ChunkResolver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = RetryPolicy::from_config(config);

        let embedder = Embedder::new(provider.clone(), config.retrieval.embed_model);
        let retriever = Arc::new(
            Retriever::new(embedder, store, resolver)
                .with_limits(config.retrieval.default_limit, config.retrieval.max_limit)
                .with_policy(policy),
        );

        let gatekeeper = Gatekeeper::new(&config.gatekeeper).map_err(|e| ConfigError::Invalid {
            field: "gatekeeper.harmful_keywords",
            message: e.to_string(),
        })?;

        let writer: Arc<dyn Writer> = if config.writer.polish {
            Arc::new(
                PolishingWriter::new(provider.clone(), config.writer_model())
                    .with_policy(policy)
                    .with_chunk_budget(config.analyst.chunk_char_budget),
            )
        } else {
            Arc::new(PassthroughWriter)
        };

        let multimodal = MultimodalBranch::new(provider.clone(), config.multimodal.clone())
            .with_retriever(retriever.clone())
            .with_policy(policy)
            .with_scoring(
                config.analyst.chunk_char_budget,
                config.auditor.baseline_score,
            );

        Ok(Self {
            retriever,
            gatekeeper,
            planner: Planner::new(config.planner.focused_threshold),
            analyst: Analyst::new(provider, config.analyst.clone()).with_policy(policy),
            auditor: Auditor::new(config.auditor.clone()),
            writer,
            multimodal,
            persister: Arc::new(NoopPersister),
            trace_sink: None,
            gate: config.quality_gate.clone(),
            policy,
        })
    }

    pub fn with_persister(mut self, persister: Arc<dyn SessionPersister>) -> Self {
        self.persister = persister;
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn Writer>) -> Self {
        self.writer = writer;
        self
    }

    /// Run one query to completion.
    ///
    /// Returns exactly one of a completed result or a typed failure; either
    /// way the trace records every state that executed.
    pub async fn run_pipeline(&self, query: &Query) -> Result<PipelineResult, PipelineFailure> {
        let session_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "pipeline",
            session_id = %session_id,
            tenant = %query.tenant_id,
        );
        self.run_session(query, session_id).instrument(span).await
    }

    async fn run_session(
        &self,
        query: &Query,
        session_id: Uuid,
    ) -> Result<PipelineResult, PipelineFailure> {
        let mut trace = TraceRecorder::new(session_id, &query.tenant_id, self.trace_sink.clone());

        if query.tenant_id.trim().is_empty() {
            return Err(PipelineFailure {
                session_id,
                error: PipelineError::InvalidInput("tenant id is required".into()),
                trace: trace.into_steps(),
            });
        }

        tracing::info!(
            attachments = query.attachments.len(),
            multimodal = query.has_attachments(),
            "pipeline started"
        );

        let mut state = if query.has_attachments() {
            Transition::Multimodal
        } else {
            Transition::Retrieving {
                pass: 0,
                previous_plan: None,
            }
        };
        let mut best: Option<Candidate> = None;

        loop {
            let current = state.state();
            tracing::debug!(state = current.as_str(), "entering state");

            let next = match state {
                Transition::Retrieving { pass, previous_plan } => {
                    self.retrieving(query, session_id, pass, previous_plan, &mut trace)
                        .await
                }
                Transition::Gatekeeping { retrieval } => {
                    Ok(self.gatekeeping(query, retrieval, &mut trace))
                }
                Transition::Planning {
                    pass,
                    retrieval,
                    previous_plan,
                } => Ok(self.planning(query, pass, retrieval, previous_plan, &mut trace)),
                Transition::Analyzing {
                    pass,
                    retrieval,
                    plan,
                } => {
                    self.analyzing(query, session_id, pass, retrieval, plan, &mut trace)
                        .await
                }
                Transition::Auditing {
                    pass,
                    retrieval,
                    plan,
                    analysis,
                } => Ok(self.auditing(query, pass, retrieval, plan, analysis, &mut best, &mut trace)),
                Transition::Writing { candidate } => {
                    self.writing(query, session_id, candidate, &mut trace).await
                }
                Transition::Multimodal => {
                    let started = Instant::now();
                    self.multimodal
                        .run(query, session_id, &mut trace)
                        .await
                        .map(|outcome| {
                            tracing::debug!(
                                stage = %outcome.stage,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "multimodal branch complete"
                            );
                            Transition::Done {
                                answer: outcome.answer,
                                quality_score: outcome.quality_score,
                            }
                        })
                }
                Transition::Done {
                    answer,
                    quality_score,
                } => {
                    let result = PipelineResult {
                        session_id,
                        answer,
                        quality_score,
                        total_latency_ms: trace.total_latency_ms(),
                        trace: trace.into_steps(),
                    };
                    self.persist(query, &result).await;
                    tracing::info!(
                        quality_score = result.quality_score,
                        total_latency_ms = result.total_latency_ms,
                        steps = result.trace.len(),
                        "pipeline complete"
                    );
                    return Ok(result);
                }
                Transition::Rejected { reason } => {
                    return Err(self.fail(session_id, PipelineError::Rejected { reason }, trace));
                }
                Transition::ClarificationNeeded { question } => {
                    return Err(self.fail(
                        session_id,
                        PipelineError::ClarificationNeeded { question },
                        trace,
                    ));
                }
                Transition::Failed(error) => {
                    return Err(self.fail(session_id, error, trace));
                }
            };

            state = match next {
                Ok(next) => next,
                Err(error) => {
                    let stage = error
                        .stage()
                        .or_else(|| current.stage())
                        .unwrap_or(StageName::MultimodalAnalysis);
                    tracing::error!(
                        state = current.as_str(),
                        stage = %stage,
                        code = error.code(),
                        error = %error,
                        "stage failed"
                    );
                    trace.push(
                        TraceStep::new(stage, StepStatus::Error, format!("{stage} failed"))
                            .details(error.to_string()),
                    );
                    // A failed re-analysis pass falls back to the best audited answer.
                    match best.take() {
                        Some(candidate) => {
                            tracing::warn!(
                                stage = %stage,
                                quality_score = candidate.audit.quality_score,
                                "re-analysis pass failed; writing best audited answer"
                            );
                            Transition::Writing { candidate }
                        }
                        None => Transition::Failed(error),
                    }
                }
            };
        }
    }

    fn fail(&self, session_id: Uuid, error: PipelineError, trace: TraceRecorder) -> PipelineFailure {
        tracing::info!(code = error.code(), status = error.status_code(), "pipeline ended without an answer");
        PipelineFailure {
            session_id,
            error,
            trace: trace.into_steps(),
        }
    }

    // -------------------------------------------------------------------------
    // State handlers
    // -------------------------------------------------------------------------

    async fn retrieving(
        &self,
        query: &Query,
        session_id: Uuid,
        pass: u32,
        previous_plan: Option<Plan>,
        trace: &mut TraceRecorder,
    ) -> Result<Transition, PipelineError> {
        let started = Instant::now();
        let limit = self.pass_limit(query, pass);

        let retrieval = self
            .retriever
            .retrieve(
                RetrievalRequest::new(&query.question, &query.tenant_id)
                    .limit(Some(limit))
                    .session(session_id),
            )
            .await?;

        let mut details = format!("limit={}; pass={}", retrieval.limit, pass + 1);
        if !query.context_tags.is_empty() {
            details.push_str(&format!("; tags={}", query.context_tags.join(",")));
        }
        trace.push(
            TraceStep::new(StageName::Retriever, StepStatus::Success, retrieval.summary())
                .duration_ms(started.elapsed().as_millis() as u64)
                .documents(retrieval.documents.clone())
                .details(details),
        );

        // Re-analysis passes do not repeat admission control.
        Ok(if pass == 0 {
            Transition::Gatekeeping { retrieval }
        } else {
            Transition::Planning {
                pass,
                retrieval,
                previous_plan,
            }
        })
    }

    /// Retrieval limit for a pass: the query's limit widened per pass, capped.
    fn pass_limit(&self, query: &Query, pass: u32) -> usize {
        let base = self.retriever.effective_limit(query.limit);
        (base + pass as usize * self.gate.widen_step).min(self.retriever.max_limit())
    }

    fn gatekeeping(&self, query: &Query, retrieval: Retrieval, trace: &mut TraceRecorder) -> Transition {
        let started = Instant::now();
        let decision = self.gatekeeper.evaluate(&query.question, &retrieval.chunks);
        let elapsed = started.elapsed().as_millis() as u64;
        let details = format!("status={}", decision.status());

        match decision {
            GatekeeperDecision::Approved => {
                trace.push(
                    TraceStep::new(StageName::Gatekeeper, StepStatus::Success, "Question approved")
                        .duration_ms(elapsed)
                        .details(details),
                );
                Transition::Planning {
                    pass: 0,
                    retrieval,
                    previous_plan: None,
                }
            }
            GatekeeperDecision::Rejected { reason } => {
                trace.push(
                    TraceStep::new(StageName::Gatekeeper, StepStatus::Error, "Question rejected")
                        .duration_ms(elapsed)
                        .details(format!("{details}; reason={reason}")),
                );
                Transition::Rejected { reason }
            }
            GatekeeperDecision::NeedsClarification { question } => {
                trace.push(
                    TraceStep::new(
                        StageName::Gatekeeper,
                        StepStatus::Warning,
                        "Clarification needed",
                    )
                    .duration_ms(elapsed)
                    .details(format!("{details}; question={question}")),
                );
                Transition::ClarificationNeeded { question }
            }
        }
    }

    fn planning(
        &self,
        query: &Query,
        pass: u32,
        retrieval: Retrieval,
        previous_plan: Option<Plan>,
        trace: &mut TraceRecorder,
    ) -> Transition {
        let started = Instant::now();
        let plan = match &previous_plan {
            Some(previous) => self.planner.widened(previous),
            None => self.planner.plan(&query.question, &retrieval.chunks),
        };
        trace.push(
            TraceStep::new(StageName::Planner, StepStatus::Success, planner::describe(&plan))
                .duration_ms(started.elapsed().as_millis() as u64)
                .details(format!(
                    "evidence={}; widened={}",
                    retrieval.len(),
                    previous_plan.is_some()
                )),
        );
        Transition::Analyzing {
            pass,
            retrieval,
            plan,
        }
    }

    async fn analyzing(
        &self,
        query: &Query,
        session_id: Uuid,
        pass: u32,
        retrieval: Retrieval,
        plan: Plan,
        trace: &mut TraceRecorder,
    ) -> Result<Transition, PipelineError> {
        let started = Instant::now();
        let analysis = self
            .analyst
            .analyze(
                &query.question,
                &retrieval.chunks,
                &plan,
                &query.tenant_id,
                session_id,
            )
            .await?;

        let mut cited: Vec<DocumentRef> = Vec::new();
        for &i in &analysis.evidence_references {
            if let Some(chunk) = retrieval.chunks.get(i) {
                if !cited.iter().any(|d| d.id == chunk.document_id) {
                    cited.push(DocumentRef {
                        id: chunk.document_id.clone(),
                        title: chunk.title.clone(),
                    });
                }
            }
        }
        let confidence = analysis
            .confidence
            .map(|c| format!("{c:.2}"))
            .unwrap_or_else(|| "n/a".to_string());
        trace.push(
            TraceStep::new(
                StageName::Analyst,
                StepStatus::Success,
                format!(
                    "Drafted answer citing {} of {} evidence items",
                    analysis.evidence_references.len(),
                    retrieval.len()
                ),
            )
            .duration_ms(started.elapsed().as_millis() as u64)
            .documents(cited)
            .details(format!(
                "confidence={confidence}; insights={}",
                analysis.key_insights.len()
            )),
        );

        Ok(Transition::Auditing {
            pass,
            retrieval,
            plan,
            analysis,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn auditing(
        &self,
        query: &Query,
        pass: u32,
        retrieval: Retrieval,
        plan: Plan,
        analysis: Analysis,
        best: &mut Option<Candidate>,
        trace: &mut TraceRecorder,
    ) -> Transition {
        let started = Instant::now();
        let audit = self.auditor.audit(&query.question, &retrieval.chunks, &analysis);
        let threshold = self.gate.acceptance_threshold;
        let can_widen = self.pass_limit(query, pass + 1) > self.pass_limit(query, pass);
        let passes_left = pass < self.gate.max_reanalysis_passes;
        let reanalyze = audit.needs_reanalysis(threshold) && passes_left && can_widen;

        let gate = if audit.passes_gate(threshold) {
            "passed".to_string()
        } else if reanalyze {
            format!("reanalyze (pass {} of {})", pass + 2, self.gate.max_reanalysis_passes + 1)
        } else if audit.missing_aspects.is_empty() || (passes_left && !can_widen) {
            "below threshold; nothing to widen".to_string()
        } else {
            "below threshold; no passes left".to_string()
        };
        let status = if audit.passes_gate(threshold) {
            StepStatus::Success
        } else {
            StepStatus::Warning
        };
        let mut details = format!(
            "score={:.2}; threshold={threshold:.2}; grounding={}; coverage={}; gate={gate}",
            audit.quality_score, audit.grounding_check, audit.coverage_check
        );
        if !audit.missing_aspects.is_empty() {
            details.push_str(&format!("; missing={}", audit.missing_aspects.join(" | ")));
        }
        trace.push(
            TraceStep::new(
                StageName::Auditor,
                status,
                format!("Quality score {:.2}", audit.quality_score),
            )
            .duration_ms(started.elapsed().as_millis() as u64)
            .details(details),
        );

        let candidate = Candidate {
            retrieval,
            analysis,
            audit,
        };
        let keep = match best.as_ref() {
            Some(current) => candidate.audit.quality_score > current.audit.quality_score,
            None => true,
        };
        if keep {
            *best = Some(candidate);
        }

        if reanalyze {
            tracing::info!(pass = pass + 1, "quality gate failed; widening evidence");
            return Transition::Retrieving {
                pass: pass + 1,
                previous_plan: Some(plan),
            };
        }
        match best.take() {
            Some(candidate) => Transition::Writing { candidate },
            None => Transition::Failed(PipelineError::unhandled(
                StageName::Auditor,
                "no audited candidate available",
            )),
        }
    }

    async fn writing(
        &self,
        query: &Query,
        session_id: Uuid,
        candidate: Candidate,
        trace: &mut TraceRecorder,
    ) -> Result<Transition, PipelineError> {
        let started = Instant::now();
        let answer = self
            .writer
            .write(WriterInput {
                question: &query.question,
                analysis: &candidate.analysis,
                audit: &candidate.audit,
                evidence: &candidate.retrieval.chunks,
                tenant_id: &query.tenant_id,
                session_id,
            })
            .await?;

        trace.push(
            TraceStep::new(
                StageName::Writer,
                StepStatus::Success,
                format!("Final answer composed ({})", self.writer.name()),
            )
            .duration_ms(started.elapsed().as_millis() as u64)
            .documents(candidate.retrieval.documents.clone())
            .details(format!("chars={}", answer.chars().count())),
        );

        Ok(Transition::Done {
            answer,
            quality_score: candidate.audit.quality_score,
        })
    }

    async fn persist(&self, query: &Query, result: &PipelineResult) {
        match timeout(self.policy.call_timeout, self.persister.save(query, result)).await {
            Ok(Ok(id)) => tracing::debug!(stored_session = %id, "session persisted"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to persist session"),
            Err(_) => tracing::warn!("persisting session timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_metadata() {
        assert_eq!(PipelineState::Retrieving.stage(), Some(StageName::Retriever));
        assert_eq!(PipelineState::Done.stage(), None);
        assert!(PipelineState::Rejected.is_terminal());
        assert!(!PipelineState::Auditing.is_terminal());
        assert_eq!(PipelineState::ClarificationNeeded.as_str(), "CLARIFICATION_NEEDED");
    }
}
