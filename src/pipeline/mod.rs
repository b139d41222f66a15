//! Agentic query pipeline.
//!
//! A question flows through retrieval, admission control, planning,
//! synthesis, auditing and final composition; questions with attachments
//! take the multimodal branch instead. See [`orchestrator`] for the state
//! machine that drives the stages.

pub mod analyst;
pub mod auditor;
pub mod error;
pub mod gatekeeper;
pub mod multimodal;
pub mod orchestrator;
pub mod planner;
pub mod retriever;
pub mod retry;
pub mod types;
pub mod writer;

pub use analyst::Analyst;
pub use auditor::Auditor;
pub use error::{PipelineError, PipelineFailure};
pub use gatekeeper::Gatekeeper;
pub use multimodal::{MultimodalBranch, MultimodalOutcome};
pub use orchestrator::{NoopPersister, PipelineOrchestrator, PipelineState, SessionPersister};
pub use planner::Planner;
pub use retriever::{Embedder, Retrieval, RetrievalRequest, Retriever};
pub use retry::RetryPolicy;
pub use types::*;
pub use writer::{PassthroughWriter, PolishingWriter, Writer, WriterInput};
