#![forbid(unsafe_code)]

//! # opsense-rag
//!
//! Agentic retrieval-augmented question answering over a tenant's private
//! document corpus (policies, incidents, architecture notes, runbooks).
//!
//! A question is embedded and matched against tenant-scoped evidence, then
//! passes a deterministic admission check, a retrieval-driven plan, one
//! structured synthesis call and a deterministic quality audit before the
//! final answer is composed. Every stage appends a [`pipeline::TraceStep`],
//! so a caller can see exactly how an answer was produced. Questions with
//! images, video or documents attached take a single multimodal call instead.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use opsense_rag::config::PipelineConfig;
//! use opsense_rag::evidence::InMemoryEvidenceStore;
//! use opsense_rag::gateway::{NoopUsageSink, ProviderGateway};
//! use opsense_rag::pipeline::{PipelineOrchestrator, Query};
//!
//! let provider = Arc::new(ProviderGateway::from_env(Arc::new(NoopUsageSink))?);
//! let corpus = Arc::new(InMemoryEvidenceStore::new());
//! let orchestrator = PipelineOrchestrator::from_config(
//!     &PipelineConfig::default(),
//!     provider,
//!     corpus.clone(),
//!     corpus,
//! )?;
//! let result = orchestrator
//!     .run_pipeline(&Query::new("What is our data retention policy?", "acme"))
//!     .await?;
//! println!("{} ({:.2})", result.answer, result.quality_score);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod evidence;
pub mod gateway;
pub mod pipeline;
pub mod prompts;
pub mod store;
pub mod telemetry;
pub mod trace;

pub use config::{ConfigError, PipelineConfig};
pub use evidence::{
    ChunkResolver, DocType, EvidenceChunk, EvidenceError, EvidenceStore, InMemoryEvidenceStore,
    QdrantEvidenceStore,
};
pub use gateway::{Attribution, CapabilityProvider, ProviderError, ProviderGateway, UsageSink};
pub use pipeline::{
    PipelineError, PipelineFailure, PipelineOrchestrator, PipelineResult, Query, SessionPersister,
    TraceStep,
};
pub use store::{SqliteChunkResolver, SqliteSessionStore, StoreError};
pub use trace::{JsonlTraceSink, MemoryTraceSink, TraceError, TraceSink, TraceWorker};
