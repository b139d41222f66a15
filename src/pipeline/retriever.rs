//! Question embedding and tenant-scoped evidence retrieval.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::time::timeout;
use uuid::Uuid;

use super::error::PipelineError;
use super::retry::RetryPolicy;
use super::types::{DocumentRef, StageName};
use crate::evidence::{ChunkRecord, ChunkResolver, DocType, EvidenceChunk, EvidenceStore, SearchFilter};
use crate::gateway::{Attribution, CapabilityProvider, EmbedModel, EmbedRequest, ProviderError};

/// Embedding model handle, constructed once at startup and shared.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn CapabilityProvider>,
    model: EmbedModel,
}

impl Embedder {
    pub fn new(provider: Arc<dyn CapabilityProvider>, model: EmbedModel) -> Self {
        Self { provider, model }
    }

    pub fn model(&self) -> EmbedModel {
        self.model
    }

    pub async fn embed(&self, text: &str, attribution: Attribution) -> Result<Vec<f32>, ProviderError> {
        let resp = self
            .provider
            .embed(EmbedRequest::single(self.model, text, attribution))
            .await?;
        resp.embeddings
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProviderError::malformed("embedding", "provider returned no vector"))
    }
}

/// What to retrieve for one pass.
#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    pub question: &'a str,
    pub tenant_id: &'a str,
    /// Falls back to the retriever default; always clamped to `[1, max_limit]`.
    pub limit: Option<usize>,
    pub doc_types: Option<Vec<DocType>>,
    pub session_id: Option<Uuid>,
}

impl<'a> RetrievalRequest<'a> {
    pub fn new(question: &'a str, tenant_id: &'a str) -> Self {
        Self {
            question,
            tenant_id,
            limit: None,
            doc_types: None,
            session_id: None,
        }
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn doc_types(mut self, types: Vec<DocType>) -> Self {
        self.doc_types = Some(types);
        self
    }

    pub fn session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Evidence for one pass, sorted by descending score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Retrieval {
    pub chunks: Vec<EvidenceChunk>,
    /// Distinct source documents, in order of their best chunk.
    pub documents: Vec<DocumentRef>,
    pub mean_score: f32,
    /// The limit actually applied after clamping.
    pub limit: usize,
}

impl Retrieval {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn document_ids(&self) -> HashSet<&str> {
        self.documents.iter().map(|d| d.id.as_str()).collect()
    }

    pub fn summary(&self) -> String {
        if self.chunks.is_empty() {
            return "No matching evidence found".to_string();
        }
        format!(
            "Retrieved {} chunks from {} documents (mean score {:.2})",
            self.chunks.len(),
            self.documents.len(),
            self.mean_score
        )
    }
}

pub struct Retriever {
    embedder: Embedder,
    store: Arc<dyn EvidenceStore>,
    resolver: Arc<dyn ChunkResolver>,
    default_limit: usize,
    max_limit: usize,
    policy: RetryPolicy,
}

impl Retriever {
    pub fn new(
        embedder: Embedder,
        store: Arc<dyn EvidenceStore>,
        resolver: Arc<dyn ChunkResolver>,
    ) -> Self {
        Self {
            embedder,
            store,
            resolver,
            default_limit: 5,
            max_limit: crate::config::MAX_RETRIEVAL_LIMIT,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_limits(mut self, default_limit: usize, max_limit: usize) -> Self {
        self.max_limit = max_limit.clamp(1, crate::config::MAX_RETRIEVAL_LIMIT);
        self.default_limit = default_limit.clamp(1, self.max_limit);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_limit(&self) -> usize {
        self.max_limit
    }

    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit)
    }

    pub async fn retrieve(&self, req: RetrievalRequest<'_>) -> Result<Retrieval, PipelineError> {
        const STAGE: StageName = StageName::Retriever;
        let limit = self.effective_limit(req.limit);

        let mut attribution = Attribution::new("pipeline::retriever").with_tenant(req.tenant_id);
        if let Some(session_id) = req.session_id {
            attribution = attribution.with_session(session_id);
        }
        let embedding = self
            .policy
            .run(STAGE, || self.embedder.embed(req.question, attribution.clone()))
            .await?;

        let mut filter = SearchFilter::tenant(req.tenant_id);
        if let Some(types) = req.doc_types.clone().filter(|t| !t.is_empty()) {
            filter = filter.with_doc_types(types);
        }

        let hits = timeout(
            self.policy.call_timeout,
            self.store.search(&embedding, &filter, limit),
        )
        .await
        .map_err(|_| PipelineError::unhandled(STAGE, "evidence search timed out"))?
        .map_err(|e| {
            tracing::error!(tenant = req.tenant_id, error = %e, "evidence search failed");
            PipelineError::unhandled(STAGE, format!("evidence search failed: {e}"))
        })?;

        if hits.is_empty() {
            tracing::debug!(tenant = req.tenant_id, "evidence search returned no hits");
            return Ok(Retrieval {
                limit,
                ..Retrieval::default()
            });
        }

        // Best score per chunk, scoped to the requesting tenant.
        let mut scores: HashMap<String, f32> = HashMap::new();
        for hit in &hits {
            if hit.payload.tenant_id != req.tenant_id {
                tracing::warn!(
                    tenant = req.tenant_id,
                    hit_tenant = %hit.payload.tenant_id,
                    chunk = hit.chunk_id(),
                    "dropping cross-tenant search hit"
                );
                continue;
            }
            let entry = scores.entry(hit.chunk_id().to_string()).or_insert(hit.score);
            if hit.score > *entry {
                *entry = hit.score;
            }
        }
        let mut ids: Vec<String> = scores.keys().cloned().collect();
        ids.sort();

        let records = timeout(
            self.policy.call_timeout,
            self.resolver.resolve(req.tenant_id, &ids),
        )
        .await
        .map_err(|_| PipelineError::unhandled(STAGE, "chunk resolution timed out"))?
        .map_err(|e| {
            tracing::error!(tenant = req.tenant_id, error = %e, "chunk resolution failed");
            PipelineError::unhandled(STAGE, format!("chunk resolution failed: {e}"))
        })?;

        let retrieval = assemble(req.tenant_id, &scores, records, limit);
        tracing::debug!(
            tenant = req.tenant_id,
            hits = hits.len(),
            chunks = retrieval.len(),
            documents = retrieval.documents.len(),
            "retrieval complete"
        );
        Ok(retrieval)
    }
}

fn assemble(
    tenant_id: &str,
    scores: &HashMap<String, f32>,
    records: Vec<ChunkRecord>,
    limit: usize,
) -> Retrieval {
    let mut seen = HashSet::new();
    let mut chunks: Vec<EvidenceChunk> = records
        .into_iter()
        .filter(|r| r.tenant_id == tenant_id)
        .filter_map(|r| {
            let score = *scores.get(&r.chunk_id)?;
            seen.insert(r.chunk_id.clone()).then(|| EvidenceChunk {
                chunk_id: r.chunk_id,
                text: r.text,
                document_id: r.document_id,
                title: r.title,
                doc_type: r.doc_type,
                score,
            })
        })
        .collect();

    chunks.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    chunks.truncate(limit);

    let mut doc_seen = HashSet::new();
    let documents = chunks
        .iter()
        .filter(|c| doc_seen.insert(c.document_id.clone()))
        .map(|c| DocumentRef {
            id: c.document_id.clone(),
            title: c.title.clone(),
        })
        .collect();

    let mean_score = if chunks.is_empty() {
        0.0
    } else {
        chunks.iter().map(|c| c.score).sum::<f32>() / chunks.len() as f32
    };

    Retrieval {
        chunks,
        documents,
        mean_score,
        limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, tenant: &str, doc: &str) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.into(),
            tenant_id: tenant.into(),
            document_id: doc.into(),
            title: format!("Title {doc}"),
            doc_type: DocType::Policy,
            text: format!("body {id}"),
        }
    }

    #[test]
    fn assemble_sorts_dedupes_and_scopes() {
        let scores: HashMap<String, f32> = [("a", 0.5), ("b", 0.9), ("c", 0.5), ("x", 0.99)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let records = vec![
            record("c", "acme", "d2"),
            record("a", "acme", "d1"),
            record("b", "acme", "d1"),
            record("b", "acme", "d1"),
            record("x", "globex", "d9"),
            record("unscored", "acme", "d3"),
        ];
        let retrieval = assemble("acme", &scores, records, 8);

        let ids: Vec<&str> = retrieval.chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        let docs: Vec<&str> = retrieval.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(docs, vec!["d1", "d2"]);
        assert!((retrieval.mean_score - (0.9 + 0.5 + 0.5) / 3.0).abs() < 1e-6);
    }

    #[test]
    fn assemble_truncates_to_limit() {
        let scores: HashMap<String, f32> = (0..6).map(|i| (format!("c{i}"), i as f32 / 10.0)).collect();
        let records = (0..6).map(|i| record(&format!("c{i}"), "acme", "d")).collect();
        let retrieval = assemble("acme", &scores, records, 2);
        assert_eq!(retrieval.len(), 2);
        assert_eq!(retrieval.chunks[0].chunk_id, "c5");
    }

    #[test]
    fn empty_retrieval_summary() {
        let retrieval = Retrieval::default();
        assert!(retrieval.is_empty());
        assert_eq!(retrieval.summary(), "No matching evidence found");
    }
}
