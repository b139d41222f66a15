//! Evidence access: nearest-neighbour search and chunk resolution.
//!
//! The vector index and the relational chunk table are external systems. This
//! module defines the contracts the retriever consumes plus in-memory
//! implementations used by tests and local demos.

pub mod qdrant;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use qdrant::{QdrantConfig, QdrantEvidenceStore};

// =============================================================================
// Document types
// =============================================================================

/// Category assigned to a document at ingestion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocType {
    Policy,
    Incident,
    Architecture,
    Runbook,
    #[serde(other)]
    Other,
}

impl DocType {
    pub const ALL: [DocType; 5] = [
        DocType::Policy,
        DocType::Incident,
        DocType::Architecture,
        DocType::Runbook,
        DocType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Policy => "POLICY",
            DocType::Incident => "INCIDENT",
            DocType::Architecture => "ARCHITECTURE",
            DocType::Runbook => "RUNBOOK",
            DocType::Other => "OTHER",
        }
    }

    /// The set used when no evidence tells us what to focus on.
    pub fn universal() -> BTreeSet<DocType> {
        DocType::ALL.into_iter().collect()
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = std::convert::Infallible;

    /// Lenient: unknown categories map to `Other`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "POLICY" | "POLICIES" => DocType::Policy,
            "INCIDENT" | "INCIDENTS" => DocType::Incident,
            "ARCHITECTURE" | "DESIGN" => DocType::Architecture,
            "RUNBOOK" | "RUNBOOKS" => DocType::Runbook,
            _ => DocType::Other,
        })
    }
}

// =============================================================================
// Search contract
// =============================================================================

/// Search constraints. All present constraints apply together.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchFilter {
    pub tenant_id: String,
    pub doc_types: Option<Vec<DocType>>,
    pub document_ids: Option<Vec<String>>,
}

impl SearchFilter {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            doc_types: None,
            document_ids: None,
        }
    }

    pub fn with_doc_types(mut self, doc_types: Vec<DocType>) -> Self {
        self.doc_types = Some(doc_types);
        self
    }

    pub fn with_document_ids(mut self, ids: Vec<String>) -> Self {
        self.document_ids = Some(ids);
        self
    }

    /// Whether a payload satisfies every constraint.
    pub fn matches(&self, payload: &HitPayload) -> bool {
        if payload.tenant_id != self.tenant_id {
            return false;
        }
        if let Some(types) = &self.doc_types {
            match payload.doc_type {
                Some(t) if types.contains(&t) => {}
                _ => return false,
            }
        }
        if let Some(ids) = &self.document_ids {
            if !ids.contains(&payload.document_id) {
                return false;
            }
        }
        true
    }
}

/// Metadata stored alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitPayload {
    /// Chunk identifier in the relational store. Falls back to the point id.
    #[serde(default)]
    pub chunk_id: Option<String>,
    pub tenant_id: String,
    pub document_id: String,
    #[serde(default)]
    pub doc_type: Option<DocType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: HitPayload,
}

impl SearchHit {
    pub fn chunk_id(&self) -> &str {
        self.payload.chunk_id.as_deref().unwrap_or(&self.id)
    }
}

/// A chunk as stored in the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub tenant_id: String,
    pub document_id: String,
    pub title: String,
    pub doc_type: DocType,
    pub text: String,
}

/// A retrieved chunk with its similarity score. Read-only downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceChunk {
    pub chunk_id: String,
    pub text: String,
    pub document_id: String,
    pub title: String,
    pub doc_type: DocType,
    pub score: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{backend} returned {status}: {message}")]
    Backend {
        backend: &'static str,
        status: u16,
        message: String,
    },
    #[error("invalid response from {backend}: {message}")]
    InvalidResponse {
        backend: &'static str,
        message: String,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("lock poisoned")]
    Poisoned,
}

/// Nearest-neighbour search over chunk embeddings.
///
/// Implementations must apply `filter` on the index side; results for other
/// tenants are a contract violation.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn search(
        &self,
        embedding: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EvidenceError>;
}

/// Resolves chunk identifiers to full records, scoped to one tenant.
#[async_trait]
pub trait ChunkResolver: Send + Sync {
    async fn resolve(
        &self,
        tenant_id: &str,
        chunk_ids: &[String],
    ) -> Result<Vec<ChunkRecord>, EvidenceError>;
}

// =============================================================================
// In-memory implementations
// =============================================================================

struct IndexedChunk {
    record: ChunkRecord,
    embedding: Vec<f32>,
}

/// Brute-force cosine search over chunks held in memory.
///
/// Implements both [`EvidenceStore`] and [`ChunkResolver`].
#[derive(Default)]
pub struct InMemoryEvidenceStore {
    chunks: RwLock<Vec<IndexedChunk>>,
}

impl InMemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ChunkRecord, embedding: Vec<f32>) -> Result<(), EvidenceError> {
        let mut chunks = self.chunks.write().map_err(|_| EvidenceError::Poisoned)?;
        chunks.retain(|c| c.record.chunk_id != record.chunk_id);
        chunks.push(IndexedChunk { record, embedding });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl EvidenceStore for InMemoryEvidenceStore {
    async fn search(
        &self,
        embedding: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EvidenceError> {
        let chunks = self.chunks.read().map_err(|_| EvidenceError::Poisoned)?;
        let mut hits: Vec<SearchHit> = chunks
            .iter()
            .map(|c| SearchHit {
                id: c.record.chunk_id.clone(),
                score: cosine(embedding, &c.embedding),
                payload: HitPayload {
                    chunk_id: Some(c.record.chunk_id.clone()),
                    tenant_id: c.record.tenant_id.clone(),
                    document_id: c.record.document_id.clone(),
                    doc_type: Some(c.record.doc_type),
                },
            })
            .filter(|hit| filter.matches(&hit.payload))
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(limit);
        Ok(hits)
    }
}

#[async_trait]
impl ChunkResolver for InMemoryEvidenceStore {
    async fn resolve(
        &self,
        tenant_id: &str,
        chunk_ids: &[String],
    ) -> Result<Vec<ChunkRecord>, EvidenceError> {
        let chunks = self.chunks.read().map_err(|_| EvidenceError::Poisoned)?;
        let by_id: HashMap<&str, &ChunkRecord> = chunks
            .iter()
            .filter(|c| c.record.tenant_id == tenant_id)
            .map(|c| (c.record.chunk_id.as_str(), &c.record))
            .collect();
        Ok(chunk_ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|r| (*r).clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, tenant: &str, doc: &str, doc_type: DocType) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.into(),
            tenant_id: tenant.into(),
            document_id: doc.into(),
            title: format!("{doc} title"),
            doc_type,
            text: format!("text of {id}"),
        }
    }

    #[test]
    fn doc_type_parsing_is_lenient() {
        assert_eq!("policy".parse::<DocType>().unwrap(), DocType::Policy);
        assert_eq!("Design".parse::<DocType>().unwrap(), DocType::Architecture);
        assert_eq!("spreadsheet".parse::<DocType>().unwrap(), DocType::Other);
        let parsed: DocType = serde_json::from_str("\"MEMO\"").unwrap();
        assert_eq!(parsed, DocType::Other);
    }

    #[test]
    fn filter_requires_every_constraint() {
        let payload = HitPayload {
            chunk_id: None,
            tenant_id: "acme".into(),
            document_id: "d1".into(),
            doc_type: Some(DocType::Policy),
        };
        assert!(SearchFilter::tenant("acme").matches(&payload));
        assert!(!SearchFilter::tenant("globex").matches(&payload));
        assert!(!SearchFilter::tenant("acme")
            .with_doc_types(vec![DocType::Incident])
            .matches(&payload));
        assert!(SearchFilter::tenant("acme")
            .with_doc_types(vec![DocType::Policy])
            .with_document_ids(vec!["d1".into()])
            .matches(&payload));
        assert!(!SearchFilter::tenant("acme")
            .with_document_ids(vec!["d2".into()])
            .matches(&payload));
    }

    #[tokio::test]
    async fn in_memory_search_is_tenant_scoped_and_ranked() {
        let store = InMemoryEvidenceStore::new();
        store
            .insert(record("c1", "acme", "d1", DocType::Policy), vec![1.0, 0.0])
            .unwrap();
        store
            .insert(record("c2", "acme", "d2", DocType::Incident), vec![0.6, 0.8])
            .unwrap();
        store
            .insert(record("c3", "globex", "d3", DocType::Policy), vec![1.0, 0.0])
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0], &SearchFilter::tenant("acme"), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);

        let resolved = store
            .resolve("acme", &["c3".to_string(), "c2".to_string()])
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].chunk_id, "c2");
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
