//! Qdrant-compatible HTTP vector search.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{EvidenceError, EvidenceStore, HitPayload, SearchFilter, SearchHit};

const BACKEND: &str = "qdrant";

pub const DEFAULT_COLLECTION: &str = "document_chunks";

#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl QdrantConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }

    /// Reads `QDRANT_URL`, `QDRANT_COLLECTION` and `QDRANT_API_KEY`.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("QDRANT_URL").ok()?;
        let mut config = Self::new(url);
        if let Ok(collection) = std::env::var("QDRANT_COLLECTION") {
            config.collection = collection;
        }
        config.api_key = std::env::var("QDRANT_API_KEY").ok();
        Some(config)
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }
}

/// [`EvidenceStore`] backed by `POST /collections/{c}/points/search`.
#[derive(Debug, Clone)]
pub struct QdrantEvidenceStore {
    client: reqwest::Client,
    search_url: String,
}

impl QdrantEvidenceStore {
    pub fn new(config: QdrantConfig) -> Result<Self, EvidenceError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(key).map_err(|_| EvidenceError::InvalidResponse {
                backend: BACKEND,
                message: "invalid api key header value".into(),
            })?;
            headers.insert("api-key", value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            search_url: format!(
                "{}/collections/{}/points/search",
                config.url, config.collection
            ),
        })
    }
}

#[derive(Debug, Serialize)]
struct SearchBody<'a> {
    vector: &'a [f32],
    limit: usize,
    filter: Value,
    with_payload: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Value>,
}

/// Tenant plus optional doc-type / document-id constraints, all under `must`.
fn build_filter(filter: &SearchFilter) -> Value {
    let mut must = vec![json!({
        "key": "tenant_id",
        "match": { "value": filter.tenant_id },
    })];
    if let Some(types) = filter.doc_types.as_ref().filter(|t| !t.is_empty()) {
        let names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        must.push(json!({ "key": "doc_type", "match": { "any": names } }));
    }
    if let Some(ids) = filter.document_ids.as_ref().filter(|d| !d.is_empty()) {
        must.push(json!({ "key": "document_id", "match": { "any": ids } }));
    }
    json!({ "must": must })
}

fn point_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl EvidenceStore for QdrantEvidenceStore {
    async fn search(
        &self,
        embedding: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EvidenceError> {
        let body = SearchBody {
            vector: embedding,
            limit,
            filter: build_filter(filter),
            with_payload: true,
        };

        let response = self.client.post(&self.search_url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EvidenceError::Backend {
                backend: BACKEND,
                status: status.as_u16(),
                message,
            });
        }

        let parsed: SearchResponse =
            response
                .json()
                .await
                .map_err(|e| EvidenceError::InvalidResponse {
                    backend: BACKEND,
                    message: e.to_string(),
                })?;

        let mut hits = Vec::with_capacity(parsed.result.len());
        for point in parsed.result {
            let id = point_id(&point.id);
            let Some(payload) = point.payload else {
                tracing::debug!(point = %id, "search hit without payload; skipping");
                continue;
            };
            match serde_json::from_value::<HitPayload>(payload) {
                Ok(payload) => hits.push(SearchHit {
                    id,
                    score: point.score,
                    payload,
                }),
                Err(e) => {
                    tracing::debug!(point = %id, error = %e, "unparseable hit payload; skipping");
                }
            }
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::DocType;

    #[test]
    fn filter_always_scopes_tenant() {
        let value = build_filter(&SearchFilter::tenant("acme"));
        assert_eq!(value["must"].as_array().unwrap().len(), 1);
        assert_eq!(value["must"][0]["match"]["value"], "acme");
    }

    #[test]
    fn filter_adds_optional_constraints() {
        let value = build_filter(
            &SearchFilter::tenant("acme")
                .with_doc_types(vec![DocType::Policy, DocType::Runbook])
                .with_document_ids(vec!["d1".into()]),
        );
        let must = value["must"].as_array().unwrap();
        assert_eq!(must.len(), 3);
        assert_eq!(must[1]["match"]["any"], json!(["POLICY", "RUNBOOK"]));
        assert_eq!(must[2]["match"]["any"], json!(["d1"]));
    }

    #[test]
    fn numeric_point_ids_are_stringified() {
        assert_eq!(point_id(&json!(42)), "42");
        assert_eq!(point_id(&json!("abc")), "abc");
    }
}
