//! SQLite persistence: completed sessions and the tenant chunk catalogue.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::evidence::{ChunkRecord, ChunkResolver, DocType, EvidenceError};
use crate::pipeline::{PipelineResult, Query, SessionPersister, TraceStep};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("corrupt row {id}: {message}")]
    Corrupt { id: String, message: String },
}

const SESSION_SCHEMA: &str = "PRAGMA journal_mode=WAL;\
     PRAGMA synchronous=NORMAL;\
     CREATE TABLE IF NOT EXISTS query_sessions (\
       id TEXT PRIMARY KEY,\
       tenant_id TEXT NOT NULL,\
       user_id TEXT,\
       question TEXT NOT NULL,\
       answer TEXT NOT NULL,\
       quality_score REAL NOT NULL,\
       total_latency_ms INTEGER NOT NULL,\
       trace_json TEXT NOT NULL,\
       created_at TEXT NOT NULL \
     );\
     CREATE INDEX IF NOT EXISTS idx_query_sessions_tenant \
       ON query_sessions (tenant_id, created_at);";

const CHUNK_SCHEMA: &str = "PRAGMA journal_mode=WAL;\
     CREATE TABLE IF NOT EXISTS documents (\
       id TEXT PRIMARY KEY,\
       tenant_id TEXT NOT NULL,\
       title TEXT NOT NULL,\
       doc_type TEXT NOT NULL \
     );\
     CREATE TABLE IF NOT EXISTS document_chunks (\
       id TEXT PRIMARY KEY,\
       document_id TEXT NOT NULL REFERENCES documents(id),\
       tenant_id TEXT NOT NULL,\
       chunk_index INTEGER NOT NULL DEFAULT 0,\
       text TEXT NOT NULL \
     );\
     CREATE INDEX IF NOT EXISTS idx_document_chunks_tenant \
       ON document_chunks (tenant_id);";

fn open(path: &Path, schema: &str) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(schema)?;
    Ok(conn)
}

fn with_conn<F, R>(conn: &Mutex<Connection>, f: F) -> Result<R, StoreError>
where
    F: FnOnce(&Connection) -> Result<R, StoreError>,
{
    let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
    f(&guard)
}

// =============================================================================
// Sessions
// =============================================================================

/// One stored pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub question: String,
    pub answer: String,
    pub quality_score: f32,
    pub total_latency_ms: u64,
    pub trace: Vec<TraceStep>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = open(&path, SESSION_SCHEMA)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("OPSENSE_SESSIONS_DB") {
            return PathBuf::from(path);
        }
        PathBuf::from(".opsense_sessions.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save_session(
        &self,
        query: &Query,
        result: &PipelineResult,
    ) -> Result<Uuid, StoreError> {
        let trace_json =
            serde_json::to_string(&result.trace).map_err(|e| StoreError::Serde(e.to_string()))?;
        let id = result.session_id;
        let tenant_id = query.tenant_id.clone();
        let user_id = query.user_id.clone();
        let question = query.question.clone();
        let answer = result.answer.clone();
        let quality_score = result.quality_score;
        let total_latency_ms = result.total_latency_ms as i64;
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            with_conn(&conn, |conn| {
                conn.execute(
                    "INSERT INTO query_sessions (\
                        id, tenant_id, user_id, question, answer, quality_score,\
                        total_latency_ms, trace_json, created_at \
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)\
                     ON CONFLICT(id) DO UPDATE SET \
                        answer = excluded.answer,\
                        quality_score = excluded.quality_score,\
                        total_latency_ms = excluded.total_latency_ms,\
                        trace_json = excluded.trace_json",
                    params![
                        id.to_string(),
                        tenant_id,
                        user_id,
                        question,
                        answer,
                        quality_score as f64,
                        total_latency_ms,
                        trace_json,
                        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                    ],
                )?;
                Ok(id)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn load(&self, id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            with_conn(&conn, |conn| {
                let row = conn
                    .query_row(
                        &format!("{SELECT_SESSION} WHERE id = ?1"),
                        params![id.to_string()],
                        raw_session,
                    )
                    .optional()?;
                row.map(RawSession::into_record).transpose()
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Most recent sessions for one tenant, newest first.
    pub async fn list_recent(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            with_conn(&conn, |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_SESSION} WHERE tenant_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![tenant_id, limit as i64], raw_session)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?.into_record()?);
                }
                Ok(out)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

const SELECT_SESSION: &str = "SELECT id, tenant_id, user_id, question, answer, quality_score,\
     total_latency_ms, trace_json, created_at FROM query_sessions";

struct RawSession {
    id: String,
    tenant_id: String,
    user_id: Option<String>,
    question: String,
    answer: String,
    quality_score: f64,
    total_latency_ms: i64,
    trace_json: String,
    created_at: String,
}

fn raw_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
    Ok(RawSession {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        question: row.get(3)?,
        answer: row.get(4)?,
        quality_score: row.get(5)?,
        total_latency_ms: row.get(6)?,
        trace_json: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl RawSession {
    fn into_record(self) -> Result<SessionRecord, StoreError> {
        let corrupt = |message: String| StoreError::Corrupt {
            id: self.id.clone(),
            message,
        };
        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?;
        let trace: Vec<TraceStep> =
            serde_json::from_str(&self.trace_json).map_err(|e| corrupt(e.to_string()))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| corrupt(e.to_string()))?
            .with_timezone(&Utc);
        Ok(SessionRecord {
            id,
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            question: self.question,
            answer: self.answer,
            quality_score: self.quality_score as f32,
            total_latency_ms: self.total_latency_ms.max(0) as u64,
            trace,
            created_at,
        })
    }
}

#[async_trait]
impl SessionPersister for SqliteSessionStore {
    async fn save(&self, query: &Query, result: &PipelineResult) -> Result<Uuid, StoreError> {
        self.save_session(query, result).await
    }
}

// =============================================================================
// Chunk catalogue
// =============================================================================

/// Resolves vector-store ids to chunk text from the relational catalogue.
#[derive(Clone)]
pub struct SqliteChunkResolver {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteChunkResolver {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = open(path.as_ref(), CHUNK_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CHUNK_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upsert one chunk together with its parent document row.
    pub fn insert(&self, record: &ChunkRecord, chunk_index: usize) -> Result<(), StoreError> {
        with_conn(&self.conn, |conn| {
            conn.execute(
                "INSERT INTO documents (id, tenant_id, title, doc_type) VALUES (?1, ?2, ?3, ?4)\
                 ON CONFLICT(id) DO UPDATE SET title = excluded.title, doc_type = excluded.doc_type",
                params![
                    record.document_id,
                    record.tenant_id,
                    record.title,
                    record.doc_type.as_str()
                ],
            )?;
            conn.execute(
                "INSERT INTO document_chunks (id, document_id, tenant_id, chunk_index, text)\
                 VALUES (?1, ?2, ?3, ?4, ?5)\
                 ON CONFLICT(id) DO UPDATE SET text = excluded.text, chunk_index = excluded.chunk_index",
                params![
                    record.chunk_id,
                    record.document_id,
                    record.tenant_id,
                    chunk_index as i64,
                    record.text
                ],
            )?;
            Ok(())
        })
    }

    fn resolve_blocking(
        conn: &Connection,
        tenant_id: &str,
        chunk_ids: &[String],
    ) -> Result<Vec<ChunkRecord>, rusqlite::Error> {
        let mut stmt = conn.prepare(
            "SELECT c.id, c.tenant_id, c.document_id, d.title, d.doc_type, c.text \
             FROM document_chunks c JOIN documents d ON d.id = c.document_id \
             WHERE c.id = ?1 AND c.tenant_id = ?2 AND d.tenant_id = ?2",
        )?;
        let mut out = Vec::with_capacity(chunk_ids.len());
        for id in chunk_ids {
            let record = stmt
                .query_row(params![id, tenant_id], |row| {
                    let doc_type: String = row.get(4)?;
                    Ok(ChunkRecord {
                        chunk_id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        document_id: row.get(2)?,
                        title: row.get(3)?,
                        doc_type: doc_type.parse::<DocType>().unwrap_or(DocType::Other),
                        text: row.get(5)?,
                    })
                })
                .optional()?;
            if let Some(record) = record {
                out.push(record);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ChunkResolver for SqliteChunkResolver {
    async fn resolve(
        &self,
        tenant_id: &str,
        chunk_ids: &[String],
    ) -> Result<Vec<ChunkRecord>, EvidenceError> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let tenant_id = tenant_id.to_string();
        let chunk_ids = chunk_ids.to_vec();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| EvidenceError::Poisoned)?;
            Ok(Self::resolve_blocking(&guard, &tenant_id, &chunk_ids)?)
        })
        .await
        .map_err(|e| EvidenceError::Join(e.to_string()))?
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
            title: format!("{doc} title"),
            doc_type: DocType::Runbook,
            text: format!("{id} text"),
        }
    }

    #[tokio::test]
    async fn resolver_is_tenant_scoped() {
        let resolver = SqliteChunkResolver::in_memory().unwrap();
        resolver.insert(&record("c1", "acme", "d1"), 0).unwrap();
        resolver.insert(&record("c2", "globex", "d2"), 0).unwrap();

        let ids = vec!["c1".to_string(), "c2".to_string(), "missing".to_string()];
        let out = resolver.resolve("acme", &ids).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].chunk_id, "c1");
        assert_eq!(out[0].doc_type, DocType::Runbook);
        assert_eq!(out[0].title, "d1 title");
    }

    #[tokio::test]
    async fn resolver_preserves_request_order() {
        let resolver = SqliteChunkResolver::in_memory().unwrap();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            resolver.insert(&record(id, "acme", "d1"), i).unwrap();
        }
        let ids = vec!["c".to_string(), "a".to_string()];
        let out = resolver.resolve("acme", &ids).await.unwrap();
        let got: Vec<_> = out.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(got, vec!["c", "a"]);
    }
}
