//! Execution trace capture for pipeline runs.
//!
//! Every run keeps its own ordered `Vec<TraceStep>`; a [`TraceSink`] optionally
//! receives each step as it is appended, for live debugging or offline audit.

use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::pipeline::TraceStep;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub timestamp_ms: i64,
    pub session_id: Uuid,
    pub tenant_id: String,
    /// Position of the step in the run's trace.
    pub index: usize,
    pub step: TraceStep,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: TraceEvent) -> Result<(), TraceError>;
}

/// Appends one JSON line per event from a background writer thread.
#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<TraceEvent>,
}

pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    /// Wait for the writer to drain. Drop every sink clone first.
    pub fn join(mut self) -> Result<(), TraceError> {
        let handle = self.handle.take();
        match handle {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (sender, receiver) = mpsc::channel::<TraceEvent>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: TraceEvent) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<TraceEvent>,
) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Keeps events in memory. Used by tests and embedding callers.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events for one session, in recording order.
    pub fn session(&self, session_id: Uuid) -> Vec<TraceEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.session_id == session_id)
            .collect()
    }
}

impl TraceSink for MemoryTraceSink {
    fn record(&self, event: TraceEvent) -> Result<(), TraceError> {
        self.events
            .lock()
            .map_err(|_| TraceError::Join("memory sink poisoned".to_string()))?
            .push(event);
        Ok(())
    }
}

/// Append-only trace for one run, mirrored to an optional sink.
pub struct TraceRecorder {
    session_id: Uuid,
    tenant_id: String,
    steps: Vec<TraceStep>,
    sink: Option<Arc<dyn TraceSink>>,
}

impl TraceRecorder {
    pub fn new(session_id: Uuid, tenant_id: impl Into<String>, sink: Option<Arc<dyn TraceSink>>) -> Self {
        Self {
            session_id,
            tenant_id: tenant_id.into(),
            steps: Vec::new(),
            sink,
        }
    }

    pub fn push(&mut self, step: TraceStep) {
        tracing::debug!(
            session_id = %self.session_id,
            stage = %step.stage,
            status = ?step.status,
            duration_ms = step.duration_ms,
            "{}",
            step.summary
        );
        if let Some(sink) = &self.sink {
            let event = TraceEvent {
                timestamp_ms: now_epoch_ms(),
                session_id: self.session_id,
                tenant_id: self.tenant_id.clone(),
                index: self.steps.len(),
                step: step.clone(),
            };
            if let Err(e) = sink.record(event) {
                tracing::warn!(session_id = %self.session_id, error = %e, "trace sink rejected event");
            }
        }
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    /// Sum of step durations.
    pub fn total_latency_ms(&self) -> u64 {
        self.steps.iter().map(|s| s.duration_ms).sum()
    }

    pub fn into_steps(self) -> Vec<TraceStep> {
        self.steps
    }
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
