//! Execution Recorder: append-only observability sink
//!
//! Every subsystem hook call and phase execution leaves one
//! [`ExecutionRecord`]. Raw payloads are never stored: the input is reduced
//! to a BLAKE3 hash of its canonical JSON form and the output to a short,
//! size-bounded summary.
//!
//! Writes never fail from the caller's point of view. A store error is
//! logged, counted and dropped.

use crate::context::CorrelationContext;
use crate::error::WaypointError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const DEFAULT_SUMMARY_LIMIT: usize = 256;

/// What produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    SubsystemPre,
    SubsystemPost,
    Phase,
    Compensation,
}

/// One immutable observability entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub record_id: String,
    pub correlation_id: String,
    /// Subsystem or agent that did the work
    #[serde(alias = "subsystem_or_agent_name")]
    pub subsystem: String,
    pub operation: String,
    pub kind: RecordKind,
    pub input_hash: String,
    pub output_summary: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_units: Option<f64>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Arguments for a single [`ExecutionRecorder::record`] call.
#[derive(Debug, Clone)]
pub struct RecordRequest<'a> {
    pub subsystem: &'a str,
    pub operation: &'a str,
    pub kind: RecordKind,
    pub input: &'a Value,
    pub output: &'a Value,
    pub latency_ms: u64,
    pub cost_units: Option<f64>,
    pub success: bool,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("STORE/IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("STORE/SERIALIZE: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("STORE/UNAVAILABLE: {0}")]
    Unavailable(String),
}

/// Storage collaborator behind the recorder.
pub trait RecordStore: Send + Sync {
    fn append(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    fn by_correlation(&self, correlation_id: &str) -> Result<Vec<ExecutionRecord>, StoreError>;
}

pub struct ExecutionRecorder {
    store: Arc<dyn RecordStore>,
    summary_limit: usize,
    write_failures: AtomicU64,
    last_write_error: Mutex<Option<WaypointError>>,
}

impl ExecutionRecorder {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            summary_limit: DEFAULT_SUMMARY_LIMIT,
            write_failures: AtomicU64::new(0),
            last_write_error: Mutex::new(None),
        }
    }

    pub fn with_summary_limit(mut self, limit: usize) -> Self {
        self.summary_limit = limit;
        self
    }

    /// Build and append a record. Never returns an error.
    pub fn record(&self, ctx: &CorrelationContext, request: RecordRequest<'_>) {
        let record = ExecutionRecord {
            record_id: format!("rec_{}", uuid::Uuid::new_v4().simple()),
            correlation_id: ctx.correlation_id.clone(),
            subsystem: request.subsystem.to_string(),
            operation: request.operation.to_string(),
            kind: request.kind,
            input_hash: input_hash(request.input),
            output_summary: summarize(request.output, self.summary_limit),
            latency_ms: request.latency_ms,
            cost_units: request.cost_units,
            success: request.success,
            timestamp: Utc::now(),
        };

        if let Err(e) = self.store.append(&record) {
            let error = WaypointError::ObservabilityWrite(format!("{}: {}", record.record_id, e));
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                correlation_id = %record.correlation_id,
                subsystem = %record.subsystem,
                error = %error,
                "execution record dropped"
            );
            if let Ok(mut last) = self.last_write_error.lock() {
                *last = Some(error);
            }
        }
    }

    /// Most recent absorbed store failure.
    pub fn last_write_error(&self) -> Option<WaypointError> {
        self.last_write_error.lock().ok().and_then(|last| last.clone())
    }

    /// Records for one correlation id; an unreadable store yields none.
    pub fn records_for(&self, correlation_id: &str) -> Vec<ExecutionRecord> {
        self.store.by_correlation(correlation_id).unwrap_or_else(|e| {
            tracing::warn!(correlation_id, error = %e, "execution records unavailable");
            Vec::new()
        })
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }
}

/// Deterministic hash of the canonical JSON form of `value`.
pub fn input_hash(value: &Value) -> String {
    let canonical = canonical_json(value);
    format!("blake3:{}", blake3::hash(canonical.as_bytes()))
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Render `value` and cut it to at most `limit` bytes on a char boundary.
pub fn summarize(value: &Value, limit: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Bounded in-memory store, oldest entries dropped first.
pub struct InMemoryRecordStore {
    entries: Mutex<Vec<ExecutionRecord>>,
    max_entries: usize,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::with_max_entries(10_000)
    }

    pub fn with_max_entries(max: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_entries: max,
        }
    }

    pub fn entries(&self) -> Vec<ExecutionRecord> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export to JSON Lines
    pub fn to_jsonl(&self) -> String {
        self.entries()
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn append(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("record store lock poisoned".to_string()))?;
        entries.push(record.clone());

        if entries.len() > self.max_entries {
            let drain_count = entries.len() - self.max_entries;
            entries.drain(0..drain_count);
        }
        Ok(())
    }

    fn by_correlation(&self, correlation_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("record store lock poisoned".to_string()))?;
        Ok(entries
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect())
    }
}

/// Append-only JSON Lines file, one record per line.
pub struct JsonlRecordStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRecordStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordStore for JsonlRecordStore {
    fn append(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("record file lock poisoned".to_string()))?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn by_correlation(&self, correlation_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let record: ExecutionRecord = serde_json::from_str(line)?;
            if record.correlation_id == correlation_id {
                records.push(record);
            }
        }
        Ok(records)
    }
}
