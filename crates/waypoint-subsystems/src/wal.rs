//! Write-ahead log: an intent line before the work, an outcome line after
//!
//! Advisory. A correlation with an intent and no outcome is an operation
//! that never finished; the log exists so an operator can find those.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use waypoint_core::{CorrelationContext, HookError, OperationSummary, PostOutcome, PreOutcome, Subsystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalEntryKind {
    Intent,
    Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub kind: WalEntryKind,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct WriteAheadLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl WriteAheadLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> Result<Vec<WalEntry>, HookError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).map_err(unavailable)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(unavailable))
            .collect()
    }

    /// Correlations with an intent but no outcome yet, in log order.
    pub fn unfinished(&self) -> Result<Vec<String>, HookError> {
        let mut open: Vec<String> = Vec::new();
        for entry in self.entries()? {
            match entry.kind {
                WalEntryKind::Intent => open.push(entry.correlation_id),
                WalEntryKind::Outcome => {
                    if let Some(pos) = open.iter().position(|c| *c == entry.correlation_id) {
                        open.remove(pos);
                    }
                }
            }
        }
        Ok(open)
    }

    fn append(&self, entry: &WalEntry) -> Result<(), HookError> {
        let line = serde_json::to_string(entry).map_err(unavailable)?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| HookError::Unavailable("wal lock poisoned".to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(unavailable)?;
        writeln!(file, "{}", line).map_err(unavailable)
    }
}

fn unavailable(e: impl std::fmt::Display) -> HookError {
    HookError::Unavailable(format!("wal: {}", e))
}

#[async_trait]
impl Subsystem for WriteAheadLog {
    async fn pre(&self, ctx: CorrelationContext) -> Result<PreOutcome, HookError> {
        self.append(&WalEntry {
            kind: WalEntryKind::Intent,
            correlation_id: ctx.correlation_id,
            operation: None,
            success: None,
            error: None,
            at: Utc::now(),
        })?;
        Ok(PreOutcome::ok())
    }

    async fn post(
        &self,
        ctx: CorrelationContext,
        summary: OperationSummary,
    ) -> Result<PostOutcome, HookError> {
        self.append(&WalEntry {
            kind: WalEntryKind::Outcome,
            correlation_id: ctx.correlation_id,
            operation: Some(summary.operation),
            success: Some(summary.success),
            error: summary.error,
            at: Utc::now(),
        })?;
        Ok(PostOutcome::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::{ContextAttrs, CorrelationContextFactory};

    fn summary(success: bool) -> OperationSummary {
        OperationSummary {
            operation: "ingest".to_string(),
            success,
            error: (!success).then(|| "checksum mismatch".to_string()),
            duration_ms: 4,
        }
    }

    #[tokio::test]
    async fn test_intent_then_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path().join("wal.jsonl"));
        let factory = CorrelationContextFactory::default();
        let done = factory.create(None, ContextAttrs::new()).unwrap();
        let hanging = factory.create(None, ContextAttrs::new()).unwrap();

        wal.pre(done.clone()).await.unwrap();
        wal.pre(hanging.clone()).await.unwrap();
        wal.post(done.clone(), summary(false)).await.unwrap();

        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].kind, WalEntryKind::Outcome);
        assert_eq!(entries[2].success, Some(false));
        assert_eq!(entries[2].error.as_deref(), Some("checksum mismatch"));
        assert_eq!(wal.unfinished().unwrap(), vec![hanging.correlation_id]);
    }

    #[tokio::test]
    async fn test_unwritable_log_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened for append
        let wal = WriteAheadLog::new(dir.path());
        let ctx = CorrelationContextFactory::default()
            .create(None, ContextAttrs::new())
            .unwrap();

        let err = wal.pre(ctx).await.unwrap_err();
        assert!(matches!(err, HookError::Unavailable(_)));
    }
}
