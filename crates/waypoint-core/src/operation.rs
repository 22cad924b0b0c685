//! Operation: the status of one tracked unit of work
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Finished, but some work was skipped or cut short.
    Partial,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Partial)
    }
}

/// Owned by the orchestrator or executor that created it; nothing else
/// mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub correlation_id: String,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn new(name: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            correlation_id: correlation_id.into(),
            status: OperationStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self) {
        if self.status == OperationStatus::Pending {
            self.status = OperationStatus::InProgress;
            self.started_at = Some(Utc::now());
        }
    }

    /// Move to a terminal status. Terminal operations stay as they are.
    pub fn finish(&mut self, status: OperationStatus) {
        if self.status.is_terminal() || !status.is_terminal() {
            return;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}
