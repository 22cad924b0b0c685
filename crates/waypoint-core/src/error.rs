//! Unified Error Model
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WaypointError {
    #[error("CONFIG/{0}")]
    Configuration(String),

    #[error("SUBSYSTEM/{name} failed for {correlation_id}: {reason}")]
    SubsystemFailure {
        name: String,
        correlation_id: String,
        reason: String,
    },

    #[error("CONTRACT/{phase_id} for {correlation_id}: missing {missing_fields:?}, correlation mismatch: {mismatched_correlation}")]
    ContractViolation {
        phase_id: String,
        correlation_id: String,
        missing_fields: Vec<String>,
        mismatched_correlation: bool,
    },

    #[error("PHASE/{phase_id} failed for {correlation_id}: {message}")]
    PhaseExecution {
        phase_id: String,
        correlation_id: String,
        message: String,
    },

    #[error("OBSERVABILITY/{0}")]
    ObservabilityWrite(String),

    #[error("DEADLINE/{correlation_id}: {skipped_phases:?} not started")]
    DeadlineExceeded {
        correlation_id: String,
        skipped_phases: Vec<String>,
    },

    #[error("JOURNEY/{0}")]
    InvalidTransition(String),
}

impl WaypointError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Machine-readable `<Kind>:<subject>` code, e.g. `SubsystemFailure:identity`.
    pub fn code(&self) -> String {
        match self {
            Self::Configuration(_) => "ConfigurationError".to_string(),
            Self::SubsystemFailure { name, .. } => format!("SubsystemFailure:{}", name),
            Self::ContractViolation { phase_id, .. } => format!("ContractViolation:{}", phase_id),
            Self::PhaseExecution { phase_id, .. } => format!("PhaseExecutionError:{}", phase_id),
            Self::ObservabilityWrite(_) => "ObservabilityWriteFailure".to_string(),
            Self::DeadlineExceeded { .. } => "DeadlineExceeded".to_string(),
            Self::InvalidTransition(_) => "InvalidTransition".to_string(),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::SubsystemFailure { correlation_id, .. }
            | Self::ContractViolation { correlation_id, .. }
            | Self::PhaseExecution { correlation_id, .. }
            | Self::DeadlineExceeded { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WaypointError>;
