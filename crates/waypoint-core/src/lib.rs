//! Waypoint Core: correlation, subsystem orchestration and journey tracking
//!
//! Every tracked operation carries a [`CorrelationContext`] through a fixed
//! set of cross-cutting subsystems. Mandatory subsystems (identity) can stop
//! the work; advisory ones (workflow, events, telemetry) only degrade it.
//! Multi-phase operations run through the [`PipelineExecutor`], which checks
//! the handoff contract between phases, advances a milestone [`Journey`] and
//! leaves an [`ExecutionRecord`] for every call it makes.
//!
//! ```text
//! CorrelationContextFactory ─┐
//! HandoffContractValidator ──┤
//! ExecutionRecorder ─────────┼──▶ SubsystemOrchestrator ──┐
//! SubsystemRegistry ─────────┘                            ├──▶ PipelineExecutor
//! MilestoneJourneyTracker ────────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod contract;
pub mod error;
pub mod journey;
pub mod operation;
pub mod orchestrator;
pub mod phase;
pub mod pipeline;
pub mod recorder;
pub mod subsystem;

pub use config::WaypointConfig;
pub use context::{ContextAttrs, ContextPolicy, CorrelationContext, CorrelationContextFactory};
pub use contract::{HandoffContractValidator, ValidationResult};
pub use error::WaypointError;
pub use journey::{
    Journey, JourneyDefinition, JourneyStatus, Milestone, MilestoneDefinition,
    MilestoneJourneyTracker, MilestoneResult, MilestoneStatus,
};
pub use operation::{Operation, OperationStatus};
pub use orchestrator::{OperationResult, SubsystemOrchestrator};
pub use phase::{
    Payload, Phase, PhaseError, PhaseHandler, PhaseOutput, PhaseStatus, DEFAULT_PHASE_TIMEOUT,
};
pub use pipeline::{ContractMode, PhaseReport, PhaseTiming, PipelineExecutor, PipelinePolicy, PipelineResult};
pub use recorder::{
    ExecutionRecord, ExecutionRecorder, InMemoryRecordStore, JsonlRecordStore, RecordKind,
    RecordStore,
};
pub use subsystem::{
    HookError, OperationSummary, PostOutcome, PreOutcome, Subsystem, SubsystemCategory,
    SubsystemRegistry, SubsystemSpec,
};

/// Waypoint core version
pub const WAYPOINT_VERSION: &str = "1.0.0";
