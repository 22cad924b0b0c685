//! Shared application state, built once from `WaypointConfig`.
use crate::metrics::ApiMetrics;
use std::sync::Arc;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::{
    CorrelationContextFactory, ExecutionRecorder, InMemoryRecordStore, JsonlRecordStore,
    MilestoneJourneyTracker, PipelineExecutor, PipelinePolicy, RecordStore,
    SubsystemOrchestrator, WaypointConfig,
};
use waypoint_subsystems::{DocumentStore, ReferenceSubsystems};

pub struct AppState {
    pub factory: CorrelationContextFactory,
    pub policy: PipelinePolicy,
    pub executor: PipelineExecutor,
    pub subsystems: ReferenceSubsystems,
    pub documents: Arc<DocumentStore>,
    pub metrics: ApiMetrics,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Without configured subsystems the full reference set is used.
    pub fn from_config(config: &WaypointConfig) -> Result<Self> {
        let subsystems = match &config.wal_path {
            Some(path) => ReferenceSubsystems::new().with_wal(path),
            None => ReferenceSubsystems::new(),
        };
        let registry = if config.subsystems.is_empty() {
            subsystems.registry()
        } else {
            subsystems.attach_to(config.registry())?
        };

        let store: Arc<dyn RecordStore> = match &config.recorder.jsonl_path {
            Some(path) => Arc::new(JsonlRecordStore::new(path)),
            None => Arc::new(InMemoryRecordStore::with_max_entries(config.recorder.max_records)),
        };
        let recorder = Arc::new(
            ExecutionRecorder::new(store).with_summary_limit(config.recorder.summary_limit),
        );
        let orchestrator = Arc::new(SubsystemOrchestrator::new(registry, recorder));
        // fail at startup rather than on the first request
        orchestrator.resolve()?;

        let metrics = ApiMetrics::new()
            .map_err(|e| WaypointError::config(format!("metrics registry: {}", e)))?;

        Ok(Self {
            factory: config.context_factory(),
            policy: config.pipeline_policy(),
            executor: PipelineExecutor::new(orchestrator, Arc::new(MilestoneJourneyTracker::new())),
            subsystems,
            documents: Arc::new(DocumentStore::new()),
            metrics,
        })
    }

    pub fn tracker(&self) -> &MilestoneJourneyTracker {
        self.executor.tracker()
    }

    pub fn recorder(&self) -> &ExecutionRecorder {
        self.executor.orchestrator().recorder()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_reference_set() {
        let state = AppState::from_config(&WaypointConfig::default()).unwrap();
        assert_eq!(state.executor.orchestrator().registry().declared().len(), 4);
    }

    #[test]
    fn test_wal_path_enables_wal() {
        let dir = tempfile::tempdir().unwrap();
        let config = WaypointConfig {
            wal_path: Some(dir.path().join("wal.jsonl").display().to_string()),
            ..WaypointConfig::default()
        };
        let state = AppState::from_config(&config).unwrap();
        assert!(state.subsystems.wal.is_some());
        assert!(state.executor.orchestrator().registry().is_configured("wal"));
    }

    #[test]
    fn test_unknown_mandatory_subsystem_fails_startup() {
        let config = WaypointConfig::from_yaml(
            "subsystems:\n  - { name: billing, category: other, mandatory: true }\n",
        )
        .unwrap();
        assert!(matches!(
            AppState::from_config(&config),
            Err(WaypointError::Configuration(_))
        ));
    }
}
