//! Static configuration, loaded from YAML
//!
//! ```yaml
//! context:
//!   require_tenant: true
//! hook_timeout_ms: 2000
//! subsystems:
//!   - name: identity
//!     category: identity
//!     mandatory: true
//!   - name: event_bus
//!     category: events
//!     timeout_ms: 250
//! recorder:
//!   summary_limit: 256
//!   max_records: 10000
//! pipeline:
//!   contract_mode: lenient
//!   phase_timeout_ms: 30000
//!   saga: true
//! wal_path: /var/lib/waypoint/wal.jsonl
//! ```

use crate::context::{ContextPolicy, CorrelationContextFactory};
use crate::error::{Result, WaypointError};
use crate::pipeline::{ContractMode, PipelinePolicy};
use crate::recorder::DEFAULT_SUMMARY_LIMIT;
use crate::subsystem::{SubsystemRegistry, SubsystemSpec, DEFAULT_HOOK_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Byte bound on `output_summary`
    pub summary_limit: usize,
    /// Capacity of the in-memory store
    pub max_records: usize,
    /// JSON Lines file; in-memory only when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonl_path: Option<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            summary_limit: DEFAULT_SUMMARY_LIMIT,
            max_records: 10_000,
            jsonl_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDefaults {
    pub contract_mode: ContractMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    /// Compensate completed phases on abort
    pub saga: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaypointConfig {
    pub context: ContextPolicy,
    /// Timeout for hooks whose subsystem sets none
    pub hook_timeout_ms: u64,
    /// Declared in hook order
    pub subsystems: Vec<SubsystemSpec>,
    pub recorder: RecorderConfig,
    pub pipeline: PipelineDefaults,
    /// Write-ahead log file; the WAL subsystem is off when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wal_path: Option<String>,
}

impl Default for WaypointConfig {
    fn default() -> Self {
        Self {
            context: ContextPolicy::default(),
            hook_timeout_ms: DEFAULT_HOOK_TIMEOUT.as_millis() as u64,
            subsystems: Vec::new(),
            recorder: RecorderConfig::default(),
            pipeline: PipelineDefaults::default(),
            wal_path: None,
        }
    }
}

impl WaypointConfig {
    /// Load config from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| WaypointError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WaypointError::config(format!("cannot read configuration {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for spec in &self.subsystems {
            if spec.name.trim().is_empty() {
                return Err(WaypointError::config("subsystem with empty name"));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(WaypointError::config(format!(
                    "subsystem '{}' declared twice",
                    spec.name
                )));
            }
            if spec.timeout_ms == Some(0) {
                return Err(WaypointError::config(format!(
                    "subsystem '{}' has a zero timeout",
                    spec.name
                )));
            }
        }
        if self.hook_timeout_ms == 0 {
            return Err(WaypointError::config("hook_timeout_ms must be positive"));
        }
        if self.pipeline.phase_timeout_ms == Some(0) {
            return Err(WaypointError::config("pipeline.phase_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn context_factory(&self) -> CorrelationContextFactory {
        CorrelationContextFactory::new(self.context.clone())
    }

    /// Registry with every configured subsystem declared and no clients yet.
    pub fn registry(&self) -> SubsystemRegistry {
        self.subsystems.iter().cloned().fold(
            SubsystemRegistry::new().with_default_timeout(Duration::from_millis(self.hook_timeout_ms)),
            SubsystemRegistry::declare,
        )
    }

    pub fn pipeline_policy(&self) -> PipelinePolicy {
        PipelinePolicy {
            mode: self.pipeline.contract_mode,
            deadline: self.pipeline.deadline_ms.map(Duration::from_millis),
            phase_timeout: self.pipeline.phase_timeout_ms.map(Duration::from_millis),
            journey: None,
            saga: self.pipeline.saga,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystem::SubsystemCategory;

    const SAMPLE: &str = r#"
context:
  require_tenant: true
hook_timeout_ms: 2000
subsystems:
  - name: identity
    category: identity
    mandatory: true
  - name: workflow
    category: workflow
  - name: event_bus
    category: events
    timeout_ms: 250
recorder:
  summary_limit: 128
pipeline:
  contract_mode: lenient
  deadline_ms: 60000
  saga: true
wal_path: /tmp/waypoint-wal.jsonl
"#;

    #[test]
    fn test_load_sample() {
        let config = WaypointConfig::from_yaml(SAMPLE).unwrap();
        assert!(config.context.require_tenant);
        assert_eq!(config.subsystems.len(), 3);
        assert_eq!(config.subsystems[2].category, SubsystemCategory::Events);
        assert!(!config.subsystems[1].mandatory);
        assert_eq!(config.recorder.summary_limit, 128);
        assert_eq!(config.recorder.max_records, 10_000);

        let policy = config.pipeline_policy();
        assert_eq!(policy.mode, ContractMode::Lenient);
        assert_eq!(policy.deadline, Some(Duration::from_secs(60)));
        assert_eq!(policy.phase_timeout, None);
        assert!(policy.saga);
        assert_eq!(config.wal_path.as_deref(), Some("/tmp/waypoint-wal.jsonl"));

        let registry = config.registry();
        let names: Vec<&str> = registry.declared().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["identity", "workflow", "event_bus"]);
        // identity is mandatory and has no client yet
        assert!(registry.resolve_all().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = WaypointConfig::from_yaml("{}").unwrap();
        assert_eq!(config.hook_timeout_ms, 5000);
        assert_eq!(config.pipeline.contract_mode, ContractMode::Strict);
        assert!(config.subsystems.is_empty());
        assert!(config.wal_path.is_none());

        // no configured phase timeout still bounds every phase
        let policy = config.pipeline_policy();
        assert!(!policy.saga);
        let phase = crate::phase::Phase::from_fn("noop", |_ctx, _input| async {
            Ok(crate::phase::PhaseOutput::ok(crate::phase::Payload::new()))
        });
        assert_eq!(policy.effective_timeout(&phase), crate::phase::DEFAULT_PHASE_TIMEOUT);
    }

    #[test]
    fn test_rejects_duplicates_and_zero_timeouts() {
        let dup = r#"
subsystems:
  - { name: identity, category: identity }
  - { name: identity, category: identity }
"#;
        assert!(WaypointConfig::from_yaml(dup).is_err());

        let zero = r#"
subsystems:
  - { name: telemetry, category: telemetry, timeout_ms: 0 }
"#;
        assert!(WaypointConfig::from_yaml(zero).is_err());
        assert!(WaypointConfig::from_yaml("pipeline: { phase_timeout_ms: 0 }").is_err());
        assert!(WaypointConfig::from_yaml("hook_timeout_ms: nope").is_err());
    }
}
