//! Waypoint Subsystems: reference collaborators for the orchestration core.
//!
//! Small in-process stand-ins for the services a real deployment wraps
//! around every operation, plus the reference `ingest` pipeline. Swap any
//! of them for a real client by attaching a different [`Subsystem`] under
//! the same name.
//!
//! ```text
//! pre:   identity → workflow → event_bus → telemetry (→ wal)
//!                         work
//! post:  (wal →) telemetry → event_bus → workflow → identity
//! ```

mod event_bus;
mod identity;
mod ingest;
mod telemetry;
mod wal;
mod workflow;

pub use event_bus::{BusEvent, EventBus, EventKind};
pub use identity::{IdentitySubsystem, SessionGrant};
pub use ingest::{
    ingest_input, ingest_phases, Document, DocumentStore, NotifyStored, StoreDocument,
    StoredDocument, ValidateDocument, INGEST_OPERATION, NOTIFY_PHASE, STORE_PHASE, VALIDATE_PHASE,
};
pub use telemetry::{OperationStats, TelemetrySubsystem};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};
pub use workflow::{WorkflowState, WorkflowTracker, WorkflowTransition, DEFAULT_MAX_CORRELATIONS};

use std::path::Path;
use std::sync::Arc;
use waypoint_core::error::Result;
use waypoint_core::{Phase, Subsystem, SubsystemCategory, SubsystemRegistry, SubsystemSpec};

pub const IDENTITY: &str = "identity";
pub const WORKFLOW: &str = "workflow";
pub const EVENT_BUS: &str = "event_bus";
pub const TELEMETRY: &str = "telemetry";
pub const WAL: &str = "wal";

/// One shared instance of each reference subsystem.
#[derive(Clone, Default)]
pub struct ReferenceSubsystems {
    pub identity: Arc<IdentitySubsystem>,
    pub workflow: Arc<WorkflowTracker>,
    pub events: Arc<EventBus>,
    pub telemetry: Arc<TelemetrySubsystem>,
    /// Off unless a log file is given
    pub wal: Option<Arc<WriteAheadLog>>,
}

impl ReferenceSubsystems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wal(mut self, path: impl AsRef<Path>) -> Self {
        self.wal = Some(Arc::new(WriteAheadLog::new(path)));
        self
    }

    /// Declaration order of the reference set: identity is mandatory,
    /// everything else is advisory. The WAL comes last when enabled.
    pub fn specs(&self) -> Vec<SubsystemSpec> {
        let mut specs = vec![
            SubsystemSpec::mandatory(IDENTITY, SubsystemCategory::Identity),
            SubsystemSpec::advisory(WORKFLOW, SubsystemCategory::Workflow),
            SubsystemSpec::advisory(EVENT_BUS, SubsystemCategory::Events),
            SubsystemSpec::advisory(TELEMETRY, SubsystemCategory::Telemetry),
        ];
        if self.wal.is_some() {
            specs.push(SubsystemSpec::advisory(WAL, SubsystemCategory::Other));
        }
        specs
    }

    fn client(&self, name: &str) -> Option<Arc<dyn Subsystem>> {
        match name {
            IDENTITY => Some(self.identity.clone()),
            WORKFLOW => Some(self.workflow.clone()),
            EVENT_BUS => Some(self.events.clone()),
            TELEMETRY => Some(self.telemetry.clone()),
            WAL => self.wal.clone().map(|wal| wal as Arc<dyn Subsystem>),
            _ => None,
        }
    }

    /// Registry with the reference specs and every client attached.
    pub fn registry(&self) -> SubsystemRegistry {
        self.specs()
            .into_iter()
            .fold(SubsystemRegistry::new(), |registry, spec| {
                match self.client(&spec.name) {
                    Some(client) => registry.register(spec, client),
                    None => registry.declare(spec),
                }
            })
    }

    /// Attach reference clients to whichever reference names `registry`
    /// declares. Other declarations are left untouched.
    pub fn attach_to(&self, registry: SubsystemRegistry) -> Result<SubsystemRegistry> {
        let names: Vec<String> = registry
            .declared()
            .iter()
            .map(|spec| spec.name.clone())
            .collect();
        names.iter().try_fold(registry, |registry, name| match self.client(name) {
            Some(client) => registry.attach(name, client),
            None => {
                tracing::debug!(subsystem = %name, "no reference client, left unconfigured");
                Ok(registry)
            }
        })
    }

    /// The `ingest` phases, notifying on this set's event bus.
    pub fn ingest_phases(&self, store: Arc<DocumentStore>) -> Vec<Phase> {
        ingest_phases(store, self.events.clone())
    }
}
