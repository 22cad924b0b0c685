//! Subsystems: cross-cutting services wrapped around every operation
//!
//! A subsystem exposes a `pre` hook (before the work) and a `post` hook
//! (after it). The [`SubsystemRegistry`] is an explicit value handed to the
//! orchestrator; it owns the declared order, the mandatory/advisory flags,
//! the per-hook timeouts and the client for each subsystem.

use crate::context::CorrelationContext;
use crate::error::{Result, WaypointError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Kind of service a subsystem represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemCategory {
    Identity,
    Workflow,
    Events,
    Telemetry,
    Other,
}

impl fmt::Display for SubsystemCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubsystemCategory::Identity => write!(f, "identity"),
            SubsystemCategory::Workflow => write!(f, "workflow"),
            SubsystemCategory::Events => write!(f, "events"),
            SubsystemCategory::Telemetry => write!(f, "telemetry"),
            SubsystemCategory::Other => write!(f, "other"),
        }
    }
}

/// Successful `pre` hook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PreOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_data(data: Value) -> Self {
        Self { data: Some(data) }
    }
}

/// Successful `post` hook, possibly with non-fatal remarks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostOutcome {
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl PostOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn warn(warning: impl Into<String>) -> Self {
        Self {
            warnings: vec![warning.into()],
        }
    }
}

/// What `post` hooks learn about the wrapped work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub operation: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HookError {
    #[error("HOOK/REJECTED: {0}")]
    Rejected(String),

    #[error("HOOK/UNAVAILABLE: {0}")]
    Unavailable(String),

    #[error("HOOK/TIMEOUT: no answer within {0:?}")]
    TimedOut(Duration),

    #[error("HOOK/PANIC: {0}")]
    Panicked(String),
}

/// Capability interface every subsystem client implements.
#[async_trait]
pub trait Subsystem: Send + Sync {
    async fn pre(&self, ctx: CorrelationContext) -> std::result::Result<PreOutcome, HookError>;

    async fn post(
        &self,
        _ctx: CorrelationContext,
        _summary: OperationSummary,
    ) -> std::result::Result<PostOutcome, HookError> {
        Ok(PostOutcome::ok())
    }
}

/// Declared configuration of one subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsystemSpec {
    pub name: String,
    pub category: SubsystemCategory,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl SubsystemSpec {
    pub fn mandatory(name: impl Into<String>, category: SubsystemCategory) -> Self {
        Self {
            name: name.into(),
            category,
            mandatory: true,
            timeout_ms: None,
        }
    }

    pub fn advisory(name: impl Into<String>, category: SubsystemCategory) -> Self {
        Self {
            name: name.into(),
            category,
            mandatory: false,
            timeout_ms: None,
        }
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// A subsystem ready for one operation. `client` is `None` when the
/// subsystem is declared but not configured; hooks then succeed as no-ops.
#[derive(Clone)]
pub struct ResolvedSubsystem {
    pub name: String,
    pub category: SubsystemCategory,
    pub mandatory: bool,
    pub timeout: Duration,
    pub client: Option<Arc<dyn Subsystem>>,
}

impl fmt::Debug for ResolvedSubsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSubsystem")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("mandatory", &self.mandatory)
            .field("timeout", &self.timeout)
            .field("configured", &self.client.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct SubsystemRegistry {
    specs: Vec<SubsystemSpec>,
    clients: HashMap<String, Arc<dyn Subsystem>>,
    default_timeout: Duration,
}

impl SubsystemRegistry {
    pub fn new() -> Self {
        Self {
            specs: Vec::new(),
            clients: HashMap::new(),
            default_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Declare a subsystem without a client. Declaring a name twice
    /// replaces the earlier spec in place.
    pub fn declare(mut self, spec: SubsystemSpec) -> Self {
        match self.specs.iter_mut().find(|s| s.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.specs.push(spec),
        }
        self
    }

    /// Declare a subsystem together with its client.
    pub fn register(self, spec: SubsystemSpec, client: Arc<dyn Subsystem>) -> Self {
        let name = spec.name.clone();
        let mut registry = self.declare(spec);
        registry.clients.insert(name, client);
        registry
    }

    /// Attach a client to an already declared subsystem.
    pub fn attach(mut self, name: &str, client: Arc<dyn Subsystem>) -> Result<Self> {
        if !self.specs.iter().any(|s| s.name == name) {
            return Err(WaypointError::config(format!(
                "cannot attach client to undeclared subsystem '{}'",
                name
            )));
        }
        self.clients.insert(name.to_string(), client);
        Ok(self)
    }

    pub fn declared(&self) -> &[SubsystemSpec] {
        &self.specs
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    /// Resolve every declared subsystem, in declared order.
    pub fn resolve_all(&self) -> Result<Vec<ResolvedSubsystem>> {
        self.specs.iter().map(|spec| self.resolve_spec(spec)).collect()
    }

    /// Resolve the named subsystems, in the order given.
    pub fn resolve(&self, names: &[&str]) -> Result<Vec<ResolvedSubsystem>> {
        names
            .iter()
            .map(|name| {
                let spec = self
                    .specs
                    .iter()
                    .find(|s| s.name == *name)
                    .ok_or_else(|| WaypointError::config(format!("unknown subsystem '{}'", name)))?;
                self.resolve_spec(spec)
            })
            .collect()
    }

    fn resolve_spec(&self, spec: &SubsystemSpec) -> Result<ResolvedSubsystem> {
        let client = self.clients.get(&spec.name).cloned();
        if spec.mandatory && client.is_none() {
            return Err(WaypointError::config(format!(
                "mandatory subsystem '{}' has no configured client",
                spec.name
            )));
        }
        Ok(ResolvedSubsystem {
            name: spec.name.clone(),
            category: spec.category,
            mandatory: spec.mandatory,
            timeout: spec
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.default_timeout),
            client,
        })
    }
}

impl Default for SubsystemRegistry {
    fn default() -> Self {
        Self::new()
    }
}
