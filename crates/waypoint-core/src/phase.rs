//! Phase: one step of a pipeline, with its handoff contracts
use crate::context::CorrelationContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Field bag exchanged between phases.
pub type Payload = Map<String, Value>;

/// Bound for a phase when neither the phase nor the policy sets one.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Business logic of a phase. Lives outside the core; the core only
/// schedules it.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: CorrelationContext,
        input: Payload,
    ) -> Result<PhaseOutput, PhaseError>;
}

/// What a handler hands back when it ran to completion.
///
/// `success = false` is a business-level failure; a fault that leaves
/// the handler unable to answer is a `PhaseError` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutput {
    pub output: Payload,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseOutput {
    pub fn ok(output: Payload) -> Self {
        Self {
            output,
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: Payload::new(),
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhaseError {
    #[error("PHASE/INPUT: {0}")]
    InvalidInput(String),

    #[error("PHASE/EXEC: {0}")]
    Execution(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

/// A phase definition. Runtime status, result and error are reported
/// per execution in `PhaseReport`, so one definition can back many
/// concurrent pipelines.
#[derive(Clone)]
pub struct Phase {
    pub phase_id: String,
    pub handler: Arc<dyn PhaseHandler>,
    /// Fields that must be present and non-null before the handler runs.
    pub input_contract: Vec<String>,
    /// Fields the handler promises to produce.
    pub output_contract: Vec<String>,
    pub mandatory: bool,
    pub timeout: Option<Duration>,
    /// Undo step run when a saga pipeline aborts after this phase
    /// completed. It is handed the phase's own output.
    pub compensation: Option<Arc<dyn PhaseHandler>>,
}

impl Phase {
    pub fn new(phase_id: impl Into<String>, handler: Arc<dyn PhaseHandler>) -> Self {
        Self {
            phase_id: phase_id.into(),
            handler,
            input_contract: Vec::new(),
            output_contract: Vec::new(),
            mandatory: true,
            timeout: None,
            compensation: None,
        }
    }

    /// Build a phase from an async closure.
    pub fn from_fn<F, Fut>(phase_id: impl Into<String>, f: F) -> Self
    where
        F: Fn(CorrelationContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PhaseOutput, PhaseError>> + Send + 'static,
    {
        Self::new(phase_id, Arc::new(FnHandler(f)))
    }

    pub fn requires<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_contract = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn produces<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_contract = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_compensation(mut self, compensation: Arc<dyn PhaseHandler>) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn compensate_with_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(CorrelationContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PhaseOutput, PhaseError>> + Send + 'static,
    {
        self.with_compensation(Arc::new(FnHandler(f)))
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("phase_id", &self.phase_id)
            .field("input_contract", &self.input_contract)
            .field("output_contract", &self.output_contract)
            .field("mandatory", &self.mandatory)
            .field("timeout", &self.timeout)
            .field("compensated", &self.compensation.is_some())
            .finish()
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> PhaseHandler for FnHandler<F>
where
    F: Fn(CorrelationContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PhaseOutput, PhaseError>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: CorrelationContext,
        input: Payload,
    ) -> Result<PhaseOutput, PhaseError> {
        (self.0)(ctx, input).await
    }
}
