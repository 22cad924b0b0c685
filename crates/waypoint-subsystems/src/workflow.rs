//! Workflow tracking: per-correlation state transitions
//!
//! Only the most recent correlations are kept; the oldest are dropped
//! once `max_correlations` is exceeded.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use waypoint_core::{CorrelationContext, HookError, OperationSummary, PostOutcome, PreOutcome, Subsystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub state: WorkflowState,
    pub at: DateTime<Utc>,
}

pub const DEFAULT_MAX_CORRELATIONS: usize = 10_000;

#[derive(Default)]
struct Transitions {
    /// Correlation ids, oldest first
    order: Vec<String>,
    by_correlation: HashMap<String, Vec<WorkflowTransition>>,
}

pub struct WorkflowTracker {
    inner: Mutex<Transitions>,
    max_correlations: usize,
}

impl Default for WorkflowTracker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Transitions::default()),
            max_correlations: DEFAULT_MAX_CORRELATIONS,
        }
    }
}

impl WorkflowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_correlations(mut self, max: usize) -> Self {
        self.max_correlations = max.max(1);
        self
    }

    pub fn transitions(&self, correlation_id: &str) -> Vec<WorkflowTransition> {
        self.inner
            .lock()
            .ok()
            .and_then(|t| t.by_correlation.get(correlation_id).cloned())
            .unwrap_or_default()
    }

    /// Number of correlations currently tracked
    pub fn len(&self) -> usize {
        self.inner.lock().map(|t| t.order.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_state(&self, correlation_id: &str) -> Option<WorkflowState> {
        self.transitions(correlation_id).last().map(|t| t.state)
    }

    fn push(&self, correlation_id: &str, transition: WorkflowTransition) -> Result<(), HookError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| HookError::Unavailable("workflow store poisoned".to_string()))?;
        let Transitions {
            order,
            by_correlation,
        } = &mut *inner;
        match by_correlation.get_mut(correlation_id) {
            Some(history) => history.push(transition),
            None => {
                by_correlation.insert(correlation_id.to_string(), vec![transition]);
                order.push(correlation_id.to_string());
            }
        }

        if order.len() > self.max_correlations {
            let drain_count = order.len() - self.max_correlations;
            for evicted in order.drain(0..drain_count) {
                by_correlation.remove(&evicted);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Subsystem for WorkflowTracker {
    async fn pre(&self, ctx: CorrelationContext) -> Result<PreOutcome, HookError> {
        self.push(
            &ctx.correlation_id,
            WorkflowTransition {
                operation: None,
                state: WorkflowState::Running,
                at: Utc::now(),
            },
        )?;
        Ok(PreOutcome::ok())
    }

    async fn post(
        &self,
        ctx: CorrelationContext,
        summary: OperationSummary,
    ) -> Result<PostOutcome, HookError> {
        let state = if summary.success {
            WorkflowState::Succeeded
        } else {
            WorkflowState::Failed
        };
        self.push(
            &ctx.correlation_id,
            WorkflowTransition {
                operation: Some(summary.operation),
                state,
                at: Utc::now(),
            },
        )?;
        Ok(PostOutcome::ok())
    }
}
