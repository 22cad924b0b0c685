//! Event bus: lifecycle events fanned out over a tokio broadcast channel
//!
//! Publishing never blocks and never fails for lack of listeners; a slow
//! subscriber lags and loses the oldest events instead of stalling the
//! operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use waypoint_core::{CorrelationContext, HookError, OperationSummary, PostOutcome, PreOutcome, Subsystem};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OperationStarted,
    OperationSucceeded,
    OperationFailed,
    DocumentStored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub kind: EventKind,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(kind: EventKind, ctx: &CorrelationContext) -> Self {
        Self {
            kind,
            correlation_id: ctx.correlation_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            operation: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Number of subscribers that received the event.
    pub fn publish(&self, event: BusEvent) -> usize {
        let kind = event.kind;
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::debug!(?kind, "event published with no subscribers");
                0
            }
        }
    }
}

#[async_trait]
impl Subsystem for EventBus {
    async fn pre(&self, ctx: CorrelationContext) -> Result<PreOutcome, HookError> {
        self.publish(BusEvent::new(EventKind::OperationStarted, &ctx));
        Ok(PreOutcome::ok())
    }

    async fn post(
        &self,
        ctx: CorrelationContext,
        summary: OperationSummary,
    ) -> Result<PostOutcome, HookError> {
        let kind = if summary.success {
            EventKind::OperationSucceeded
        } else {
            EventKind::OperationFailed
        };
        let payload = serde_json::to_value(&summary).unwrap_or(Value::Null);
        self.publish(
            BusEvent::new(kind, &ctx)
                .operation(summary.operation)
                .payload(payload),
        );
        Ok(PostOutcome::ok())
    }
}
