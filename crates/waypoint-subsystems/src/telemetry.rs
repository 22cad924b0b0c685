//! Telemetry: per-operation counters and latency totals
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use waypoint_core::{CorrelationContext, HookError, OperationSummary, PostOutcome, PreOutcome, Subsystem};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub succeeded: u64,
    pub failed: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl OperationStats {
    pub fn count(&self) -> u64 {
        self.succeeded + self.failed
    }

    pub fn mean_duration_ms(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.total_duration_ms as f64 / n as f64,
        }
    }
}

/// Warns in `post` when an operation takes longer than the threshold.
#[derive(Default)]
pub struct TelemetrySubsystem {
    started: AtomicU64,
    slow_threshold_ms: Option<u64>,
    stats: Mutex<BTreeMap<String, OperationStats>>,
}

impl TelemetrySubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slow_threshold_ms(mut self, ms: u64) -> Self {
        self.slow_threshold_ms = Some(ms);
        self
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn stats(&self, operation: &str) -> Option<OperationStats> {
        self.stats.lock().ok()?.get(operation).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, OperationStats> {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Subsystem for TelemetrySubsystem {
    async fn pre(&self, _ctx: CorrelationContext) -> Result<PreOutcome, HookError> {
        self.started.fetch_add(1, Ordering::Relaxed);
        Ok(PreOutcome::ok())
    }

    async fn post(
        &self,
        _ctx: CorrelationContext,
        summary: OperationSummary,
    ) -> Result<PostOutcome, HookError> {
        {
            let mut stats = self
                .stats
                .lock()
                .map_err(|_| HookError::Unavailable("telemetry store poisoned".to_string()))?;
            let entry = stats.entry(summary.operation.clone()).or_default();
            if summary.success {
                entry.succeeded += 1;
            } else {
                entry.failed += 1;
            }
            entry.total_duration_ms += summary.duration_ms;
            entry.max_duration_ms = entry.max_duration_ms.max(summary.duration_ms);
        }

        match self.slow_threshold_ms {
            Some(limit) if summary.duration_ms > limit => Ok(PostOutcome::warn(format!(
                "{} took {}ms, over {}ms",
                summary.operation, summary.duration_ms, limit
            ))),
            _ => Ok(PostOutcome::ok()),
        }
    }
}
