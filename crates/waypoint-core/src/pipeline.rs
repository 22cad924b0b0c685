//! Pipeline Executor: runs phases in order as one tracked journey
//!
//! ```text
//! for each phase:
//!   validate handoff ──invalid──▶ strict: abort │ lenient: skip, milestone failed
//!        │ valid
//!        ▼
//!   orchestrator.around(handler) ──▶ merge output ──▶ advance milestone
//! ```
//!
//! Output accumulates: every phase sees everything produced before it.
//! Nothing collected so far is discarded when the pipeline aborts. With
//! `saga` set, an abort also runs the compensation of every completed
//! phase, most recent first.

use crate::context::CorrelationContext;
use crate::contract::HandoffContractValidator;
use crate::error::{Result, WaypointError};
use crate::journey::{Journey, JourneyDefinition, JourneyStatus, MilestoneJourneyTracker, MilestoneResult};
use crate::operation::{Operation, OperationStatus};
use crate::orchestrator::SubsystemOrchestrator;
use crate::phase::{Payload, Phase, PhaseHandler, PhaseOutput, PhaseStatus, DEFAULT_PHASE_TIMEOUT};
use crate::recorder::{RecordKind, RecordRequest};
use crate::subsystem::ResolvedSubsystem;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// What to do when a handoff contract does not validate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractMode {
    /// Abort the pipeline at the failing phase
    #[default]
    Strict,
    /// Skip the failing phase and carry output forward unchanged
    Lenient,
}

#[derive(Debug, Clone, Default)]
pub struct PipelinePolicy {
    pub mode: ContractMode,
    /// Overall budget; phases not started before it runs out are skipped
    pub deadline: Option<Duration>,
    /// Bound for phases that do not set their own timeout
    pub phase_timeout: Option<Duration>,
    /// Explicit milestone chain; a linear chain over the phases otherwise
    pub journey: Option<JourneyDefinition>,
    /// Compensate completed phases when the pipeline aborts
    pub saga: bool,
}

impl PipelinePolicy {
    pub fn strict() -> Self {
        Self::default()
    }

    pub fn lenient() -> Self {
        Self {
            mode: ContractMode::Lenient,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = Some(timeout);
        self
    }

    pub fn with_journey(mut self, journey: JourneyDefinition) -> Self {
        self.journey = Some(journey);
        self
    }

    pub fn with_saga(mut self) -> Self {
        self.saga = true;
        self
    }

    /// Timeout for `phase`: its own, else the policy's, else
    /// [`DEFAULT_PHASE_TIMEOUT`].
    pub fn effective_timeout(&self, phase: &Phase) -> Duration {
        phase
            .timeout
            .or(self.phase_timeout)
            .unwrap_or(DEFAULT_PHASE_TIMEOUT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase_id: String,
    pub milestone_id: String,
    pub status: PhaseStatus,
    /// The handler was invoked
    pub executed: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub degraded_subsystems: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase_id: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub operation: Operation,
    pub success: bool,
    pub accumulated_output: Payload,
    pub journey_snapshot: Journey,
    pub per_phase_timings: Vec<PhaseTiming>,
    pub phase_reports: Vec<PhaseReport>,
    pub degraded_subsystems: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<String>,
    /// Phases whose compensation ran successfully, in the order it ran
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensated_phases: Vec<String>,
    #[serde(skip)]
    pub error: Option<WaypointError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl PipelineResult {
    pub fn correlation_id(&self) -> &str {
        &self.operation.correlation_id
    }

    pub fn report(&self, phase_id: &str) -> Option<&PhaseReport> {
        self.phase_reports.iter().find(|r| r.phase_id == phase_id)
    }

    /// Phases whose handler actually ran to a result
    pub fn executed_phases(&self) -> Vec<&str> {
        self.phase_reports
            .iter()
            .filter(|r| r.executed)
            .map(|r| r.phase_id.as_str())
            .collect()
    }
}

/// Per-run mutable state, owned by one `execute` call.
struct Run {
    accumulated: Payload,
    journey: Journey,
    reports: Vec<PhaseReport>,
    degraded: Vec<String>,
    warnings: Vec<String>,
    failed_phase: Option<String>,
    error: Option<WaypointError>,
    partial: bool,
    deadline_at: Option<Instant>,
    /// Set when a running phase was cut off by the deadline
    deadline_hit: bool,
    /// Output of each completed phase that has a compensation
    compensable: Vec<(String, Payload)>,
}

impl Run {
    fn degrade(&mut self, names: &[String]) {
        for name in names {
            if !self.degraded.contains(name) {
                self.degraded.push(name.clone());
            }
        }
    }

    fn warn(&mut self, warnings: impl IntoIterator<Item = String>) {
        for warning in warnings {
            if !self.warnings.contains(&warning) {
                self.warnings.push(warning);
            }
        }
    }

    fn abort(&mut self, phase_id: &str, error: WaypointError) {
        self.failed_phase = Some(phase_id.to_string());
        self.error = Some(error);
    }

    fn deadline_passed(&self) -> bool {
        self.deadline_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Mark `rest` skipped and settle the run as cut short by the deadline.
    fn skip_for_deadline(&mut self, correlation_id: &str, rest: &[Phase]) {
        let skipped: Vec<String> = rest.iter().map(|p| p.phase_id.clone()).collect();
        tracing::warn!(?skipped, "deadline passed, skipping remaining phases");
        for p in rest {
            let milestone_id = milestone_id_for(&self.journey, &p.phase_id);
            self.reports.push(PhaseReport {
                phase_id: p.phase_id.clone(),
                milestone_id,
                status: PhaseStatus::Skipped,
                executed: false,
                duration_ms: 0,
                degraded_subsystems: Vec::new(),
                error: Some("deadline exceeded".to_string()),
            });
        }
        self.partial = true;
        self.error = Some(WaypointError::DeadlineExceeded {
            correlation_id: correlation_id.to_string(),
            skipped_phases: skipped,
        });
    }
}

pub struct PipelineExecutor {
    orchestrator: Arc<SubsystemOrchestrator>,
    tracker: Arc<MilestoneJourneyTracker>,
    validator: HandoffContractValidator,
}

impl PipelineExecutor {
    pub fn new(orchestrator: Arc<SubsystemOrchestrator>, tracker: Arc<MilestoneJourneyTracker>) -> Self {
        Self {
            orchestrator,
            tracker,
            validator: HandoffContractValidator::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<SubsystemOrchestrator> {
        &self.orchestrator
    }

    pub fn tracker(&self) -> &Arc<MilestoneJourneyTracker> {
        &self.tracker
    }

    pub async fn execute(
        &self,
        operation_name: &str,
        phases: &[Phase],
        ctx: &CorrelationContext,
        policy: &PipelinePolicy,
    ) -> Result<PipelineResult> {
        self.execute_with_input(operation_name, phases, ctx, policy, Payload::new())
            .await
    }

    /// Run the pipeline with `initial` as the starting accumulated output.
    ///
    /// Only configuration problems come back as `Err`; every runtime
    /// failure is reported inside the `PipelineResult`.
    pub async fn execute_with_input(
        &self,
        operation_name: &str,
        phases: &[Phase],
        ctx: &CorrelationContext,
        policy: &PipelinePolicy,
        initial: Payload,
    ) -> Result<PipelineResult> {
        let span = tracing::info_span!(
            "pipeline",
            correlation_id = %ctx.correlation_id,
            operation = operation_name
        );
        self.drive(operation_name, phases, ctx, policy, initial)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        operation_name: &str,
        phases: &[Phase],
        ctx: &CorrelationContext,
        policy: &PipelinePolicy,
        initial: Payload,
    ) -> Result<PipelineResult> {
        let started = Instant::now();

        let mut definition = policy
            .journey
            .clone()
            .unwrap_or_else(|| JourneyDefinition::linear(phases));
        if definition.name.is_none() {
            definition.name = Some(operation_name.to_string());
        }
        check_phase_mapping(phases, &definition)?;
        let subsystems = self.orchestrator.resolve()?;
        let journey = self.tracker.start_journey(&definition, ctx)?;

        let mut operation = Operation::new(operation_name, ctx.correlation_id.clone());
        operation.start();
        tracing::info!(phases = phases.len(), mode = ?policy.mode, "pipeline started");

        let mut run = Run {
            accumulated: initial,
            journey,
            reports: Vec::with_capacity(phases.len()),
            degraded: Vec::new(),
            warnings: Vec::new(),
            failed_phase: None,
            error: None,
            partial: false,
            deadline_at: policy.deadline.map(|d| started + d),
            deadline_hit: false,
            compensable: Vec::new(),
        };

        for (i, phase) in phases.iter().enumerate() {
            if run.deadline_passed() {
                run.skip_for_deadline(&ctx.correlation_id, &phases[i..]);
                break;
            }

            let proceed = self
                .run_phase(operation_name, phase, ctx, policy, &subsystems, &mut run)
                .await;
            if run.deadline_hit {
                run.skip_for_deadline(&ctx.correlation_id, &phases[i + 1..]);
                break;
            }
            if !proceed {
                break;
            }
        }

        let aborted = matches!(&run.error, Some(e) if !matches!(e, WaypointError::DeadlineExceeded { .. }));
        let compensated_phases = if policy.saga && aborted {
            self.compensate(operation_name, phases, ctx, policy, &mut run).await
        } else {
            Vec::new()
        };

        let journey_snapshot = self
            .tracker
            .get_journey(&run.journey.journey_id)
            .unwrap_or(run.journey);

        let success = run.error.is_none();
        let status = match &run.error {
            None if run.partial => OperationStatus::Partial,
            None => OperationStatus::Completed,
            Some(WaypointError::DeadlineExceeded { .. }) => OperationStatus::Partial,
            Some(_) => OperationStatus::Failed,
        };
        operation.finish(status);

        tracing::info!(
            success,
            ?status,
            journey_status = ?journey_snapshot.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );

        let per_phase_timings = run
            .reports
            .iter()
            .map(|r| PhaseTiming {
                phase_id: r.phase_id.clone(),
                duration_ms: r.duration_ms,
            })
            .collect();

        Ok(PipelineResult {
            operation,
            success,
            accumulated_output: run.accumulated,
            journey_snapshot,
            per_phase_timings,
            phase_reports: run.reports,
            degraded_subsystems: run.degraded,
            warnings: run.warnings,
            failed_phase: run.failed_phase,
            compensated_phases,
            error_code: run.error.as_ref().map(WaypointError::code),
            error: run.error,
        })
    }

    /// Validate, execute and advance one phase. Returns whether the
    /// pipeline continues.
    async fn run_phase(
        &self,
        operation_name: &str,
        phase: &Phase,
        ctx: &CorrelationContext,
        policy: &PipelinePolicy,
        subsystems: &[ResolvedSubsystem],
        run: &mut Run,
    ) -> bool {
        let milestone_id = milestone_id_for(&run.journey, &phase.phase_id);

        let validation = self
            .validator
            .validate(phase, &run.accumulated, &ctx.correlation_id);
        if !validation.valid {
            let violation = WaypointError::ContractViolation {
                phase_id: phase.phase_id.clone(),
                correlation_id: ctx.correlation_id.clone(),
                missing_fields: validation.missing_fields,
                mismatched_correlation: validation.mismatched_correlation,
            };
            tracing::warn!(phase_id = %phase.phase_id, error = %violation, mode = ?policy.mode, "handoff contract violated");

            let (status, result) = match policy.mode {
                ContractMode::Strict => (PhaseStatus::Failed, MilestoneResult::failed(violation.to_string())),
                ContractMode::Lenient => (PhaseStatus::Skipped, MilestoneResult::skipped(violation.to_string())),
            };
            self.advance(run, &milestone_id, result);
            run.reports.push(PhaseReport {
                phase_id: phase.phase_id.clone(),
                milestone_id,
                status,
                executed: false,
                duration_ms: 0,
                degraded_subsystems: Vec::new(),
                error: Some(violation.to_string()),
            });

            if policy.mode == ContractMode::Strict {
                run.abort(&phase.phase_id, violation);
                return false;
            }
            run.partial = true;
            run.warn([violation.to_string()]);
            return true;
        }

        let handler = phase.handler.clone();
        let input = run.accumulated.clone();
        let input_value = Value::Object(run.accumulated.clone());

        // never let a phase outlive the pipeline deadline
        let mut timeout = policy.effective_timeout(phase);
        let mut clamped = false;
        if let Some(at) = run.deadline_at {
            let left = at.saturating_duration_since(Instant::now());
            if left < timeout {
                timeout = left;
                clamped = true;
            }
        }

        let op = self
            .orchestrator
            .around_with_verdict(
                operation_name,
                ctx,
                move |phase_ctx| async move { handler.handle(phase_ctx, input).await },
                subsystems,
                Some(timeout),
                |out: &PhaseOutput| {
                    (!out.success).then(|| {
                        out.error
                            .clone()
                            .unwrap_or_else(|| "phase reported failure".to_string())
                    })
                },
            )
            .await;

        run.degrade(&op.degraded_subsystems);
        run.warn(op.warnings.iter().cloned());
        let work_ms = op.work_duration.as_millis() as u64;

        if op.error.is_some() && op.invoked && clamped && run.deadline_passed() {
            tracing::warn!(phase_id = %phase.phase_id, "phase cut off by the deadline");
            self.record_phase(
                ctx,
                operation_name,
                phase,
                &input_value,
                &Value::String("deadline exceeded".to_string()),
                work_ms,
                false,
            );
            run.reports.push(PhaseReport {
                phase_id: phase.phase_id.clone(),
                milestone_id,
                status: PhaseStatus::Failed,
                executed: true,
                duration_ms: work_ms,
                degraded_subsystems: op.degraded_subsystems,
                error: Some("deadline exceeded".to_string()),
            });
            run.deadline_hit = true;
            return false;
        }

        let error = op.error.map(|e| match e {
            WaypointError::PhaseExecution {
                correlation_id,
                message,
                ..
            } => WaypointError::PhaseExecution {
                phase_id: phase.phase_id.clone(),
                correlation_id,
                message,
            },
            other => other,
        });

        if let Some(error) = error {
            if op.invoked {
                self.record_phase(ctx, operation_name, phase, &input_value, &Value::String(error.to_string()), work_ms, false);
            }
            self.advance(run, &milestone_id, MilestoneResult::failed(error.code()));
            run.reports.push(PhaseReport {
                phase_id: phase.phase_id.clone(),
                milestone_id,
                status: PhaseStatus::Failed,
                executed: op.invoked,
                duration_ms: work_ms,
                degraded_subsystems: op.degraded_subsystems,
                error: Some(error.to_string()),
            });
            run.abort(&phase.phase_id, error);
            return false;
        }

        let Some(output) = op.value else {
            return false;
        };
        let PhaseOutput {
            output,
            success,
            error,
        } = output;
        let output_value = Value::Object(output.clone());
        self.record_phase(ctx, operation_name, phase, &input_value, &output_value, work_ms, success);

        if success {
            let unmet = self.validator.validate_output(phase, &output);
            if !unmet.is_empty() {
                run.warn([format!(
                    "{}: output contract unmet, missing {:?}",
                    phase.phase_id, unmet
                )]);
            }
            if phase.compensation.is_some() {
                run.compensable.push((phase.phase_id.clone(), output.clone()));
            }
            run.accumulated.extend(output);
            self.advance(run, &milestone_id, MilestoneResult::completed(output_value));
            run.reports.push(PhaseReport {
                phase_id: phase.phase_id.clone(),
                milestone_id,
                status: PhaseStatus::Completed,
                executed: true,
                duration_ms: work_ms,
                degraded_subsystems: op.degraded_subsystems,
                error: None,
            });
            return true;
        }

        let message = error.unwrap_or_else(|| "phase reported failure".to_string());
        self.advance(
            run,
            &milestone_id,
            MilestoneResult {
                success: false,
                output: output_value,
                error: Some(message.clone()),
                skipped: false,
            },
        );
        run.reports.push(PhaseReport {
            phase_id: phase.phase_id.clone(),
            milestone_id,
            status: PhaseStatus::Failed,
            executed: true,
            duration_ms: work_ms,
            degraded_subsystems: op.degraded_subsystems,
            error: Some(message.clone()),
        });

        if phase.mandatory || run.journey.status == JourneyStatus::Failed {
            run.abort(
                &phase.phase_id,
                WaypointError::PhaseExecution {
                    phase_id: phase.phase_id.clone(),
                    correlation_id: ctx.correlation_id.clone(),
                    message,
                },
            );
            return false;
        }
        run.partial = true;
        run.warn([format!("{}: {}", phase.phase_id, message)]);
        true
    }

    /// Undo completed phases in reverse order. Milestones keep their
    /// outcome and accumulated output is left as is; a failing
    /// compensation becomes a warning.
    async fn compensate(
        &self,
        operation_name: &str,
        phases: &[Phase],
        ctx: &CorrelationContext,
        policy: &PipelinePolicy,
        run: &mut Run,
    ) -> Vec<String> {
        let mut compensated = Vec::new();
        let completed = std::mem::take(&mut run.compensable);
        for (phase_id, output) in completed.into_iter().rev() {
            let Some(phase) = phases.iter().find(|p| p.phase_id == phase_id) else {
                continue;
            };
            let Some(undo) = phase.compensation.clone() else {
                continue;
            };
            let input_value = Value::Object(output.clone());
            let started = Instant::now();
            let outcome = undo_phase(undo, ctx.clone(), output, policy.effective_timeout(phase)).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let output_value = match &outcome {
                Ok(out) => Value::Object(out.clone()),
                Err(e) => Value::String(e.clone()),
            };
            self.orchestrator.recorder().record(
                ctx,
                RecordRequest {
                    subsystem: &phase.phase_id,
                    operation: operation_name,
                    kind: RecordKind::Compensation,
                    input: &input_value,
                    output: &output_value,
                    latency_ms,
                    cost_units: None,
                    success: outcome.is_ok(),
                },
            );
            match outcome {
                Ok(_) => {
                    tracing::info!(phase_id = %phase.phase_id, latency_ms, "phase compensated");
                    compensated.push(phase.phase_id.clone());
                }
                Err(e) => {
                    tracing::warn!(phase_id = %phase.phase_id, error = %e, "compensation failed");
                    run.warn([format!("{}: compensation failed: {}", phase.phase_id, e)]);
                }
            }
        }
        compensated
    }

    fn advance(&self, run: &mut Run, milestone_id: &str, result: MilestoneResult) {
        match self.tracker.advance(&run.journey.journey_id, milestone_id, result) {
            Ok(journey) => run.journey = journey,
            Err(e) => {
                tracing::warn!(milestone_id, error = %e, "milestone not advanced");
                run.warn([e.to_string()]);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_phase(
        &self,
        ctx: &CorrelationContext,
        operation_name: &str,
        phase: &Phase,
        input: &Value,
        output: &Value,
        latency_ms: u64,
        success: bool,
    ) {
        self.orchestrator.recorder().record(
            ctx,
            RecordRequest {
                subsystem: &phase.phase_id,
                operation: operation_name,
                kind: RecordKind::Phase,
                input,
                output,
                latency_ms,
                cost_units: None,
                success,
            },
        );
    }
}

/// Run one compensation in its own task, bounded by `limit`.
async fn undo_phase(
    undo: Arc<dyn PhaseHandler>,
    ctx: CorrelationContext,
    output: Payload,
    limit: Duration,
) -> std::result::Result<Payload, String> {
    let mut handle = tokio::spawn(async move { undo.handle(ctx, output).await });
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(Ok(out))) if out.success => Ok(out.output),
        Ok(Ok(Ok(out))) => Err(out.error.unwrap_or_else(|| "compensation reported failure".to_string())),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(join)) => Err(format!("panicked: {}", join)),
        Err(_) => {
            handle.abort();
            Err(format!("timed out after {:?}", limit))
        }
    }
}

fn milestone_id_for(journey: &Journey, phase_id: &str) -> String {
    journey
        .milestone_for_phase(phase_id)
        .map(|m| m.milestone_id.clone())
        .unwrap_or_else(|| phase_id.to_string())
}

/// Phase ids must be unique and map one-to-one onto milestones.
fn check_phase_mapping(phases: &[Phase], definition: &JourneyDefinition) -> Result<()> {
    if let Some(orphan) = definition
        .milestones
        .iter()
        .find(|m| !phases.iter().any(|p| p.phase_id == m.phase_id))
    {
        return Err(WaypointError::config(format!(
            "milestone '{}' maps to unknown phase '{}'",
            orphan.milestone_id, orphan.phase_id
        )));
    }
    let mut seen = HashSet::new();
    for phase in phases {
        if !seen.insert(phase.phase_id.as_str()) {
            return Err(WaypointError::config(format!(
                "phase id '{}' appears more than once",
                phase.phase_id
            )));
        }
        let mapped = definition
            .milestones
            .iter()
            .filter(|m| m.phase_id == phase.phase_id)
            .count();
        if mapped != 1 {
            return Err(WaypointError::config(format!(
                "phase '{}' maps to {} milestones, expected exactly one",
                phase.phase_id, mapped
            )));
        }
    }
    Ok(())
}
