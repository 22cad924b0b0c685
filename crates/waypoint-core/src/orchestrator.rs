//! Subsystem Orchestrator: wraps work in ordered pre/post hooks
//!
//! ```text
//! pre(identity) → pre(workflow) → pre(event_bus) → work → post(event_bus) → post(workflow) → post(identity)
//!      │                │                 │                      │
//!  mandatory        advisory          advisory            post failures
//!  failure aborts   failure degrades  failure degrades    become warnings
//! ```
//!
//! Every hook and the work itself run in their own task under a timeout, so
//! a hung or panicking collaborator is reported as a failure of that call
//! and nothing else.

use crate::context::CorrelationContext;
use crate::error::{Result, WaypointError};
use crate::operation::{Operation, OperationStatus};
use crate::recorder::{ExecutionRecorder, RecordKind, RecordRequest};
use crate::subsystem::{
    HookError, OperationSummary, PostOutcome, PreOutcome, ResolvedSubsystem, SubsystemRegistry,
};
use serde_json::{json, Value};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Outcome of one wrapped operation
#[derive(Debug, Clone)]
pub struct OperationResult<T> {
    pub operation: Operation,
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<WaypointError>,
    /// Advisory subsystems whose `pre` hook failed, in hook order
    pub degraded_subsystems: Vec<String>,
    pub warnings: Vec<String>,
    pub duration: Duration,
    /// Time spent in the work alone, hooks excluded
    pub work_duration: Duration,
    /// Whether the wrapped work was started at all
    pub invoked: bool,
    /// The work returned a value but judged its own outcome a failure
    pub reported_failure: Option<String>,
}

impl<T> OperationResult<T> {
    pub fn correlation_id(&self) -> &str {
        &self.operation.correlation_id
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded_subsystems.is_empty()
    }

    /// `<Kind>:<subject>` code of the failure, if any
    pub fn error_code(&self) -> Option<String> {
        self.error.as_ref().map(WaypointError::code)
    }
}

pub struct SubsystemOrchestrator {
    registry: SubsystemRegistry,
    recorder: Arc<ExecutionRecorder>,
}

impl SubsystemOrchestrator {
    pub fn new(registry: SubsystemRegistry, recorder: Arc<ExecutionRecorder>) -> Self {
        Self { registry, recorder }
    }

    pub fn registry(&self) -> &SubsystemRegistry {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<ExecutionRecorder> {
        &self.recorder
    }

    /// Resolve the subsystem set once for an operation.
    pub fn resolve(&self) -> Result<Vec<ResolvedSubsystem>> {
        self.registry.resolve_all()
    }

    /// Resolve every registered subsystem, then run `work` inside them.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation_name: &str,
        ctx: &CorrelationContext,
        work: F,
    ) -> Result<OperationResult<T>>
    where
        F: FnOnce(CorrelationContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let subsystems = self.resolve()?;
        Ok(self.around(operation_name, ctx, work, &subsystems).await)
    }

    /// Run `work` between the `pre` and `post` hooks of `subsystems`.
    pub async fn around<T, E, F, Fut>(
        &self,
        operation_name: &str,
        ctx: &CorrelationContext,
        work: F,
        subsystems: &[ResolvedSubsystem],
    ) -> OperationResult<T>
    where
        F: FnOnce(CorrelationContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        self.around_with_timeout(operation_name, ctx, work, subsystems, None)
            .await
    }

    /// Like [`around`](Self::around), with an upper bound on the work itself.
    pub async fn around_with_timeout<T, E, F, Fut>(
        &self,
        operation_name: &str,
        ctx: &CorrelationContext,
        work: F,
        subsystems: &[ResolvedSubsystem],
        work_timeout: Option<Duration>,
    ) -> OperationResult<T>
    where
        F: FnOnce(CorrelationContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let span = tracing::info_span!(
            "operation",
            correlation_id = %ctx.correlation_id,
            operation = operation_name
        );
        self.drive(operation_name, ctx, work, subsystems, work_timeout, |_: &T| None)
            .instrument(span)
            .await
    }

    /// Like [`around_with_timeout`](Self::around_with_timeout), where
    /// `verdict` inspects the returned value and names a business failure.
    ///
    /// A failing verdict keeps the value but reports the operation as
    /// failed to every `post` hook and to the caller.
    pub async fn around_with_verdict<T, E, F, Fut, V>(
        &self,
        operation_name: &str,
        ctx: &CorrelationContext,
        work: F,
        subsystems: &[ResolvedSubsystem],
        work_timeout: Option<Duration>,
        verdict: V,
    ) -> OperationResult<T>
    where
        F: FnOnce(CorrelationContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
        V: FnOnce(&T) -> Option<String>,
    {
        let span = tracing::info_span!(
            "operation",
            correlation_id = %ctx.correlation_id,
            operation = operation_name
        );
        self.drive(operation_name, ctx, work, subsystems, work_timeout, verdict)
            .instrument(span)
            .await
    }

    async fn drive<T, E, F, Fut, V>(
        &self,
        operation_name: &str,
        ctx: &CorrelationContext,
        work: F,
        subsystems: &[ResolvedSubsystem],
        work_timeout: Option<Duration>,
        verdict: V,
    ) -> OperationResult<T>
    where
        F: FnOnce(CorrelationContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
        V: FnOnce(&T) -> Option<String>,
    {
        let started = Instant::now();
        let mut operation = Operation::new(operation_name, ctx.correlation_id.clone());
        operation.start();

        let mut degraded = Vec::new();
        let mut warnings = Vec::new();
        let mut entered: Vec<&ResolvedSubsystem> = Vec::new();
        let mut abort: Option<WaypointError> = None;

        for subsystem in subsystems {
            match self.call_pre(subsystem, ctx, operation_name).await {
                Ok(_) => entered.push(subsystem),
                Err(e) if subsystem.mandatory => {
                    tracing::warn!(subsystem = %subsystem.name, error = %e, "mandatory subsystem failed, aborting");
                    abort = Some(WaypointError::SubsystemFailure {
                        name: subsystem.name.clone(),
                        correlation_id: ctx.correlation_id.clone(),
                        reason: e.to_string(),
                    });
                    break;
                }
                Err(e) => {
                    tracing::warn!(subsystem = %subsystem.name, error = %e, "advisory subsystem degraded");
                    degraded.push(subsystem.name.clone());
                    warnings.push(format!("{}: pre failed: {}", subsystem.name, e));
                }
            }
        }

        let mut work_duration = Duration::ZERO;
        let (value, error, invoked) = match abort {
            Some(e) => (None, Some(e), false),
            None => {
                let work_started = Instant::now();
                let outcome = self.call_work(operation_name, ctx, work, work_timeout).await;
                work_duration = work_started.elapsed();
                match outcome {
                    Ok(value) => (Some(value), None, true),
                    Err(e) => (None, Some(e), true),
                }
            }
        };
        let reported_failure = value.as_ref().and_then(verdict);
        if let Some(reason) = &reported_failure {
            tracing::warn!(reason = %reason, "work reported failure");
        }

        let summary = OperationSummary {
            operation: operation_name.to_string(),
            success: error.is_none() && reported_failure.is_none(),
            error: error
                .as_ref()
                .map(|e| e.to_string())
                .or_else(|| reported_failure.clone()),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        for subsystem in entered.iter().rev() {
            match self.call_post(subsystem, ctx, operation_name, &summary).await {
                Ok(outcome) => warnings.extend(
                    outcome
                        .warnings
                        .into_iter()
                        .map(|w| format!("{}: {}", subsystem.name, w)),
                ),
                Err(e) => {
                    tracing::warn!(subsystem = %subsystem.name, error = %e, "post hook failed");
                    warnings.push(format!("{}: post failed: {}", subsystem.name, e));
                }
            }
        }

        let success = summary.success;
        operation.finish(if success {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        });

        OperationResult {
            operation,
            success,
            value,
            error,
            degraded_subsystems: degraded,
            warnings,
            duration: started.elapsed(),
            work_duration,
            invoked,
            reported_failure,
        }
    }

    async fn call_pre(
        &self,
        subsystem: &ResolvedSubsystem,
        ctx: &CorrelationContext,
        operation_name: &str,
    ) -> std::result::Result<PreOutcome, HookError> {
        let Some(client) = subsystem.client.clone() else {
            return Ok(PreOutcome::ok());
        };
        let hook_ctx = ctx.clone();
        let started = Instant::now();
        let outcome = isolated(subsystem.timeout, async move { client.pre(hook_ctx).await }).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let output = match &outcome {
            Ok(pre) => pre.data.clone().unwrap_or(Value::Null),
            Err(e) => Value::String(e.to_string()),
        };
        tracing::debug!(subsystem = %subsystem.name, latency_ms, ok = outcome.is_ok(), "pre hook");
        self.recorder.record(
            ctx,
            RecordRequest {
                subsystem: &subsystem.name,
                operation: operation_name,
                kind: RecordKind::SubsystemPre,
                input: &context_value(ctx),
                output: &output,
                latency_ms,
                cost_units: None,
                success: outcome.is_ok(),
            },
        );
        outcome
    }

    async fn call_post(
        &self,
        subsystem: &ResolvedSubsystem,
        ctx: &CorrelationContext,
        operation_name: &str,
        summary: &OperationSummary,
    ) -> std::result::Result<PostOutcome, HookError> {
        let Some(client) = subsystem.client.clone() else {
            return Ok(PostOutcome::ok());
        };
        let hook_ctx = ctx.clone();
        let hook_summary = summary.clone();
        let started = Instant::now();
        let outcome = isolated(subsystem.timeout, async move {
            client.post(hook_ctx, hook_summary).await
        })
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let output = match &outcome {
            Ok(post) => json!({ "warnings": post.warnings }),
            Err(e) => Value::String(e.to_string()),
        };
        tracing::debug!(subsystem = %subsystem.name, latency_ms, ok = outcome.is_ok(), "post hook");
        self.recorder.record(
            ctx,
            RecordRequest {
                subsystem: &subsystem.name,
                operation: operation_name,
                kind: RecordKind::SubsystemPost,
                input: &json!({ "context": context_value(ctx), "summary": summary }),
                output: &output,
                latency_ms,
                cost_units: None,
                success: outcome.is_ok(),
            },
        );
        outcome
    }

    async fn call_work<T, E, F, Fut>(
        &self,
        operation_name: &str,
        ctx: &CorrelationContext,
        work: F,
        work_timeout: Option<Duration>,
    ) -> std::result::Result<T, WaypointError>
    where
        F: FnOnce(CorrelationContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let fault = |message: String| WaypointError::PhaseExecution {
            phase_id: operation_name.to_string(),
            correlation_id: ctx.correlation_id.clone(),
            message,
        };

        let mut handle: JoinHandle<std::result::Result<T, E>> = tokio::spawn(work(ctx.clone()));
        let joined = match work_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(fault(format!("timed out after {:?}", limit)));
                }
            },
            None => (&mut handle).await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(fault(e.to_string())),
            Err(join) => Err(fault(format!("panicked: {}", join))),
        }
    }
}

/// Run a hook in its own task, bounded by `limit`.
async fn isolated<R, Fut>(limit: Duration, hook: Fut) -> std::result::Result<R, HookError>
where
    Fut: Future<Output = std::result::Result<R, HookError>> + Send + 'static,
    R: Send + 'static,
{
    let mut handle = tokio::spawn(hook);
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join)) => Err(HookError::Panicked(join.to_string())),
        Err(_) => {
            handle.abort();
            Err(HookError::TimedOut(limit))
        }
    }
}

fn context_value(ctx: &CorrelationContext) -> Value {
    serde_json::to_value(ctx).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextAttrs, CorrelationContextFactory};
    use crate::recorder::{InMemoryRecordStore, RecordKind};
    use crate::subsystem::{Subsystem, SubsystemCategory, SubsystemSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Mode {
        Ok,
        Fail,
        Hang,
        Panic,
    }

    /// Scripted subsystem that logs hook order into a shared journal.
    struct Scripted {
        name: &'static str,
        pre: Mode,
        post: Mode,
        journal: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn new(name: &'static str, pre: Mode, post: Mode, journal: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                pre,
                post,
                journal: journal.clone(),
            })
        }
    }

    async fn act(mode: Mode) -> std::result::Result<(), HookError> {
        match mode {
            Mode::Ok => Ok(()),
            Mode::Fail => Err(HookError::Rejected("scripted".to_string())),
            Mode::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
            Mode::Panic => panic!("scripted panic"),
        }
    }

    #[async_trait]
    impl Subsystem for Scripted {
        async fn pre(&self, _ctx: CorrelationContext) -> std::result::Result<PreOutcome, HookError> {
            self.journal.lock().unwrap().push(format!("pre:{}", self.name));
            act(self.pre).await.map(|_| PreOutcome::ok())
        }

        async fn post(
            &self,
            _ctx: CorrelationContext,
            _summary: OperationSummary,
        ) -> std::result::Result<PostOutcome, HookError> {
            self.journal.lock().unwrap().push(format!("post:{}", self.name));
            act(self.post).await.map(|_| PostOutcome::ok())
        }
    }

    struct Harness {
        orchestrator: SubsystemOrchestrator,
        store: Arc<InMemoryRecordStore>,
        journal: Arc<Mutex<Vec<String>>>,
        ctx: CorrelationContext,
    }

    fn harness(subsystems: &[(&'static str, bool, Mode, Mode)]) -> Harness {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubsystemRegistry::new().with_default_timeout(Duration::from_millis(100));
        for (name, mandatory, pre, post) in subsystems {
            let spec = if *mandatory {
                SubsystemSpec::mandatory(*name, SubsystemCategory::Other)
            } else {
                SubsystemSpec::advisory(*name, SubsystemCategory::Other)
            };
            registry = registry.register(spec, Scripted::new(*name, *pre, *post, &journal));
        }
        let store = Arc::new(InMemoryRecordStore::new());
        let recorder = Arc::new(ExecutionRecorder::new(store.clone()));
        let ctx = CorrelationContextFactory::default()
            .create(None, ContextAttrs::new().tenant("acme"))
            .unwrap();
        Harness {
            orchestrator: SubsystemOrchestrator::new(registry, recorder),
            store,
            journal,
            ctx,
        }
    }

    fn journal(h: &Harness) -> Vec<String> {
        h.journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_hooks_run_fifo_then_lifo() {
        let h = harness(&[
            ("identity", true, Mode::Ok, Mode::Ok),
            ("workflow", false, Mode::Ok, Mode::Ok),
            ("telemetry", false, Mode::Ok, Mode::Ok),
        ]);
        let journal_handle = h.journal.clone();

        let result = h
            .orchestrator
            .run("ingest", &h.ctx, move |_ctx| async move {
                journal_handle.lock().unwrap().push("work".to_string());
                Ok::<_, String>(7)
            })
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.value, Some(7));
        assert_eq!(result.operation.status, OperationStatus::Completed);
        assert_eq!(
            journal(&h),
            vec![
                "pre:identity", "pre:workflow", "pre:telemetry", "work",
                "post:telemetry", "post:workflow", "post:identity",
            ]
        );
        assert_eq!(h.store.len(), 6);
    }

    #[tokio::test]
    async fn test_advisory_pre_failure_degrades() {
        let h = harness(&[
            ("identity", true, Mode::Ok, Mode::Ok),
            ("event_bus", false, Mode::Fail, Mode::Ok),
        ]);
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = ran.clone();

        let result = h
            .orchestrator
            .run("ingest", &h.ctx, move |_ctx| async move {
                ran_flag.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert!(result.success);
        assert!(result.is_degraded());
        assert_eq!(result.degraded_subsystems, vec!["event_bus".to_string()]);
        // degraded subsystems were never entered, so their post hook is skipped
        assert!(!journal(&h).contains(&"post:event_bus".to_string()));
    }

    #[tokio::test]
    async fn test_mandatory_pre_failure_skips_work() {
        let h = harness(&[
            ("workflow", false, Mode::Ok, Mode::Ok),
            ("identity", true, Mode::Fail, Mode::Ok),
            ("telemetry", false, Mode::Ok, Mode::Ok),
        ]);
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = ran.clone();

        let result = h
            .orchestrator
            .run("ingest", &h.ctx, move |_ctx| async move {
                ran_flag.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        assert!(!result.success);
        assert!(!result.invoked);
        assert_eq!(result.error_code().as_deref(), Some("SubsystemFailure:identity"));
        assert_eq!(result.operation.status, OperationStatus::Failed);
        assert_eq!(
            journal(&h),
            vec!["pre:workflow", "pre:identity", "post:workflow"]
        );
    }

    #[tokio::test]
    async fn test_hook_timeout_and_panic_are_isolated() {
        let h = harness(&[
            ("event_bus", false, Mode::Hang, Mode::Ok),
            ("telemetry", false, Mode::Panic, Mode::Ok),
            ("workflow", false, Mode::Ok, Mode::Panic),
        ]);

        let result = h
            .orchestrator
            .run("ingest", &h.ctx, |_ctx| async { Ok::<_, String>("done") })
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(
            result.degraded_subsystems,
            vec!["event_bus".to_string(), "telemetry".to_string()]
        );
        assert!(result.warnings.iter().any(|w| w.starts_with("workflow: post failed")));
        assert!(result.warnings.iter().any(|w| w.contains("HOOK/TIMEOUT")));

        let records = h.store.entries();
        let failed_pre = records
            .iter()
            .filter(|r| r.kind == RecordKind::SubsystemPre && !r.success)
            .count();
        assert_eq!(failed_pre, 2);
    }

    #[tokio::test]
    async fn test_work_failure_and_timeout() {
        let h = harness(&[("workflow", false, Mode::Ok, Mode::Ok)]);

        let failed = h
            .orchestrator
            .run("ingest", &h.ctx, |_ctx| async { Err::<(), _>("bad input") })
            .await
            .unwrap();
        assert!(!failed.success);
        assert!(failed.invoked);
        assert_eq!(failed.error_code().as_deref(), Some("PhaseExecutionError:ingest"));

        let subsystems = h.orchestrator.resolve().unwrap();
        let slow = h
            .orchestrator
            .around_with_timeout(
                "ingest",
                &h.ctx,
                |_ctx| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, String>(())
                },
                &subsystems,
                Some(Duration::from_millis(20)),
            )
            .await;
        assert!(!slow.success);
        assert!(slow.error.unwrap().to_string().contains("timed out"));
    }

    /// Records the summary every post hook is handed.
    struct SummarySink(Mutex<Vec<OperationSummary>>);

    #[async_trait]
    impl Subsystem for SummarySink {
        async fn pre(&self, _ctx: CorrelationContext) -> std::result::Result<PreOutcome, HookError> {
            Ok(PreOutcome::ok())
        }

        async fn post(
            &self,
            _ctx: CorrelationContext,
            summary: OperationSummary,
        ) -> std::result::Result<PostOutcome, HookError> {
            self.0.lock().unwrap().push(summary);
            Ok(PostOutcome::ok())
        }
    }

    #[tokio::test]
    async fn test_reported_failure_reaches_post_hooks() {
        let sink = Arc::new(SummarySink(Mutex::new(Vec::new())));
        let registry = SubsystemRegistry::new().register(
            SubsystemSpec::advisory("workflow", SubsystemCategory::Workflow),
            sink.clone(),
        );
        let orchestrator = SubsystemOrchestrator::new(
            registry,
            Arc::new(ExecutionRecorder::new(Arc::new(InMemoryRecordStore::new()))),
        );
        let ctx = CorrelationContextFactory::default()
            .create(None, ContextAttrs::new())
            .unwrap();
        let subsystems = orchestrator.resolve().unwrap();

        let result = orchestrator
            .around_with_verdict(
                "validate",
                &ctx,
                |_ctx| async { Ok::<_, String>(false) },
                &subsystems,
                None,
                |accepted: &bool| (!accepted).then(|| "document rejected".to_string()),
            )
            .await;

        assert!(!result.success);
        assert!(result.error.is_none());
        assert_eq!(result.value, Some(false));
        assert_eq!(result.reported_failure.as_deref(), Some("document rejected"));
        assert_eq!(result.operation.status, OperationStatus::Failed);

        let summaries = sink.0.lock().unwrap().clone();
        assert_eq!(summaries.len(), 1);
        assert!(!summaries[0].success);
        assert_eq!(summaries[0].error.as_deref(), Some("document rejected"));

        let accepted = orchestrator
            .around_with_verdict(
                "validate",
                &ctx,
                |_ctx| async { Ok::<_, String>(true) },
                &subsystems,
                None,
                |accepted: &bool| (!accepted).then(|| "document rejected".to_string()),
            )
            .await;
        assert!(accepted.success);
        assert!(sink.0.lock().unwrap()[1].success);
    }

    #[tokio::test]
    async fn test_work_duration_excludes_hooks() {
        let h = harness(&[("event_bus", false, Mode::Hang, Mode::Ok)]);

        let result = h
            .orchestrator
            .run("ingest", &h.ctx, |_ctx| async { Ok::<_, String>(()) })
            .await
            .unwrap();

        // the hanging pre hook burns its 100ms budget before the work starts
        assert!(result.duration >= Duration::from_millis(100));
        assert!(result.work_duration < Duration::from_millis(100));

        let h = harness(&[("identity", true, Mode::Fail, Mode::Ok)]);
        let skipped = h
            .orchestrator
            .run("ingest", &h.ctx, |_ctx| async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert_eq!(skipped.work_duration, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_unconfigured_subsystem_is_noop() {
        let store = Arc::new(InMemoryRecordStore::new());
        let recorder = Arc::new(ExecutionRecorder::new(store.clone()));
        let registry = SubsystemRegistry::new()
            .declare(SubsystemSpec::advisory("telemetry", SubsystemCategory::Telemetry));
        let orchestrator = SubsystemOrchestrator::new(registry, recorder);
        let ctx = CorrelationContextFactory::default()
            .create(None, ContextAttrs::new())
            .unwrap();

        let result = orchestrator
            .run("ingest", &ctx, |_ctx| async { Ok::<_, String>(1) })
            .await
            .unwrap();

        assert!(result.success);
        assert!(!result.is_degraded());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_work_receives_context_copy() {
        let h = harness(&[]);
        let expected = h.ctx.correlation_id.clone();

        let result = h
            .orchestrator
            .run("ingest", &h.ctx, |mut ctx| async move {
                ctx.attributes.insert("touched".to_string(), json!(true));
                Ok::<_, String>(ctx.correlation_id)
            })
            .await
            .unwrap();

        assert_eq!(result.value.as_deref(), Some(expected.as_str()));
        assert!(h.ctx.attribute("touched").is_none());
    }
}
