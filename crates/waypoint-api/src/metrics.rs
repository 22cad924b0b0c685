//! Prometheus metrics served on `/metrics`.
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use waypoint_core::PipelineResult;

pub struct ApiMetrics {
    registry: Registry,
    pub http_requests: IntCounterVec,
    pub pipelines: IntCounterVec,
    pub phase_duration: HistogramVec,
    pub degraded: IntCounterVec,
    pub record_write_failures: IntGauge,
}

impl ApiMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("waypoint_http_requests_total", "HTTP requests by method and status"),
            &["method", "status"],
        )?;
        let pipelines = IntCounterVec::new(
            Opts::new("waypoint_pipelines_total", "Pipeline executions by operation and outcome"),
            &["operation", "outcome"],
        )?;
        let phase_duration = HistogramVec::new(
            HistogramOpts::new("waypoint_phase_duration_seconds", "Phase handler duration")
                .buckets(vec![0.001, 0.005, 0.025, 0.1, 0.5, 2.5, 10.0]),
            &["phase"],
        )?;
        let degraded = IntCounterVec::new(
            Opts::new(
                "waypoint_degraded_subsystems_total",
                "Pipelines that ran with an advisory subsystem degraded",
            ),
            &["subsystem"],
        )?;
        let record_write_failures = IntGauge::new(
            "waypoint_record_write_failures",
            "Execution records dropped because the store rejected them",
        )?;

        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(pipelines.clone()))?;
        registry.register(Box::new(phase_duration.clone()))?;
        registry.register(Box::new(degraded.clone()))?;
        registry.register(Box::new(record_write_failures.clone()))?;

        Ok(Self {
            registry,
            http_requests,
            pipelines,
            phase_duration,
            degraded,
            record_write_failures,
        })
    }

    pub fn observe_pipeline(&self, result: &PipelineResult) {
        let outcome = match &result.error_code {
            None => "success",
            Some(code) if code == "DeadlineExceeded" => "deadline",
            Some(_) => "failure",
        };
        self.pipelines
            .with_label_values(&[result.operation.name.as_str(), outcome])
            .inc();
        for report in result.phase_reports.iter().filter(|r| r.executed) {
            self.phase_duration
                .with_label_values(&[report.phase_id.as_str()])
                .observe(report.duration_ms as f64 / 1000.0);
        }
        for name in &result.degraded_subsystems {
            self.degraded.with_label_values(&[name.as_str()]).inc();
        }
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}
