//! Prometheus metrics for the core components.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

fn register<M: prometheus::core::Collector + Clone + 'static>(registry: &Registry, metric: M) -> M {
    registry
        .register(Box::new(metric.clone()))
        .expect("metric names are static and unique");
    metric
}

/// Run orchestrator metrics.
pub struct RunMetrics {
    pub runs_created: IntCounter,
    pub runs_terminal: IntCounterVec,
    pub run_duration_seconds: Histogram,
    pub jobs_pending: IntGauge,
    pub job_retries: IntCounter,
}

impl RunMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            runs_created: register(
                registry,
                IntCounter::new("atelier_runs_created_total", "Runs created").unwrap(),
            ),
            runs_terminal: register(
                registry,
                IntCounterVec::new(
                    Opts::new("atelier_runs_terminal_total", "Runs reaching a terminal state"),
                    &["state"],
                )
                .unwrap(),
            ),
            run_duration_seconds: register(
                registry,
                Histogram::with_opts(HistogramOpts::new(
                    "atelier_run_duration_seconds",
                    "Wall-clock duration of completed runs",
                ))
                .unwrap(),
            ),
            jobs_pending: register(
                registry,
                IntGauge::new("atelier_jobs_pending", "Jobs waiting in the queue").unwrap(),
            ),
            job_retries: register(
                registry,
                IntCounter::new("atelier_job_retries_total", "Jobs re-enqueued after failure")
                    .unwrap(),
            ),
        }
    }
}

/// Billing metrics.
pub struct BillingMetrics {
    pub charges_total: IntCounter,
    pub charge_failures: IntCounter,
    pub tokens_billed: IntCounterVec,
    pub cost_usd_total: Gauge,
    /// 0 = normal, 1 = degraded, 2 = read_only, 3 = disabled.
    pub mode: IntGauge,
}

impl BillingMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            charges_total: register(
                registry,
                IntCounter::new("atelier_billing_charges_total", "Ledger charges recorded")
                    .unwrap(),
            ),
            charge_failures: register(
                registry,
                IntCounter::new("atelier_billing_failures_total", "Failed charge attempts")
                    .unwrap(),
            ),
            tokens_billed: register(
                registry,
                IntCounterVec::new(
                    Opts::new("atelier_billing_tokens_total", "Tokens billed"),
                    &["direction"],
                )
                .unwrap(),
            ),
            cost_usd_total: register(
                registry,
                Gauge::new("atelier_billing_cost_usd_total", "Cumulative cost billed in USD")
                    .unwrap(),
            ),
            mode: register(
                registry,
                IntGauge::new("atelier_billing_mode", "Billing mode (0 normal .. 3 disabled)")
                    .unwrap(),
            ),
        }
    }
}

/// Collaboration gateway metrics.
pub struct CollabMetrics {
    pub connections: IntGauge,
    pub operations_total: IntCounter,
    pub operations_rejected: IntCounter,
    pub breaker_state: IntGauge,
    pub backpressure: Gauge,
    pub reconnections: IntCounter,
}

impl CollabMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            connections: register(
                registry,
                IntGauge::new("atelier_collab_connections", "Active collaboration clients")
                    .unwrap(),
            ),
            operations_total: register(
                registry,
                IntCounter::new("atelier_collab_operations_total", "Operation batches applied")
                    .unwrap(),
            ),
            operations_rejected: register(
                registry,
                IntCounter::new(
                    "atelier_collab_operations_rejected_total",
                    "Operation batches rejected",
                )
                .unwrap(),
            ),
            breaker_state: register(
                registry,
                IntGauge::new(
                    "atelier_collab_breaker_state",
                    "Circuit breaker state (0 closed, 1 half-open, 2 open)",
                )
                .unwrap(),
            ),
            backpressure: register(
                registry,
                Gauge::new("atelier_collab_backpressure", "Current backpressure scalar").unwrap(),
            ),
            reconnections: register(
                registry,
                IntCounter::new("atelier_collab_reconnections_total", "Successful reconnections")
                    .unwrap(),
            ),
        }
    }
}

/// Sandbox manager metrics.
pub struct SandboxMetrics {
    pub active: IntGauge,
    pub executions: IntCounter,
    pub recreations: IntCounter,
}

impl SandboxMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            active: register(
                registry,
                IntGauge::new("atelier_sandbox_active", "Active sandbox environments").unwrap(),
            ),
            executions: register(
                registry,
                IntCounter::new("atelier_sandbox_executions_total", "Sandbox executions").unwrap(),
            ),
            recreations: register(
                registry,
                IntCounter::new(
                    "atelier_sandbox_recreations_total",
                    "Sandboxes recreated after failed health probes",
                )
                .unwrap(),
            ),
        }
    }
}

/// All core metrics, registered against one registry.
pub struct CoreMetrics {
    pub registry: Registry,
    pub runs: RunMetrics,
    pub billing: BillingMetrics,
    pub collab: CollabMetrics,
    pub sandbox: SandboxMetrics,
}

impl CoreMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let runs = RunMetrics::new(&registry);
        let billing = BillingMetrics::new(&registry);
        let collab = CollabMetrics::new(&registry);
        let sandbox = SandboxMetrics::new(&registry);
        Self {
            registry,
            runs,
            billing,
            collab,
            sandbox,
        }
    }
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the registry in the Prometheus text exposition format.
pub fn export_metrics(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
