//! Composition root.
//!
//! `Core::build` wires every component once at startup; handlers and
//! background tasks borrow from the one `Core` value. There are no global
//! singletons.

use crate::config::ServerConfig;
use crate::ws::WsBroadcaster;
use atelier_billing::{BillingConfig, BillingMode, BillingService, PriceTable};
use atelier_collab::{
    BackpressureGauge, BreakerConfig, CircuitBreaker, CircuitState, CollabGateway, GatewayLimits,
    InMemoryFanOut, OtServer, PresenceSink, PresenceTracker, ReconnectionManager, ServerEvent,
};

use atelier_ledger::{LedgerService, LedgerStore, MemoryLedger};
use atelier_llm::{AnthropicProvider, GatewayConfig, LlmGateway, LlmProvider, OpenAiProvider};
use atelier_observability::{
    Alert, AlertManager, AlertSeverity, ComponentHealth, CoreMetrics, HealthCheck, HealthRegistry,
    WebhookConfig, WebhookSink,
};
use atelier_orchestrator::{
    LlmPlanner, Orchestrator, SandboxToolDispatcher, Worker, WorkerConfig,
};
use atelier_sandbox::{
    ExecutionResult, FileEntry, ResourceLimits, SandboxManager, SandboxManagerConfig,
    SandboxProvider, SandboxTier,
};
use atelier_store::{MemoryStore, PostgresStore, Store};
use atelier_types::{CancelHandle, CoreError, CoreResult, Ctx, WorkerId};
use std::sync::Arc;
use std::time::Duration;

/// Stand-in LLM provider when no API key is configured; every call surfaces
/// a clear validation error instead of a confusing connection failure.
struct UnconfiguredLlm;

#[async_trait::async_trait]
impl LlmProvider for UnconfiguredLlm {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn complete(
        &self,
        _request: &atelier_llm::CompletionRequest,
        _ctx: &Ctx,
    ) -> CoreResult<atelier_llm::CompletionResponse> {
        Err(CoreError::Validation(
            "no LLM provider configured; set OPENAI_API_KEY or ANTHROPIC_API_KEY".to_string(),
        ))
    }
}

/// Stand-in sandbox provider; the real vendor adapter is injected by the
/// deployment.
struct UnconfiguredSandbox;

#[async_trait::async_trait]
impl SandboxProvider for UnconfiguredSandbox {
    async fn create(&self, _limits: &ResourceLimits) -> CoreResult<String> {
        Err(CoreError::ToolError("no sandbox provider configured".into()))
    }

    async fn execute_code(
        &self,
        _sandbox_id: &str,
        _language: &str,
        _code: &str,
        _timeout: Duration,
    ) -> CoreResult<ExecutionResult> {
        Err(CoreError::ToolError("no sandbox provider configured".into()))
    }

    async fn execute_shell(
        &self,
        _sandbox_id: &str,
        _command: &str,
        _timeout: Duration,
    ) -> CoreResult<ExecutionResult> {
        Err(CoreError::ToolError("no sandbox provider configured".into()))
    }

    async fn read_file(&self, _sandbox_id: &str, _path: &str) -> CoreResult<String> {
        Err(CoreError::ToolError("no sandbox provider configured".into()))
    }

    async fn write_file(&self, _sandbox_id: &str, _path: &str, _content: &str) -> CoreResult<()> {
        Err(CoreError::ToolError("no sandbox provider configured".into()))
    }

    async fn list_files(&self, _sandbox_id: &str, _path: &str) -> CoreResult<Vec<FileEntry>> {
        Err(CoreError::ToolError("no sandbox provider configured".into()))
    }

    async fn download_file(&self, _sandbox_id: &str, _path: &str) -> CoreResult<Vec<u8>> {
        Err(CoreError::ToolError("no sandbox provider configured".into()))
    }

    async fn destroy(&self, _sandbox_id: &str) -> CoreResult<()> {
        Ok(())
    }
}

struct StoreCheck {
    store: Arc<dyn Store>,
}

#[async_trait::async_trait]
impl HealthCheck for StoreCheck {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> ComponentHealth {
        match self.store.pending_jobs().await {
            Ok(_) => ComponentHealth::healthy("store"),
            Err(err) => ComponentHealth::unhealthy("store", err.to_string()),
        }
    }
}

struct BillingCheck {
    billing: Arc<BillingService>,
}

#[async_trait::async_trait]
impl HealthCheck for BillingCheck {
    fn name(&self) -> &str {
        "billing"
    }

    async fn check(&self) -> ComponentHealth {
        match self.billing.mode().await {
            BillingMode::Normal => ComponentHealth::healthy("billing"),
            BillingMode::Degraded => ComponentHealth::degraded("billing", "degraded mode"),
            BillingMode::ReadOnly => {
                ComponentHealth::degraded("billing", "read-only: charges are being skipped")
            }
            BillingMode::Disabled => {
                ComponentHealth::degraded("billing", "disabled by operator")
            }
        }
    }
}

struct BreakerCheck {
    breaker: Arc<CircuitBreaker>,
}

#[async_trait::async_trait]
impl HealthCheck for BreakerCheck {
    fn name(&self) -> &str {
        "collab_admission"
    }

    async fn check(&self) -> ComponentHealth {
        match self.breaker.state() {
            CircuitState::Closed => ComponentHealth::healthy("collab_admission"),
            CircuitState::HalfOpen => {
                ComponentHealth::degraded("collab_admission", "circuit half-open")
            }
            CircuitState::Open => {
                ComponentHealth::degraded("collab_admission", "circuit open, rejecting sessions")
            }
        }
    }

    fn required_for_readiness(&self) -> bool {
        false
    }
}

/// Bridges the synchronous presence sink into document broadcasts.
struct ChannelPresenceSink {
    tx: tokio::sync::mpsc::UnboundedSender<(String, String, bool)>,
}

impl PresenceSink for ChannelPresenceSink {
    fn presence_joined(&self, document_id: &str, user_id: &str) {
        let _ = self
            .tx
            .send((document_id.to_string(), user_id.to_string(), true));
    }

    fn presence_left(&self, document_id: &str, user_id: &str) {
        let _ = self
            .tx
            .send((document_id.to_string(), user_id.to_string(), false));
    }
}

pub struct Core {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub ledger: LedgerService,
    pub billing: Arc<BillingService>,
    pub orchestrator: Orchestrator,
    pub workers: Vec<Arc<Worker>>,
    pub gateway: Arc<CollabGateway>,
    pub broadcaster: Arc<WsBroadcaster>,
    pub presence: Arc<PresenceTracker>,
    pub sandbox: Arc<SandboxManager>,
    pub metrics: Arc<CoreMetrics>,
    pub health: Arc<HealthRegistry>,
    pub alerts: Arc<AlertManager>,
    pub ctx: Ctx,
    cancel: CancelHandle,
}

impl Core {
    pub async fn build(config: ServerConfig) -> CoreResult<Self> {
        let (ctx, cancel) = Ctx::background();

        // Store + ledger backends.
        let (store, ledger_store): (Arc<dyn Store>, Arc<dyn LedgerStore>) =
            match &config.database_url {
                Some(url) => {
                    let pg = PostgresStore::connect(url)
                        .await
                        .map_err(CoreError::from)?;
                    pg.migrate().await.map_err(CoreError::from)?;
                    let pg = Arc::new(pg);
                    (pg.clone(), pg)
                }
                None => (
                    Arc::new(MemoryStore::new()),
                    Arc::new(MemoryLedger::new()),
                ),
            };
        let ledger = LedgerService::new(ledger_store);

        let billing = Arc::new(BillingService::new(
            ledger.clone(),
            BillingConfig::default(),
            PriceTable::builtin(),
        ));

        // LLM gateway: route claude- models to Anthropic, default OpenAI,
        // fall back across providers when both are configured.
        let openai: Option<Arc<dyn LlmProvider>> = match &config.openai_api_key {
            Some(key) => Some(Arc::new(OpenAiProvider::new(key.clone())?)),
            None => None,
        };
        let anthropic: Option<Arc<dyn LlmProvider>> = match &config.anthropic_api_key {
            Some(key) => Some(Arc::new(AnthropicProvider::new(key.clone())?)),
            None => None,
        };
        let primary: Arc<dyn LlmProvider> = openai
            .clone()
            .or_else(|| anthropic.clone())
            .unwrap_or_else(|| Arc::new(UnconfiguredLlm));
        let mut gateway_builder = LlmGateway::new(primary, GatewayConfig::default());
        if let Some(anthropic) = &anthropic {
            gateway_builder = gateway_builder.with_route("claude-", Arc::clone(anthropic));
            if openai.is_some() {
                gateway_builder = gateway_builder.with_fallback(Arc::clone(anthropic));
            }
        }
        let llm = Arc::new(gateway_builder);

        // Sandbox manager over the injected (or unconfigured) provider.
        let sandbox = Arc::new(SandboxManager::new(
            Arc::new(UnconfiguredSandbox),
            SandboxManagerConfig::default(),
        ));

        let orchestrator = Orchestrator::new(store.clone(), ledger.clone());

        let planner = Arc::new(LlmPlanner::new(llm.clone(), config.execution_model.clone(), 2048));
        let tools = Arc::new(SandboxToolDispatcher::new(
            sandbox.clone(),
            SandboxTier::Standard,
        ));
        let workers: Vec<Arc<Worker>> = (0..config.worker_count.max(1))
            .map(|i| {
                Arc::new(Worker::new(
                    store.clone(),
                    billing.clone(),
                    llm.clone(),
                    planner.clone(),
                    tools.clone(),
                    Some(sandbox.clone()),
                    WorkerConfig {
                        worker_id: WorkerId::new(format!("worker-{i}")),
                        execution_model: config.execution_model.clone(),
                        run_deadline: config.run_deadline,
                        ..Default::default()
                    },
                ))
            })
            .collect();

        // Collaboration stack.
        let broadcaster = Arc::new(WsBroadcaster::new());
        let (presence_tx, presence_rx) = tokio::sync::mpsc::unbounded_channel();
        let presence = Arc::new(PresenceTracker::new(
            Arc::new(ChannelPresenceSink { tx: presence_tx }),
            Duration::from_secs(5),
            Duration::from_secs(300),
        ));
        let gauge = Arc::new(BackpressureGauge::new(10_000, 10_000));
        let gauge_for_breaker = gauge.clone();
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::default(),
            Arc::new(move || gauge_for_breaker.value()),
        ));
        let ot_server = Arc::new(
            OtServer::new(broadcaster.clone() as Arc<dyn atelier_collab::Broadcaster>)
                .with_fanout(Arc::new(InMemoryFanOut::new())),
        );
        let gateway = Arc::new(CollabGateway::new(
            ot_server.clone(),
            presence.clone(),
            breaker.clone(),
            gauge,
            ReconnectionManager::default(),
            GatewayLimits::default(),
            ctx.clone(),
        ));

        // Presence events flow into document broadcasts.
        {
            let server = ot_server.clone();
            let mut rx = presence_rx;
            tokio::spawn(async move {
                while let Some((document_id, user_id, joined)) = rx.recv().await {
                    let event = if joined {
                        ServerEvent::PresenceJoin {
                            document_id: document_id.clone(),
                            user_id,
                        }
                    } else {
                        ServerEvent::PresenceLeave {
                            document_id: document_id.clone(),
                            user_id,
                        }
                    };
                    server.broadcast_to_document(&document_id, event, None).await;
                }
            });
        }

        // Observability.
        let metrics = Arc::new(CoreMetrics::new());
        let mut alerts = AlertManager::new(Duration::from_secs(30));
        if let (Some(url), Some(secret)) = (&config.webhook_url, &config.webhook_secret) {
            alerts.add_sink(Arc::new(WebhookSink::new(WebhookConfig::new(
                url.clone(),
                secret.clone(),
            ))));
        }
        let alerts = Arc::new(alerts);

        // Breaker transitions feed the alert manager.
        {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(CircuitState, CircuitState)>();
            breaker.set_on_state_change(move |from, to| {
                let _ = tx.send((from, to));
            });
            let alerts = alerts.clone();
            tokio::spawn(async move {
                while let Some((from, to)) = rx.recv().await {
                    let (event, severity) = match to {
                        CircuitState::Open => ("circuit_breaker.open", AlertSeverity::Critical),
                        CircuitState::HalfOpen => {
                            ("circuit_breaker.half_open", AlertSeverity::Warning)
                        }
                        CircuitState::Closed => ("circuit_breaker.closed", AlertSeverity::Info),
                    };
                    let alert = Alert::new(
                        event,
                        severity,
                        format!("collaboration admission circuit: {from} -> {to}"),
                    )
                    .with_data(serde_json::json!({"from": from, "to": to}));
                    alerts.fire(alert).await;
                }
            });
        }

        let mut health = HealthRegistry::new();
        health.register(Arc::new(StoreCheck {
            store: store.clone(),
        }));
        health.register(Arc::new(BillingCheck {
            billing: billing.clone(),
        }));
        health.register(Arc::new(BreakerCheck {
            breaker: breaker.clone(),
        }));

        Ok(Self {
            config,
            store,
            ledger,
            billing,
            orchestrator,
            workers,
            gateway,
            broadcaster,
            presence,
            sandbox,
            metrics,
            health: Arc::new(health),
            alerts,
            ctx,
            cancel,
        })
    }

    /// Start workers, the breaker monitor, sweepers and the metrics pump.
    pub fn spawn_background(&self) {
        for worker in &self.workers {
            let worker = worker.clone();
            let ctx = self.ctx.clone();
            tokio::spawn(async move { worker.run(ctx).await });
        }

        tokio::spawn(
            self.gateway
                .breaker()
                .clone()
                .run_monitor(self.ctx.clone()),
        );
        tokio::spawn(self.sandbox.clone().run_sweeper(self.ctx.clone()));
        tokio::spawn(self.presence.clone().run_sweeper(self.ctx.clone()));

        // Periodic gauge refresh for metrics and backpressure.
        {
            let store = self.store.clone();
            let metrics = self.metrics.clone();
            let gateway = self.gateway.clone();
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Ok(pending) = store.pending_jobs().await {
                                metrics.runs.jobs_pending.set(pending as i64);
                                gateway.gauge().set_queue_depth(pending);
                            }
                            metrics
                                .collab
                                .connections
                                .set(gateway.gauge().connections() as i64);
                            metrics.collab.backpressure.set(gateway.gauge().value());
                            let state = match gateway.breaker().state() {
                                CircuitState::Closed => 0,
                                CircuitState::HalfOpen => 1,
                                CircuitState::Open => 2,
                            };
                            metrics.collab.breaker_state.set(state);
                        }
                        _ = ctx.cancelled() => return,
                    }
                }
            });
        }
    }

    /// Signal every background task to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
