//! The run worker.
//!
//! A worker leases a job, drives the run's state machine, and writes a
//! checkpoint after each phase. Execution is at-least-once: after a crash
//! the next worker replays the in-flight phase from step 0, and every
//! side-effecting call short-circuits on its idempotency key (at the
//! checkpoint store for outputs, at the ledger for charges).

use crate::planner::Planner;
use crate::tools::ToolDispatcher;
use atelier_billing::{BillArgs, BillingService, RunBudget};
use atelier_llm::{CompletionRequest, LlmGateway, Message};
use atelier_sandbox::SandboxManager;
use atelier_scorer::{PlanDecision, PlanScorer, RepairSuggestion, RepairType};
use atelier_store::{IdempotentWrite, Job, Lease, MessageRole, RunUpdate, Store};
use atelier_types::{
    CancelHandle, CoreError, CoreResult, Ctx, Plan, PlanPhase, RunError, RunId, RunRecord,
    RunState, WorkerId,
};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub lease_ttl: Duration,
    pub idle_poll: Duration,
    /// Retryable failures re-enqueue the job up to this many times; past it
    /// the run fails.
    pub max_job_retries: u32,
    pub retry_backoff: Duration,
    /// Default per-run deadline when the run record carries none.
    pub run_deadline: Duration,
    pub execution_model: String,
    pub max_output_tokens: u32,
    pub run_budget_usd: Option<Decimal>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new(format!("worker-{}", uuid::Uuid::new_v4())),
            lease_ttl: Duration::from_secs(30),
            idle_poll: Duration::from_millis(500),
            max_job_retries: 3,
            retry_backoff: Duration::from_secs(1),
            run_deadline: Duration::from_secs(600),
            execution_model: "gpt-4o".to_string(),
            max_output_tokens: 1024,
            run_budget_usd: None,
        }
    }
}

/// How a processed job leaves the queue.
enum Disposition {
    Completed,
    Requeue(Duration),
    Failed,
}

/// The run record plus the authority to mutate it.
struct RunDriver {
    run: RunRecord,
    lease: Lease,
}

impl RunDriver {
    async fn apply(&mut self, store: &dyn Store, update: RunUpdate) -> CoreResult<()> {
        self.run = store
            .update_run(
                self.run.id,
                self.run.state_version,
                self.lease.token,
                update,
            )
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }
}

pub struct Worker {
    store: Arc<dyn Store>,
    billing: Arc<BillingService>,
    llm: Arc<LlmGateway>,
    planner: Arc<dyn Planner>,
    tools: Arc<dyn ToolDispatcher>,
    sandbox: Option<Arc<SandboxManager>>,
    scorer: Mutex<PlanScorer>,
    config: WorkerConfig,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        billing: Arc<BillingService>,
        llm: Arc<LlmGateway>,
        planner: Arc<dyn Planner>,
        tools: Arc<dyn ToolDispatcher>,
        sandbox: Option<Arc<SandboxManager>>,
        config: WorkerConfig,
    ) -> Self {
        let context = atelier_scorer::ScoringContext::with_tools(tools.available_tools());
        Self {
            store,
            billing,
            llm,
            planner,
            tools,
            sandbox,
            scorer: Mutex::new(PlanScorer::new(context)),
            config,
        }
    }

    /// The planning session for a run, if one was recorded.
    pub async fn planning_session(&self, run_id: RunId) -> Option<atelier_scorer::PlannerSession> {
        self.scorer
            .lock()
            .await
            .get_session(&run_id.to_string())
            .cloned()
    }

    /// The worker loop: dequeue, process, repeat. Exits on cancellation.
    pub async fn run(&self, ctx: Ctx) {
        tracing::info!(worker_id = %self.config.worker_id, "Worker started");
        loop {
            if ctx.checkpoint().is_err() {
                tracing::info!(worker_id = %self.config.worker_id, "Worker stopping");
                return;
            }

            let job = match self.store.dequeue(&self.config.worker_id).await {
                Ok(job) => job,
                Err(err) => {
                    tracing::error!(%err, "Dequeue failed");
                    None
                }
            };

            match job {
                Some(job) => self.process_job(job, &ctx).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_poll) => {}
                        _ = ctx.cancelled() => {}
                    }
                }
            }
        }
    }

    /// Process one job end to end, including queue bookkeeping.
    pub async fn process_job(&self, job: Job, ctx: &Ctx) {
        let disposition = match self.run_job(&job, ctx).await {
            Ok(disposition) => disposition,
            Err(err) => {
                tracing::error!(run_id = %job.run_id, %err, "Job processing error");
                if job.retry_count < self.config.max_job_retries {
                    Disposition::Requeue(self.backoff_for(job.retry_count))
                } else {
                    Disposition::Failed
                }
            }
        };

        let result = match disposition {
            Disposition::Completed => self.store.complete_job(job.id).await,
            Disposition::Requeue(delay) => {
                self.store.requeue_job(job.id, delay).await.map(|_| ())
            }
            Disposition::Failed => self.store.fail_job(job.id).await,
        };
        if let Err(err) = result {
            tracing::error!(job_id = %job.id, %err, "Job bookkeeping failed");
        }
    }

    fn backoff_for(&self, retry_count: u32) -> Duration {
        self.config.retry_backoff * 2u32.pow(retry_count.min(8))
    }

    async fn run_job(&self, job: &Job, ctx: &Ctx) -> CoreResult<Disposition> {
        let Some(run) = self.store.get_run(job.run_id).await.map_err(CoreError::from)? else {
            tracing::warn!(run_id = %job.run_id, "Job references unknown run");
            return Ok(Disposition::Failed);
        };
        if run.state.is_terminal() {
            return Ok(Disposition::Completed);
        }

        let lease = match self
            .store
            .acquire_lease(run.id, self.config.worker_id.clone(), self.config.lease_ttl)
            .await
        {
            Ok(lease) => lease,
            Err(atelier_store::StoreError::Conflict(_)) => {
                // Another worker holds the run; come back later.
                return Ok(Disposition::Requeue(self.config.lease_ttl / 2));
            }
            Err(err) => return Err(err.into()),
        };

        // Run-scoped context: the run deadline, cancelled early when the
        // worker shuts down or the heartbeat loses the lease.
        let deadline = run
            .deadline
            .and_then(|d| (d - chrono::Utc::now()).to_std().ok())
            .unwrap_or(self.config.run_deadline);
        let (run_ctx, run_cancel) = Ctx::with_timeout(deadline);
        let watchdog = tokio::spawn(Self::watchdog(
            Arc::clone(&self.store),
            run.id,
            lease.token,
            self.config.lease_ttl,
            ctx.clone(),
            run_cancel,
        ));

        let mut driver = RunDriver { run, lease };
        let result = self.drive(&mut driver, &run_ctx).await;
        watchdog.abort();

        let disposition = match result {
            Ok(()) => Disposition::Completed,
            Err(CoreError::StoreConflict(msg)) => {
                // Cancelled from the edge or taken over by a newer worker;
                // either way this worker abandons without corrupting state.
                tracing::info!(run_id = %driver.run.id, %msg, "Yielding run after store conflict");
                Disposition::Completed
            }
            Err(CoreError::Cancelled) => {
                // Worker shutdown or lost lease: leave the run resumable.
                Disposition::Requeue(self.config.retry_backoff)
            }
            Err(err) if err.is_retryable() && job.retry_count < self.config.max_job_retries => {
                tracing::warn!(
                    run_id = %driver.run.id,
                    retry = job.retry_count,
                    %err,
                    "Retryable failure, re-enqueueing"
                );
                self.record_error(&mut driver, &err).await;
                Disposition::Requeue(self.backoff_for(job.retry_count))
            }
            Err(err) => {
                self.fail_run(&mut driver, &err).await;
                Disposition::Failed
            }
        };

        let _ = self
            .store
            .release_lease(driver.run.id, driver.lease.token)
            .await;
        Ok(disposition)
    }

    /// Renews the lease at ttl/3 and propagates worker shutdown into the
    /// run context. Losing the lease cancels the run context, and the next
    /// fenced write would conflict anyway.
    async fn watchdog(
        store: Arc<dyn Store>,
        run_id: RunId,
        token: u64,
        ttl: Duration,
        parent: Ctx,
        cancel: CancelHandle,
    ) {
        let mut interval = tokio::time::interval(ttl / 3);
        interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match store.renew_lease(run_id, token, ttl).await {
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(%run_id, %err, "Lease renewal failed, cancelling work");
                            cancel.cancel();
                            return;
                        }
                    }
                }
                _ = parent.cancelled() => {
                    cancel.cancel();
                    return;
                }
            }
        }
    }

    async fn record_error(&self, driver: &mut RunDriver, err: &CoreError) {
        let update = RunUpdate {
            last_error: Some(RunError::from_core(err)),
            ..Default::default()
        };
        if let Err(write_err) = driver.apply(self.store.as_ref(), update).await {
            tracing::warn!(run_id = %driver.run.id, %write_err, "Could not record run error");
        }
    }

    async fn fail_run(&self, driver: &mut RunDriver, err: &CoreError) {
        tracing::error!(run_id = %driver.run.id, %err, "Run failed");
        let update = RunUpdate {
            state: Some(RunState::Failed),
            last_error: Some(RunError::from_core(err)),
            ..Default::default()
        };
        if let Err(write_err) = driver.apply(self.store.as_ref(), update).await {
            tracing::warn!(run_id = %driver.run.id, %write_err, "Could not mark run failed");
        }
    }

    /// Advance the run through its lifecycle until terminal.
    async fn drive(&self, driver: &mut RunDriver, ctx: &Ctx) -> CoreResult<()> {
        loop {
            ctx.checkpoint()?;
            match driver.run.state {
                RunState::Created => {
                    driver
                        .apply(self.store.as_ref(), RunUpdate::transition(RunState::Validating))
                        .await?;
                }
                RunState::Validating => {
                    self.validate(driver).await?;
                    driver
                        .apply(self.store.as_ref(), RunUpdate::transition(RunState::Decomposing))
                        .await?;
                }
                RunState::Decomposing => {
                    let plan = self.plan_run(driver, ctx).await?;
                    let update = RunUpdate {
                        state: Some(RunState::Scheduling),
                        plan: Some(plan),
                        ..Default::default()
                    };
                    driver.apply(self.store.as_ref(), update).await?;
                }
                RunState::Scheduling => {
                    self.schedule(driver).await?;
                    driver
                        .apply(self.store.as_ref(), RunUpdate::transition(RunState::Executing))
                        .await?;
                }
                RunState::Executing => {
                    self.execute_phases(driver, ctx).await?;
                    driver
                        .apply(self.store.as_ref(), RunUpdate::transition(RunState::Aggregating))
                        .await?;
                }
                RunState::Aggregating => {
                    let result = self.aggregate(driver).await?;
                    let update = RunUpdate {
                        state: Some(RunState::Finalizing),
                        result: Some(result),
                        ..Default::default()
                    };
                    driver.apply(self.store.as_ref(), update).await?;
                }
                RunState::Finalizing => {
                    self.finalize(driver).await?;
                    driver
                        .apply(self.store.as_ref(), RunUpdate::transition(RunState::Completed))
                        .await?;
                    tracing::info!(run_id = %driver.run.id, "Run completed");
                    return Ok(());
                }
                RunState::Completed | RunState::Failed | RunState::Cancelled => return Ok(()),
            }
        }
    }

    async fn validate(&self, driver: &RunDriver) -> CoreResult<()> {
        if driver.run.prompt.trim().is_empty() {
            return Err(CoreError::Validation("prompt is empty".into()));
        }
        let balance = self
            .billing
            .ledger()
            .get_or_create_balance(driver.run.org_id)
            .await?;
        if balance.available_usd() <= Decimal::ZERO {
            return Err(CoreError::InsufficientCredits {
                required: "> 0".to_string(),
                available: balance.available_usd().to_string(),
            });
        }
        Ok(())
    }

    fn run_budget(&self, driver: &RunDriver) -> Option<RunBudget> {
        self.config.run_budget_usd.map(|budget| RunBudget {
            budget,
            spent: Decimal::from_str(&driver.run.cost_usd).unwrap_or(Decimal::ZERO),
        })
    }

    /// The planning loop: generate, score, repair or regenerate under the
    /// session budgets, until accepted or aborted.
    async fn plan_run(&self, driver: &mut RunDriver, ctx: &Ctx) -> CoreResult<Plan> {
        let session_id = driver.run.id.to_string();
        let started = Instant::now();
        let mut suggestions: Vec<RepairSuggestion> = Vec::new();
        let mut pending_repair: Option<f64> = None;
        let mut attempt = 0usize;

        loop {
            ctx.checkpoint()?;
            {
                let scorer = self.scorer.lock().await;
                if let Some(reason) = scorer.should_abort(&session_id, started.elapsed()) {
                    return Err(CoreError::PlanRejected(reason.message));
                }
            }

            let request_text = self.planner.request_text(&driver.run.prompt, &suggestions);
            self.billing
                .pre_call_check(
                    driver.run.org_id,
                    &request_text,
                    &self.config.execution_model,
                    Some(self.config.max_output_tokens),
                    self.run_budget(driver),
                )
                .await?;

            let generation_started = Instant::now();
            let output = self
                .planner
                .generate(&driver.run.prompt, &suggestions, attempt, ctx)
                .await?;
            let generation_time = generation_started.elapsed();

            if output.usage.input_tokens + output.usage.output_tokens > 0 {
                let charge = self
                    .billing
                    .bill_token_call(BillArgs {
                        org_id: driver.run.org_id,
                        run_id: Some(driver.run.id),
                        step_id: None,
                        idempotency_key: format!("{}:plan:{attempt}", driver.run.id),
                        input_tokens: output.usage.input_tokens,
                        output_tokens: output.usage.output_tokens,
                        model: output.model.clone(),
                        provider: self.billing.provider_for(&output.model),
                        is_estimated: false,
                    })
                    .await?;
                if !charge.skipped && !charge.deduplicated {
                    let update = RunUpdate {
                        add_cost_usd: Some(charge.cost_usd),
                        ..Default::default()
                    };
                    driver.apply(self.store.as_ref(), update).await?;
                }
            }

            let result = {
                let mut scorer = self.scorer.lock().await;
                let result = scorer.score(&output.plan, Some(&session_id));
                if let Some(before) = pending_repair.take() {
                    let repair_type = suggestions
                        .first()
                        .map(|s| s.repair_type)
                        .unwrap_or(RepairType::ModifyPhase);
                    scorer.record_repair_attempt(
                        &session_id,
                        repair_type,
                        before,
                        result.score.composite,
                        generation_time,
                    );
                }
                result
            };

            tracing::info!(
                run_id = %driver.run.id,
                attempt,
                composite = result.score.composite,
                decision = ?result.decision,
                "Plan scored"
            );

            match result.decision {
                PlanDecision::Accept => return Ok(output.plan),
                PlanDecision::Repair => {
                    pending_repair = Some(result.score.composite);
                    suggestions = result.suggestions;
                }
                PlanDecision::Regenerate => {
                    self.scorer.lock().await.record_regeneration(&session_id);
                    suggestions.clear();
                }
                PlanDecision::Abort => {
                    let reason = result
                        .reason
                        .unwrap_or_else(|| "planning budget exhausted".to_string());
                    return Err(CoreError::PlanRejected(reason));
                }
            }
            attempt += 1;
        }
    }

    /// Persist the execution order once; replays reuse it.
    async fn schedule(&self, driver: &RunDriver) -> CoreResult<()> {
        let plan = driver
            .run
            .plan
            .as_ref()
            .ok_or_else(|| CoreError::Validation("run has no plan to schedule".into()))?;
        let order = plan.execution_order();
        self.store
            .insert_idempotent(
                driver.run.id,
                &format!("{}:schedule", driver.run.id),
                json!({ "order": order }),
            )
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    fn step_key(run_id: RunId, phase: &PlanPhase, step_index: usize) -> String {
        format!("{run_id}:{}:{step_index}", phase.id)
    }

    async fn execute_phases(&self, driver: &mut RunDriver, ctx: &Ctx) -> CoreResult<()> {
        let plan = driver
            .run
            .plan
            .clone()
            .ok_or_else(|| CoreError::Validation("run has no plan to execute".into()))?;
        let order = plan.execution_order();

        let mut prior_outputs: Vec<String> = Vec::new();
        for (position, phase_idx) in order.iter().enumerate() {
            ctx.checkpoint()?;
            let phase = &plan.phases[*phase_idx];
            let run_id = driver.run.id;
            let complete_key = format!("{run_id}:{}:complete", phase.id);

            // Already-completed phases replay from their checkpoint.
            if let Some(checkpoint) = self
                .store
                .get_checkpoint(run_id, &complete_key)
                .await
                .map_err(CoreError::from)?
            {
                if let Some(output) = checkpoint.get("accumulator").and_then(|v| v.as_str()) {
                    prior_outputs.push(output.to_string());
                }
                continue;
            }

            self.store
                .insert_idempotent(
                    run_id,
                    &format!("{run_id}:{}:start", phase.id),
                    json!({ "position": position }),
                )
                .await
                .map_err(CoreError::from)?;

            let mut accumulator = String::new();
            let mut emitted_keys: Vec<String> = Vec::new();

            // Step 0: the phase's LLM step.
            let llm_key = Self::step_key(run_id, phase, 0);
            let output = self
                .execute_llm_step(driver, phase, &llm_key, &prior_outputs, ctx)
                .await?;
            accumulator.push_str(&output);
            emitted_keys.push(llm_key);

            // Remaining steps: one per required tool, in plan order.
            for (tool_index, tool) in phase.required_tools.iter().enumerate() {
                ctx.checkpoint()?;
                let key = Self::step_key(run_id, phase, tool_index + 1);
                let tool_output = self
                    .execute_tool_step(driver, phase, tool, &key, &accumulator, ctx)
                    .await?;
                accumulator.push_str("\n");
                accumulator.push_str(&tool_output);
                emitted_keys.push(key);
            }

            self.store
                .insert_idempotent(
                    run_id,
                    &complete_key,
                    json!({ "accumulator": accumulator, "keys": emitted_keys }),
                )
                .await
                .map_err(CoreError::from)?;

            let update = RunUpdate {
                completed_phase: Some(position),
                ..Default::default()
            };
            driver.apply(self.store.as_ref(), update).await?;
            tracing::info!(%run_id, phase = %phase.name, position, "Phase completed");

            prior_outputs.push(accumulator);
        }
        Ok(())
    }

    async fn execute_llm_step(
        &self,
        driver: &mut RunDriver,
        phase: &PlanPhase,
        key: &str,
        prior_outputs: &[String],
        ctx: &Ctx,
    ) -> CoreResult<String> {
        // Replay: an already-committed step is reused, not re-executed.
        if let Some(existing) = self
            .store
            .get_checkpoint(driver.run.id, key)
            .await
            .map_err(CoreError::from)?
        {
            if let Some(output) = existing.get("output").and_then(|v| v.as_str()) {
                return Ok(output.to_string());
            }
        }

        let mut prompt = format!(
            "Goal: {}\n\nExecute this phase of the plan.\nPhase: {}\nDetails: {}",
            driver.run.prompt, phase.name, phase.description
        );
        if !prior_outputs.is_empty() {
            prompt.push_str("\n\nOutputs of completed phases:\n");
            prompt.push_str(&prior_outputs.join("\n---\n"));
        }

        self.billing
            .pre_call_check(
                driver.run.org_id,
                &prompt,
                &self.config.execution_model,
                Some(self.config.max_output_tokens),
                self.run_budget(driver),
            )
            .await?;

        let request = CompletionRequest::new(
            self.config.execution_model.clone(),
            vec![Message::user(prompt)],
        )
        .with_max_tokens(self.config.max_output_tokens);
        let response = self.llm.complete(&request, ctx).await?;

        if response.usage.input_tokens + response.usage.output_tokens > 0 {
            let charge = self
                .billing
                .bill_token_call(BillArgs {
                    org_id: driver.run.org_id,
                    run_id: Some(driver.run.id),
                    step_id: Some(key.to_string()),
                    idempotency_key: key.to_string(),
                    input_tokens: response.usage.input_tokens,
                    output_tokens: response.usage.output_tokens,
                    model: response.model.clone(),
                    provider: self.billing.provider_for(&response.model),
                    is_estimated: false,
                })
                .await?;
            if !charge.skipped && !charge.deduplicated {
                let update = RunUpdate {
                    add_cost_usd: Some(charge.cost_usd),
                    ..Default::default()
                };
                driver.apply(self.store.as_ref(), update).await?;
            }
        }

        let write = self
            .store
            .insert_idempotent(driver.run.id, key, json!({ "output": response.content }))
            .await
            .map_err(CoreError::from)?;
        match write {
            IdempotentWrite::Inserted => Ok(response.content),
            // A concurrent replay won the race; its output is canonical.
            IdempotentWrite::Existing(value) => Ok(value
                .get("output")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()),
        }
    }

    async fn execute_tool_step(
        &self,
        driver: &RunDriver,
        phase: &PlanPhase,
        tool: &str,
        key: &str,
        input: &str,
        ctx: &Ctx,
    ) -> CoreResult<String> {
        if let Some(existing) = self
            .store
            .get_checkpoint(driver.run.id, key)
            .await
            .map_err(CoreError::from)?
        {
            if let Some(output) = existing.get("output").and_then(|v| v.as_str()) {
                return Ok(output.to_string());
            }
        }

        let output = self
            .tools
            .invoke(driver.run.id, tool, phase, input, ctx)
            .await?;

        let write = self
            .store
            .insert_idempotent(
                driver.run.id,
                key,
                json!({ "output": output, "tool": tool }),
            )
            .await
            .map_err(CoreError::from)?;
        match write {
            IdempotentWrite::Inserted => Ok(output),
            IdempotentWrite::Existing(value) => Ok(value
                .get("output")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()),
        }
    }

    /// Stitch phase outputs into the run result.
    async fn aggregate(&self, driver: &RunDriver) -> CoreResult<String> {
        let plan = driver
            .run
            .plan
            .as_ref()
            .ok_or_else(|| CoreError::Validation("run has no plan to aggregate".into()))?;

        let mut sections = Vec::new();
        for phase_idx in plan.execution_order() {
            let phase = &plan.phases[phase_idx];
            let key = format!("{}:{}:complete", driver.run.id, phase.id);
            if let Some(checkpoint) = self
                .store
                .get_checkpoint(driver.run.id, &key)
                .await
                .map_err(CoreError::from)?
            {
                if let Some(output) = checkpoint.get("accumulator").and_then(|v| v.as_str()) {
                    sections.push(format!("## {}\n{output}", phase.name));
                }
            }
        }
        Ok(sections.join("\n\n"))
    }

    /// Post-terminal housekeeping: billing reconciliation, sandbox cleanup,
    /// and the assistant message.
    async fn finalize(&self, driver: &RunDriver) -> CoreResult<()> {
        if let Err(err) = self
            .billing
            .reconcile_run(driver.run.org_id, driver.run.id, &[])
            .await
        {
            tracing::warn!(run_id = %driver.run.id, %err, "Reconciliation failed");
        }

        if let Some(sandbox) = &self.sandbox {
            if let Err(err) = sandbox.cleanup(driver.run.id).await {
                tracing::warn!(run_id = %driver.run.id, %err, "Sandbox cleanup failed");
            }
        }

        if let Some(result) = &driver.run.result {
            self.store
                .append_message(driver.run.id, MessageRole::Assistant, result.clone())
                .await
                .map_err(CoreError::from)?;
        }
        Ok(())
    }
}
