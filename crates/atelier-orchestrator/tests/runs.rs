//! End-to-end run scenarios over the in-memory store with stub providers.

use async_trait::async_trait;
use atelier_billing::{BillingConfig, BillingService, PriceTable};
use atelier_ledger::{Direction, LedgerService, MemoryLedger, TransactionType};
use atelier_llm::{
    CompletionRequest, CompletionResponse, GatewayConfig, LlmGateway, LlmProvider, StopReason,
    Usage,
};
use atelier_orchestrator::{
    ExecuteOutcome, Orchestrator, Planner, PlannerOutput, ToolDispatcher, Worker, WorkerConfig,
};
use atelier_scorer::{PlanDecision, RepairSuggestion};
use atelier_store::{JobQueue, MemoryStore, RunStore};
use atelier_types::{
    CoreError, CoreResult, Ctx, ExecuteAction, OrgId, Plan, PlanPhase, RunId, RunState, WorkerId,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// LLM stub billing exactly 4000 input / 1000 output per call on gpt-4o,
/// which prices to $0.02.
struct FixedUsageProvider;

#[async_trait]
impl LlmProvider for FixedUsageProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        _ctx: &Ctx,
    ) -> CoreResult<CompletionResponse> {
        Ok(CompletionResponse {
            content: "phase output".to_string(),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 4000,
                output_tokens: 1000,
            },
            model: request.model.clone(),
            latency_ms: 1,
        })
    }
}

/// Planner stub that serves a scripted sequence of plans, free of charge.
struct ScriptedPlanner {
    plans: Mutex<VecDeque<Plan>>,
}

impl ScriptedPlanner {
    fn new(plans: Vec<Plan>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
        }
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn generate(
        &self,
        _prompt: &str,
        _suggestions: &[RepairSuggestion],
        _attempt: usize,
        _ctx: &Ctx,
    ) -> CoreResult<PlannerOutput> {
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| CoreError::PlanRejected("planner exhausted".into()))?;
        Ok(PlannerOutput {
            plan,
            usage: Usage::default(),
            model: "gpt-4o".to_string(),
        })
    }

    fn request_text(&self, prompt: &str, _suggestions: &[RepairSuggestion]) -> String {
        prompt.to_string()
    }
}

/// Tool dispatcher whose `flaky` tool fails transiently a set number of
/// times before succeeding.
struct FlakyTools {
    failures_left: AtomicU32,
}

impl FlakyTools {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl ToolDispatcher for FlakyTools {
    fn available_tools(&self) -> Vec<String> {
        vec!["flaky".to_string(), "steady".to_string()]
    }

    async fn invoke(
        &self,
        _run_id: RunId,
        tool: &str,
        _phase: &PlanPhase,
        _input: &str,
        _ctx: &Ctx,
    ) -> CoreResult<String> {
        match tool {
            "steady" => Ok("tool output".to_string()),
            "flaky" => {
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    Err(CoreError::TransientProvider("tool backend 503".into()))
                } else {
                    Ok("tool output".to_string())
                }
            }
            other => Err(CoreError::ToolError(format!("unknown tool '{other}'"))),
        }
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    ledger_store: Arc<MemoryLedger>,
    billing: Arc<BillingService>,
    orchestrator: Orchestrator,
    worker: Worker,
    org: OrgId,
}

fn single_phase_plan() -> Plan {
    Plan::new(
        "plan-1",
        "Summarize the attached document",
        vec![PlanPhase::new("p1", "Summarize attached document", "Read it and summarize")
            .with_outputs(vec!["summary".into()])
            .with_risk(0.1)],
    )
}

fn harness(plans: Vec<Plan>, tools: Arc<dyn ToolDispatcher>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let ledger_store = Arc::new(MemoryLedger::new());
    let ledger = LedgerService::new(ledger_store.clone());
    let billing = Arc::new(BillingService::new(
        ledger.clone(),
        BillingConfig {
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        },
        PriceTable::builtin(),
    ));
    let llm = Arc::new(LlmGateway::new(
        Arc::new(FixedUsageProvider),
        GatewayConfig {
            base_backoff: Duration::from_millis(1),
            ..Default::default()
        },
    ));
    let planner = Arc::new(ScriptedPlanner::new(plans));
    let orchestrator = Orchestrator::new(store.clone(), ledger.clone());
    let worker = Worker::new(
        store.clone(),
        billing.clone(),
        llm,
        planner,
        tools,
        None,
        WorkerConfig {
            worker_id: WorkerId::new("test-worker"),
            retry_backoff: Duration::from_millis(1),
            idle_poll: Duration::from_millis(5),
            ..Default::default()
        },
    );

    Harness {
        store,
        ledger_store,
        billing,
        orchestrator,
        worker,
        org: OrgId::generate(),
    }
}

async fn seed(harness: &Harness, balance: Decimal) {
    harness
        .billing
        .ledger()
        .add_credits(harness.org, balance, TransactionType::Purchase, "seed", "seed-1")
        .await
        .unwrap();
}

async fn create_run(harness: &Harness, prompt: &str) -> ExecuteOutcome {
    harness
        .orchestrator
        .execute(ExecuteAction::Create, harness.org, Some(prompt.into()), None)
        .await
        .unwrap()
}

/// Dequeue one job and process it to completion.
async fn work_one(harness: &Harness) {
    let job = harness
        .store
        .dequeue(&WorkerId::new("test-worker"))
        .await
        .unwrap()
        .expect("a job should be queued");
    let (ctx, _handle) = Ctx::background();
    harness.worker.process_job(job, &ctx).await;
}

#[tokio::test]
async fn happy_run_completes_and_charges_once() {
    let harness = harness(vec![single_phase_plan()], Arc::new(FlakyTools::new(0)));
    seed(&harness, dec!(10.00)).await;

    let created = create_run(&harness, "Summarize the attached document").await;
    work_one(&harness).await;

    let run = harness
        .store
        .get_run(created.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Completed, "error: {:?}", run.last_error);
    assert!(run.result.is_some());
    assert_eq!(run.cost_usd, "0.02");

    // Exactly one debit of $0.02, balance 9.98.
    let entries = harness.ledger_store.entries().await;
    let debits: Vec<_> = entries
        .iter()
        .filter(|e| e.direction == Direction::Debit)
        .collect();
    assert_eq!(debits.len(), 1);
    assert_eq!(debits[0].amount_usd, dec!(0.02));

    let balance = harness
        .billing
        .ledger()
        .get_balance(harness.org)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(balance.balance_usd, dec!(9.98));
}

#[tokio::test]
async fn plan_repair_then_accept() {
    // First plan misses the goal entirely (composite in the repair band);
    // the repaired plan covers it.
    let vague = Plan::new(
        "plan-vague",
        "Research market trends and create report",
        vec![PlanPhase::new("p1", "Unrelated busywork", "does nothing relevant").with_risk(0.0)],
    );
    let good = Plan::new(
        "plan-good",
        "Research market trends and create report",
        vec![
            PlanPhase::new("p1", "Research market trends", "gather market data")
                .with_outputs(vec!["data".into()])
                .with_risk(0.1),
            PlanPhase::new("p2", "Create report", "write the report")
                .with_outputs(vec!["report".into()])
                .with_dependencies(vec!["p1".into()])
                .with_risk(0.1),
        ],
    );

    let harness = harness(vec![vague, good], Arc::new(FlakyTools::new(0)));
    seed(&harness, dec!(10.00)).await;

    let created = create_run(&harness, "Research market trends and create report").await;
    work_one(&harness).await;

    let run = harness
        .store
        .get_run(created.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Completed, "error: {:?}", run.last_error);

    let session = harness
        .worker
        .planning_session(created.run_id)
        .await
        .expect("planning session recorded");
    assert_eq!(
        session.decision_history,
        vec![PlanDecision::Repair, PlanDecision::Accept]
    );
    assert_eq!(session.repair_attempts.len(), 1);
}

#[tokio::test]
async fn out_of_credit_fails_without_ledger_entries() {
    let harness = harness(vec![single_phase_plan()], Arc::new(FlakyTools::new(0)));
    seed(&harness, dec!(0.01)).await;

    let created = create_run(&harness, "Summarize the attached document").await;
    work_one(&harness).await;

    let run = harness
        .store
        .get_run(created.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.last_error.as_ref().unwrap().code, "insufficient_credits");

    // No debit was ever written.
    let entries = harness.ledger_store.entries().await;
    assert!(entries.iter().all(|e| e.direction == Direction::Credit));
}

#[tokio::test]
async fn crash_recovery_replays_without_double_charging() {
    // Two phases; the second phase's tool fails transiently after the LLM
    // step has already committed its charge, simulating a worker dying
    // between a step commit and the phase-complete checkpoint.
    let plan = Plan::new(
        "plan-2ph",
        "Summarize the attached document thoroughly",
        vec![
            PlanPhase::new("p1", "Summarize attached document", "first pass")
                .with_outputs(vec!["summary".into()])
                .with_risk(0.1),
            PlanPhase::new("p2", "Review summarize output", "second pass over the document")
                .with_outputs(vec!["review".into()])
                .with_dependencies(vec!["p1".into()])
                .with_tools(vec!["flaky".into()])
                .with_risk(0.1),
        ],
    );

    let harness = harness(vec![plan], Arc::new(FlakyTools::new(1)));
    seed(&harness, dec!(10.00)).await;

    let created = create_run(&harness, "Summarize the attached document thoroughly").await;

    // First worker pass: phase 1 completes, phase 2 commits its LLM step
    // then dies on the tool; the job is re-enqueued.
    work_one(&harness).await;
    let run = harness
        .store
        .get_run(created.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Executing);

    // Backoff is milliseconds in this config.
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Second pass replays phase 2 from step 0; committed steps
    // short-circuit on their idempotency keys.
    work_one(&harness).await;
    let run = harness
        .store
        .get_run(created.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Completed, "error: {:?}", run.last_error);

    // Exactly one debit per unique LLM step (two phases, one step each).
    let entries = harness.ledger_store.entries().await;
    let debits: Vec<_> = entries
        .iter()
        .filter(|e| e.direction == Direction::Debit)
        .collect();
    assert_eq!(debits.len(), 2);

    let balance = harness
        .billing
        .ledger()
        .get_balance(harness.org)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(balance.balance_usd, dec!(9.96));
}

#[tokio::test]
async fn cancelled_run_is_left_alone_by_the_worker() {
    let harness = harness(vec![single_phase_plan()], Arc::new(FlakyTools::new(0)));
    seed(&harness, dec!(10.00)).await;

    let created = create_run(&harness, "Summarize the attached document").await;
    harness
        .orchestrator
        .execute(ExecuteAction::Stop, harness.org, None, Some(created.run_id))
        .await
        .unwrap();

    work_one(&harness).await;

    let run = harness
        .store
        .get_run(created.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Cancelled);
    // No work happened, nothing was charged.
    assert!(harness
        .ledger_store
        .entries()
        .await
        .iter()
        .all(|e| e.direction == Direction::Credit));
}

#[tokio::test]
async fn retry_action_creates_a_fresh_run_after_failure() {
    let harness = harness(vec![], Arc::new(FlakyTools::new(0)));
    seed(&harness, dec!(10.00)).await;

    // With no scripted plans the planner errors and the run fails.
    let created = create_run(&harness, "Do something").await;
    work_one(&harness).await;
    let run = harness
        .store
        .get_run(created.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Failed);

    let retried = harness
        .orchestrator
        .execute(ExecuteAction::Retry, harness.org, None, Some(created.run_id))
        .await
        .unwrap();
    assert_ne!(retried.run_id, created.run_id);

    let fresh = harness
        .store
        .get_run(retried.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.prompt, "Do something");
    assert_eq!(fresh.state, RunState::Created);
}
