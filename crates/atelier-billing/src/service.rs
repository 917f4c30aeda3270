//! The billing service proper.

use crate::pricing::PriceTable;
use crate::tokenizer::TokenEstimator;
use atelier_ledger::store::LedgerStoreError;
use atelier_ledger::{ActualUsage, LedgerService, Provider, TokenCallArgs, TokenReconciliation};
use atelier_ratelimit::{RateLimiter, SlidingWindowLimiter};
use atelier_types::{CoreError, CoreResult, OrgId, RunId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex as SyncMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Billing operating modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// Full billing.
    Normal,
    /// Partial functionality; charges still recorded.
    Degraded,
    /// Ledger kept failing: operations proceed, charges are skipped and
    /// marked.
    ReadOnly,
    /// Operator-imposed total bypass.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub max_cost_per_call: Decimal,
    pub default_run_budget: Decimal,
    pub rate_limit_requests_per_minute: usize,
    pub rate_limit_tokens_per_minute: u64,
    /// Consecutive failures before dropping to read-only.
    pub failure_threshold: u32,
    /// Quiet period before a read-only service probes the ledger again.
    pub recovery_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Safety buffer applied to pre-call estimates.
    pub estimation_buffer_pct: Decimal,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            max_cost_per_call: dec!(10.00),
            default_run_budget: dec!(50.00),
            rate_limit_requests_per_minute: 100,
            rate_limit_tokens_per_minute: 1_000_000,
            failure_threshold: 3,
            recovery_interval: Duration::from_secs(300),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            estimation_buffer_pct: dec!(0.20),
        }
    }
}

struct BillingState {
    mode: BillingMode,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    read_only_reason: Option<String>,
}

/// A run-scoped spend ceiling for pre-call checks.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    pub budget: Decimal,
    pub spent: Decimal,
}

/// What the pre-call gate computed.
#[derive(Debug, Clone)]
pub struct PreCallEstimate {
    pub input_tokens: u64,
    pub max_output_tokens: u64,
    pub base_cost: Decimal,
    /// Base cost with the safety buffer; this is what was checked against
    /// the balance.
    pub budgeted_cost: Decimal,
}

/// Arguments for the post-call charge.
#[derive(Debug, Clone)]
pub struct BillArgs {
    pub org_id: OrgId,
    pub run_id: Option<RunId>,
    pub step_id: Option<String>,
    pub idempotency_key: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub provider: Provider,
    /// True when the counts came from estimation because the provider
    /// returned no usage.
    pub is_estimated: bool,
}

/// Outcome of a post-call charge.
#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub cost_usd: Decimal,
    /// Set when billing skipped recording (read-only or disabled mode).
    pub skipped: bool,
    pub mode: BillingMode,
    pub deduplicated: bool,
}

/// Pre-call estimation, budget gating, post-call charging, degradation.
pub struct BillingService {
    ledger: LedgerService,
    config: BillingConfig,
    prices: PriceTable,
    estimator: TokenEstimator,
    state: Mutex<BillingState>,
    request_limiter: SlidingWindowLimiter,
    /// Sliding-minute token volume per org.
    token_volume: SyncMutex<HashMap<OrgId, Vec<(Instant, u64)>>>,
}

impl BillingService {
    pub fn new(ledger: LedgerService, config: BillingConfig, prices: PriceTable) -> Self {
        let request_limiter = SlidingWindowLimiter::new(
            config.rate_limit_requests_per_minute,
            Duration::from_secs(60),
        );
        Self {
            ledger,
            config,
            prices,
            estimator: TokenEstimator::new(),
            state: Mutex::new(BillingState {
                mode: BillingMode::Normal,
                consecutive_failures: 0,
                last_failure_at: None,
                read_only_reason: None,
            }),
            request_limiter,
            token_volume: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    /// Which provider a model id is priced against.
    pub fn provider_for(&self, model: &str) -> Provider {
        self.prices.rate(model).provider
    }

    pub async fn mode(&self) -> BillingMode {
        self.state.lock().await.mode
    }

    pub async fn is_operational(&self) -> bool {
        matches!(
            self.state.lock().await.mode,
            BillingMode::Normal | BillingMode::Degraded
        )
    }

    // ── Rate limiting ────────────────────────────────────────────────

    fn check_org_limits(&self, org_id: OrgId) -> CoreResult<()> {
        let key = org_id.to_string();
        let info = self.request_limiter.check(&key);
        if !info.allowed() {
            return Err(CoreError::RateLimited {
                scope: "billing requests per minute".to_string(),
                retry_after: info.retry_after.unwrap_or(Duration::from_secs(60)),
            });
        }

        let mut volumes = self
            .token_volume
            .lock()
            .map_err(|_| CoreError::StoreFailure("token volume lock poisoned".to_string()))?;
        let window = volumes.entry(org_id).or_default();
        let now = Instant::now();
        window.retain(|(t, _)| now.duration_since(*t) < Duration::from_secs(60));
        let used: u64 = window.iter().map(|(_, n)| n).sum();
        if used >= self.config.rate_limit_tokens_per_minute {
            let retry_after = window
                .first()
                .map(|(t, _)| Duration::from_secs(60).saturating_sub(now.duration_since(*t)))
                .unwrap_or(Duration::from_secs(60));
            return Err(CoreError::RateLimited {
                scope: "billing tokens per minute".to_string(),
                retry_after,
            });
        }
        Ok(())
    }

    fn note_token_volume(&self, org_id: OrgId, tokens: u64) {
        if let Ok(mut volumes) = self.token_volume.lock() {
            volumes.entry(org_id).or_default().push((Instant::now(), tokens));
        }
    }

    // ── Pre-call contract ────────────────────────────────────────────

    /// Estimate and gate a pending LLM call.
    ///
    /// Rejections, in order: `RateLimited`, `PerCallLimit`,
    /// `InsufficientCredits`, `RunBudget`. In read-only or disabled mode the
    /// gate lets the call proceed without checks.
    pub async fn pre_call_check(
        &self,
        org_id: OrgId,
        input_text: &str,
        model: &str,
        max_output_tokens: Option<u32>,
        run_budget: Option<RunBudget>,
    ) -> CoreResult<PreCallEstimate> {
        let input_tokens = self.estimator.estimate_input_tokens(model, input_text);
        let max_output_tokens = max_output_tokens.unwrap_or(1024) as u64;
        let base_cost = self.prices.cost(model, input_tokens, max_output_tokens);
        let budgeted_cost = base_cost * (Decimal::ONE + self.config.estimation_buffer_pct);

        let estimate = PreCallEstimate {
            input_tokens,
            max_output_tokens,
            base_cost,
            budgeted_cost,
        };

        if !self.is_operational().await {
            let mode = self.mode().await;
            tracing::warn!(%org_id, mode = ?mode, "Billing gate bypassed");
            return Ok(estimate);
        }

        self.check_org_limits(org_id)?;

        if budgeted_cost > self.config.max_cost_per_call {
            return Err(CoreError::PerCallLimit(format!(
                "estimated ${budgeted_cost} exceeds per-call limit ${}",
                self.config.max_cost_per_call
            )));
        }

        let balance = self.ledger.get_or_create_balance(org_id).await?;
        if balance.available_usd() < budgeted_cost {
            return Err(CoreError::InsufficientCredits {
                required: budgeted_cost.to_string(),
                available: balance.available_usd().to_string(),
            });
        }

        if let Some(run_budget) = run_budget {
            if run_budget.spent + budgeted_cost > run_budget.budget {
                return Err(CoreError::RunBudget(format!(
                    "spent ${} + estimated ${budgeted_cost} exceeds run budget ${}",
                    run_budget.spent, run_budget.budget
                )));
            }
        }

        Ok(estimate)
    }

    // ── Post-call contract ───────────────────────────────────────────

    /// Charge for a completed call. Retries transient store failures with
    /// exponential backoff; the idempotency key makes retries safe. After
    /// `failure_threshold` consecutive failed charges the service drops to
    /// read-only.
    pub async fn bill_token_call(&self, args: BillArgs) -> CoreResult<ChargeOutcome> {
        let cost = self
            .prices
            .cost(&args.model, args.input_tokens, args.output_tokens);

        // In read-only mode, probe the ledger again once the quiet period
        // has passed; otherwise skip and mark.
        let probing = {
            let state = self.state.lock().await;
            match state.mode {
                BillingMode::Normal | BillingMode::Degraded => false,
                BillingMode::Disabled => {
                    tracing::warn!(org_id = %args.org_id, "Billing disabled, charge skipped");
                    return Ok(ChargeOutcome {
                        cost_usd: cost,
                        skipped: true,
                        mode: BillingMode::Disabled,
                        deduplicated: false,
                    });
                }
                BillingMode::ReadOnly => {
                    let quiet = state
                        .last_failure_at
                        .map(|t| t.elapsed() >= self.config.recovery_interval)
                        .unwrap_or(true);
                    if !quiet {
                        tracing::warn!(
                            org_id = %args.org_id,
                            reason = state.read_only_reason.as_deref().unwrap_or("unknown"),
                            "Billing read-only, charge skipped"
                        );
                        return Ok(ChargeOutcome {
                            cost_usd: cost,
                            skipped: true,
                            mode: BillingMode::ReadOnly,
                            deduplicated: false,
                        });
                    }
                    true
                }
            }
        };

        let call = TokenCallArgs {
            org_id: args.org_id,
            run_id: args.run_id,
            step_id: args.step_id.clone(),
            idempotency_key: args.idempotency_key.clone(),
            input_tokens: args.input_tokens,
            output_tokens: args.output_tokens,
            model: args.model.clone(),
            provider: args.provider,
            cost_usd: cost,
            is_estimated: args.is_estimated,
        };

        let mut last_error: Option<LedgerStoreError> = None;
        for attempt in 0..self.config.max_retries {
            match self.ledger.record_token_call(call.clone()).await {
                Ok(outcome) => {
                    self.record_success(probing).await;
                    self.note_token_volume(args.org_id, args.input_tokens + args.output_tokens);
                    return Ok(ChargeOutcome {
                        cost_usd: cost,
                        skipped: false,
                        mode: self.mode().await,
                        deduplicated: outcome.deduplicated,
                    });
                }
                Err(err @ LedgerStoreError::InsufficientFunds { .. }) => {
                    // A policy rejection, not a backend failure.
                    return Err(err.into());
                }
                Err(err) => {
                    tracing::warn!(
                        org_id = %args.org_id,
                        attempt,
                        error = %err,
                        "Charge attempt failed"
                    );
                    last_error = Some(err);
                    if attempt + 1 < self.config.max_retries {
                        tokio::time::sleep(self.config.retry_delay * 2u32.pow(attempt)).await;
                    }
                }
            }
        }

        let error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.record_failure(&error).await;
        Err(CoreError::StoreFailure(format!(
            "charge failed after {} attempts: {error}",
            self.config.max_retries
        )))
    }

    async fn record_failure(&self, error: &str) {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;
        state.last_failure_at = Some(Instant::now());
        if state.consecutive_failures >= self.config.failure_threshold
            && matches!(state.mode, BillingMode::Normal | BillingMode::Degraded)
        {
            state.mode = BillingMode::ReadOnly;
            state.read_only_reason = Some(format!("too many ledger failures: {error}"));
            tracing::error!(error, "Billing switched to read-only mode");
        }
    }

    async fn record_success(&self, was_probing: bool) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
        if state.mode == BillingMode::ReadOnly && was_probing {
            state.mode = BillingMode::Normal;
            state.read_only_reason = None;
            tracing::info!("Billing recovered from read-only mode");
        }
    }

    // ── Reconciliation ───────────────────────────────────────────────

    /// Replace estimated records for a terminated run with actuals and post
    /// the difference as one idempotent adjustment.
    pub async fn reconcile_run(
        &self,
        org_id: OrgId,
        run_id: RunId,
        actuals: &[ActualUsage],
    ) -> CoreResult<Option<TokenReconciliation>> {
        self.ledger.reconcile_run(org_id, run_id, actuals).await
    }

    // ── Operator controls ────────────────────────────────────────────

    pub async fn force_read_only(&self, reason: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.mode = BillingMode::ReadOnly;
        state.read_only_reason = Some(reason.into());
        state.last_failure_at = Some(Instant::now());
    }

    pub async fn force_normal(&self) {
        let mut state = self.state.lock().await;
        state.mode = BillingMode::Normal;
        state.read_only_reason = None;
        state.consecutive_failures = 0;
    }

    pub async fn disable(&self) {
        self.state.lock().await.mode = BillingMode::Disabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_ledger::memory::MemoryLedger;
    use atelier_ledger::store::{HistoryQuery, LedgerStore};
    use atelier_ledger::{
        CreditBalance, LedgerEntry, LedgerWriteOutcome, TokenRecord, TransactionType,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Ledger wrapper that fails the first N token-call writes.
    struct FlakyLedger {
        inner: MemoryLedger,
        fail_first: AtomicU32,
    }

    impl FlakyLedger {
        fn new(fail_first: u32) -> Self {
            Self {
                inner: MemoryLedger::new(),
                fail_first: AtomicU32::new(fail_first),
            }
        }
    }

    #[async_trait::async_trait]
    impl LedgerStore for FlakyLedger {
        async fn record_token_call(
            &self,
            args: TokenCallArgs,
        ) -> Result<LedgerWriteOutcome, LedgerStoreError> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(LedgerStoreError::Backend("connection reset".to_string()));
            }
            self.inner.record_token_call(args).await
        }

        async fn add_credits(
            &self,
            org_id: OrgId,
            amount_usd: Decimal,
            transaction_type: TransactionType,
            reason: String,
            idempotency_key: String,
        ) -> Result<LedgerWriteOutcome, LedgerStoreError> {
            self.inner
                .add_credits(org_id, amount_usd, transaction_type, reason, idempotency_key)
                .await
        }

        async fn apply_adjustment(
            &self,
            org_id: OrgId,
            amount_usd: Decimal,
            run_id: Option<RunId>,
            reason: String,
            idempotency_key: String,
        ) -> Result<LedgerWriteOutcome, LedgerStoreError> {
            self.inner
                .apply_adjustment(org_id, amount_usd, run_id, reason, idempotency_key)
                .await
        }

        async fn get_balance(
            &self,
            org_id: OrgId,
        ) -> Result<Option<CreditBalance>, LedgerStoreError> {
            self.inner.get_balance(org_id).await
        }

        async fn get_or_create_balance(
            &self,
            org_id: OrgId,
        ) -> Result<CreditBalance, LedgerStoreError> {
            self.inner.get_or_create_balance(org_id).await
        }

        async fn reserve_credits(
            &self,
            org_id: OrgId,
            amount_usd: Decimal,
            run_id: RunId,
        ) -> Result<bool, LedgerStoreError> {
            self.inner.reserve_credits(org_id, amount_usd, run_id).await
        }

        async fn release_reserved(
            &self,
            org_id: OrgId,
            amount_usd: Decimal,
            run_id: RunId,
        ) -> Result<(), LedgerStoreError> {
            self.inner.release_reserved(org_id, amount_usd, run_id).await
        }

        async fn history(
            &self,
            org_id: OrgId,
            query: HistoryQuery,
        ) -> Result<Vec<LedgerEntry>, LedgerStoreError> {
            self.inner.history(org_id, query).await
        }

        async fn token_records_for_run(
            &self,
            run_id: RunId,
            include_estimated: bool,
        ) -> Result<Vec<TokenRecord>, LedgerStoreError> {
            self.inner
                .token_records_for_run(run_id, include_estimated)
                .await
        }

        async fn mark_token_record_actual(
            &self,
            org_id: OrgId,
            idempotency_key: &str,
            input_tokens: u64,
            output_tokens: u64,
            cost_usd: Decimal,
        ) -> Result<Option<TokenRecord>, LedgerStoreError> {
            self.inner
                .mark_token_record_actual(org_id, idempotency_key, input_tokens, output_tokens, cost_usd)
                .await
        }

        async fn insert_reconciliation(
            &self,
            reconciliation: TokenReconciliation,
        ) -> Result<(), LedgerStoreError> {
            self.inner.insert_reconciliation(reconciliation).await
        }
    }

    fn fast_config() -> BillingConfig {
        BillingConfig {
            retry_delay: Duration::from_millis(1),
            recovery_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn service_with(store: Arc<dyn LedgerStore>) -> BillingService {
        BillingService::new(LedgerService::new(store), fast_config(), PriceTable::builtin())
    }

    async fn seeded(balance: Decimal) -> (BillingService, OrgId) {
        let service = service_with(Arc::new(MemoryLedger::new()));
        let org = OrgId::generate();
        service
            .ledger()
            .add_credits(org, balance, TransactionType::Purchase, "seed", "seed-1")
            .await
            .unwrap();
        (service, org)
    }

    fn bill_args(org: OrgId, key: &str, input: u64, output: u64) -> BillArgs {
        BillArgs {
            org_id: org,
            run_id: None,
            step_id: None,
            idempotency_key: key.to_string(),
            input_tokens: input,
            output_tokens: output,
            model: "gpt-4o".to_string(),
            provider: Provider::Openai,
            is_estimated: false,
        }
    }

    #[tokio::test]
    async fn pre_call_passes_with_funds() {
        let (service, org) = seeded(dec!(10.00)).await;
        let estimate = service
            .pre_call_check(org, "summarize this document", "gpt-4o", Some(500), None)
            .await
            .unwrap();
        assert!(estimate.budgeted_cost > estimate.base_cost);
    }

    #[tokio::test]
    async fn pre_call_rejects_insufficient_credits() {
        let (service, org) = seeded(dec!(0.01)).await;
        let err = service
            .pre_call_check(org, &"long prompt ".repeat(5000), "gpt-4o", Some(4096), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientCredits { .. }));
    }

    #[tokio::test]
    async fn pre_call_rejects_per_call_limit() {
        let (service, org) = seeded(dec!(1000.00)).await;
        // ~16M input chars -> ~4M tokens -> over $10 with the buffer applied.
        let err = service
            .pre_call_check(org, &"x".repeat(16_000_000), "gpt-4o", Some(4096), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PerCallLimit(_)));
    }

    #[tokio::test]
    async fn pre_call_rejects_run_budget() {
        let (service, org) = seeded(dec!(100.00)).await;
        let err = service
            .pre_call_check(
                org,
                &"x".repeat(40_000),
                "gpt-4o",
                Some(4096),
                Some(RunBudget {
                    budget: dec!(0.05),
                    spent: dec!(0.04),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RunBudget(_)));
    }

    #[tokio::test]
    async fn post_call_charges_and_decrements() {
        let (service, org) = seeded(dec!(10.00)).await;
        let outcome = service
            .bill_token_call(bill_args(org, "k1", 4000, 1000))
            .await
            .unwrap();
        assert!(!outcome.skipped);
        assert_eq!(outcome.cost_usd, dec!(0.02));

        let balance = service.ledger().get_balance(org).await.unwrap().unwrap();
        assert_eq!(balance.balance_usd, dec!(9.98));
    }

    #[tokio::test]
    async fn zero_cost_charge_succeeds_on_zero_balance() {
        let service = service_with(Arc::new(MemoryLedger::new()));
        let org = OrgId::generate();
        let outcome = service
            .bill_token_call(bill_args(org, "k1", 0, 0))
            .await
            .unwrap();
        assert!(!outcome.skipped);
        assert_eq!(outcome.cost_usd, Decimal::ZERO);
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried_with_one_ledger_entry() {
        let flaky = Arc::new(FlakyLedger::new(2));
        let service = service_with(flaky.clone());
        let org = OrgId::generate();
        flaky
            .add_credits(org, dec!(10.00), TransactionType::Purchase, "seed".into(), "c1".into())
            .await
            .unwrap();

        let outcome = service
            .bill_token_call(bill_args(org, "k1", 4000, 1000))
            .await
            .unwrap();
        assert!(!outcome.skipped);
        assert!(!outcome.deduplicated);
        assert_eq!(flaky.inner.entries().await.len(), 2); // seed credit + one debit
    }

    #[tokio::test]
    async fn repeated_idempotency_key_deduplicates() {
        let (service, org) = seeded(dec!(10.00)).await;
        service
            .bill_token_call(bill_args(org, "k1", 4000, 1000))
            .await
            .unwrap();
        let second = service
            .bill_token_call(bill_args(org, "k1", 4000, 1000))
            .await
            .unwrap();
        assert!(second.deduplicated);

        let balance = service.ledger().get_balance(org).await.unwrap().unwrap();
        assert_eq!(balance.balance_usd, dec!(9.98));
    }

    #[tokio::test]
    async fn persistent_failures_drop_to_read_only() {
        let flaky = Arc::new(FlakyLedger::new(u32::MAX));
        let service = service_with(flaky);
        let org = OrgId::generate();

        for i in 0..3 {
            let result = service
                .bill_token_call(bill_args(org, &format!("k{i}"), 100, 50))
                .await;
            assert!(result.is_err());
        }
        assert_eq!(service.mode().await, BillingMode::ReadOnly);

        // Within the quiet period charges are skipped with a marker.
        let outcome = service
            .bill_token_call(bill_args(org, "k-next", 100, 50))
            .await
            .unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.mode, BillingMode::ReadOnly);
    }

    #[tokio::test]
    async fn read_only_recovers_after_quiet_period() {
        let flaky = Arc::new(FlakyLedger::new(9)); // three charges worth of failures
        let service = service_with(flaky.clone());
        let org = OrgId::generate();
        flaky
            .add_credits(org, dec!(10.00), TransactionType::Purchase, "seed".into(), "c1".into())
            .await
            .unwrap();

        for i in 0..3 {
            let _ = service
                .bill_token_call(bill_args(org, &format!("k{i}"), 100, 50))
                .await;
        }
        assert_eq!(service.mode().await, BillingMode::ReadOnly);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Past the quiet period the next charge probes the (now healthy)
        // ledger and recovery flips the mode back.
        let outcome = service
            .bill_token_call(bill_args(org, "probe", 100, 50))
            .await
            .unwrap();
        assert!(!outcome.skipped);
        assert_eq!(service.mode().await, BillingMode::Normal);
    }

    #[tokio::test]
    async fn disabled_mode_skips_everything() {
        let (service, org) = seeded(dec!(10.00)).await;
        service.disable().await;

        let outcome = service
            .bill_token_call(bill_args(org, "k1", 4000, 1000))
            .await
            .unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.mode, BillingMode::Disabled);

        let balance = service.ledger().get_balance(org).await.unwrap().unwrap();
        assert_eq!(balance.balance_usd, dec!(10.00));
    }

    #[tokio::test]
    async fn request_rate_limit_rejects() {
        let config = BillingConfig {
            rate_limit_requests_per_minute: 2,
            ..fast_config()
        };
        let service = BillingService::new(
            LedgerService::new(Arc::new(MemoryLedger::new())),
            config,
            PriceTable::builtin(),
        );
        let org = OrgId::generate();
        service
            .ledger()
            .add_credits(org, dec!(10.00), TransactionType::Purchase, "seed", "c1")
            .await
            .unwrap();

        service.pre_call_check(org, "a", "gpt-4o", None, None).await.unwrap();
        service.pre_call_check(org, "b", "gpt-4o", None, None).await.unwrap();
        let err = service
            .pre_call_check(org, "c", "gpt-4o", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn token_volume_limit_rejects() {
        let config = BillingConfig {
            rate_limit_tokens_per_minute: 1000,
            ..fast_config()
        };
        let service = BillingService::new(
            LedgerService::new(Arc::new(MemoryLedger::new())),
            config,
            PriceTable::builtin(),
        );
        let org = OrgId::generate();
        service
            .ledger()
            .add_credits(org, dec!(10.00), TransactionType::Purchase, "seed", "c1")
            .await
            .unwrap();

        service
            .bill_token_call(bill_args(org, "k1", 900, 200))
            .await
            .unwrap();
        let err = service
            .pre_call_check(org, "next", "gpt-4o", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn insufficient_funds_at_charge_time_is_not_a_backend_failure() {
        let service = service_with(Arc::new(MemoryLedger::new()));
        let org = OrgId::generate();

        let err = service
            .bill_token_call(bill_args(org, "k1", 4000, 1000))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientCredits { .. }));
        // Policy rejections do not poison the mode.
        assert_eq!(service.mode().await, BillingMode::Normal);
    }
}
