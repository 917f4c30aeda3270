//! The ledger facade the billing service talks to.
//!
//! Thin by design: atomicity lives in the store, policy (modes, budgets,
//! retries) lives in billing. The facade adds validation, usage aggregation
//! and the reconciliation flow.

use crate::store::{HistoryQuery, LedgerStore, LedgerStoreError};
use crate::types::{
    ActualUsage, CreditBalance, LedgerEntry, LedgerWriteOutcome, TokenCallArgs,
    TokenReconciliation, TokenRecord, TransactionType, UsageSummary,
};
use atelier_types::{CoreError, OrgId, RunId};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

impl From<LedgerStoreError> for CoreError {
    fn from(value: LedgerStoreError) -> Self {
        match value {
            LedgerStoreError::InsufficientFunds { required, balance } => {
                CoreError::InsufficientCredits {
                    required: required.to_string(),
                    available: balance.to_string(),
                }
            }
            LedgerStoreError::BalanceNotFound(org) => {
                CoreError::StoreFailure(format!("balance missing for org {org}"))
            }
            LedgerStoreError::Backend(msg) => CoreError::StoreFailure(msg),
        }
    }
}

/// Facade over a [`LedgerStore`].
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn LedgerStore> {
        Arc::clone(&self.store)
    }

    /// Record a completed token call. Pass-through to the atomic store
    /// procedure; retries with the same idempotency key are no-ops.
    pub async fn record_token_call(
        &self,
        args: TokenCallArgs,
    ) -> Result<LedgerWriteOutcome, LedgerStoreError> {
        self.store.record_token_call(args).await
    }

    /// Add credits. Rejects transaction types that cannot add credit.
    pub async fn add_credits(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        transaction_type: TransactionType,
        reason: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Result<LedgerWriteOutcome, CoreError> {
        if !transaction_type.can_credit() {
            return Err(CoreError::Validation(format!(
                "transaction type {} cannot add credits",
                transaction_type.as_str()
            )));
        }
        if amount_usd <= Decimal::ZERO {
            return Err(CoreError::Validation(
                "credit amount must be positive".to_string(),
            ));
        }
        self.store
            .add_credits(
                org_id,
                amount_usd,
                transaction_type,
                reason.into(),
                idempotency_key.into(),
            )
            .await
            .map_err(CoreError::from)
    }

    pub async fn get_balance(&self, org_id: OrgId) -> Result<Option<CreditBalance>, CoreError> {
        Ok(self.store.get_balance(org_id).await?)
    }

    pub async fn get_or_create_balance(&self, org_id: OrgId) -> Result<CreditBalance, CoreError> {
        Ok(self.store.get_or_create_balance(org_id).await?)
    }

    pub async fn reserve_credits(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        run_id: RunId,
    ) -> Result<bool, CoreError> {
        Ok(self.store.reserve_credits(org_id, amount_usd, run_id).await?)
    }

    pub async fn release_reserved(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        run_id: RunId,
    ) -> Result<(), CoreError> {
        Ok(self.store.release_reserved(org_id, amount_usd, run_id).await?)
    }

    pub async fn history(
        &self,
        org_id: OrgId,
        query: HistoryQuery,
    ) -> Result<Vec<LedgerEntry>, CoreError> {
        Ok(self.store.history(org_id, query).await?)
    }

    pub async fn token_records_for_run(
        &self,
        run_id: RunId,
        include_estimated: bool,
    ) -> Result<Vec<TokenRecord>, CoreError> {
        Ok(self
            .store
            .token_records_for_run(run_id, include_estimated)
            .await?)
    }

    /// Total actual cost recorded for a run.
    pub async fn run_cost(&self, run_id: RunId) -> Result<Decimal, CoreError> {
        let records = self.store.token_records_for_run(run_id, false).await?;
        Ok(records.iter().map(|r| r.cost_usd).sum())
    }

    /// Aggregate an org's token usage, grouped by model.
    pub async fn usage_summary(&self, org_id: OrgId) -> Result<UsageSummary, CoreError> {
        let entries = self
            .store
            .history(
                org_id,
                HistoryQuery {
                    transaction_type: Some(TransactionType::TokenUsage),
                    ..Default::default()
                },
            )
            .await?;

        // Walk the side-table rows reachable from the usage entries.
        let mut summary = UsageSummary::default();
        for entry in &entries {
            let Some(run_id) = entry.run_id else { continue };
            let records = self.store.token_records_for_run(run_id, true).await?;
            for record in records
                .iter()
                .filter(|r| r.idempotency_key == entry.idempotency_key)
            {
                summary.total_input_tokens += record.input_tokens;
                summary.total_output_tokens += record.output_tokens;
                summary.total_cost_usd += record.cost_usd;
                summary.call_count += 1;
                let by_model = summary.by_model.entry(record.model.clone()).or_default();
                by_model.input_tokens += record.input_tokens;
                by_model.output_tokens += record.output_tokens;
                by_model.cost_usd += record.cost_usd;
                by_model.call_count += 1;
            }
        }
        Ok(summary)
    }

    /// Reconcile a terminated run: flip estimated records to actual and post
    /// one adjustment for the total difference. Idempotent on
    /// `"{run_id}:reconcile"`, so re-running after a crash is safe.
    pub async fn reconcile_run(
        &self,
        org_id: OrgId,
        run_id: RunId,
        actuals: &[ActualUsage],
    ) -> Result<Option<TokenReconciliation>, CoreError> {
        let estimated = self
            .store
            .token_records_for_run(run_id, true)
            .await?
            .into_iter()
            .filter(|r| r.is_estimated)
            .collect::<Vec<_>>();

        if estimated.is_empty() {
            return Ok(None);
        }

        let mut replaced = 0usize;
        let mut estimated_cost = Decimal::ZERO;
        let mut actual_cost = Decimal::ZERO;

        for record in &estimated {
            let Some(actual) = actuals
                .iter()
                .find(|a| a.idempotency_key == record.idempotency_key)
            else {
                continue;
            };
            let previous = self
                .store
                .mark_token_record_actual(
                    org_id,
                    &record.idempotency_key,
                    actual.input_tokens,
                    actual.output_tokens,
                    actual.cost_usd,
                )
                .await?;
            if previous.is_some() {
                replaced += 1;
                estimated_cost += record.cost_usd;
                actual_cost += actual.cost_usd;
            }
        }

        let adjustment = actual_cost - estimated_cost;
        if !adjustment.is_zero() {
            self.store
                .apply_adjustment(
                    org_id,
                    adjustment,
                    Some(run_id),
                    format!("reconciliation for run {run_id}"),
                    format!("{run_id}:reconcile"),
                )
                .await?;
        }

        let reconciliation = TokenReconciliation {
            id: Uuid::new_v4(),
            run_id,
            org_id,
            records_replaced: replaced,
            estimated_cost_usd: estimated_cost,
            actual_cost_usd: actual_cost,
            adjustment_usd: adjustment,
            created_at: Utc::now(),
        };
        self.store.insert_reconciliation(reconciliation.clone()).await?;

        tracing::info!(
            %run_id,
            records_replaced = replaced,
            adjustment = %adjustment,
            "Run reconciled"
        );

        Ok(Some(reconciliation))
    }
}
