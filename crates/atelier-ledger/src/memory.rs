//! In-memory ledger backend.
//!
//! Used by tests and single-process deployments. One mutex over the whole
//! ledger state gives the same atomicity the Postgres backend gets from
//! transactions; contention is not a concern at that scale.

use crate::store::{HistoryQuery, LedgerStore, LedgerStoreError};
use crate::types::{
    CreditBalance, Direction, LedgerEntry, LedgerWriteOutcome, TokenCallArgs, TokenReconciliation,
    TokenRecord, TransactionType,
};
use atelier_types::{OrgId, RunId};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    token_records: Vec<TokenRecord>,
    balances: HashMap<OrgId, CreditBalance>,
    reconciliations: Vec<TokenReconciliation>,
    /// (org, idempotency key) -> outcome of the original write.
    seen_keys: HashMap<(OrgId, String), LedgerWriteOutcome>,
}

impl LedgerState {
    fn balance_mut(&mut self, org_id: OrgId) -> &mut CreditBalance {
        self.balances.entry(org_id).or_insert_with(|| CreditBalance {
            org_id,
            balance_usd: Decimal::ZERO,
            reserved_usd: Decimal::ZERO,
            updated_at: Utc::now(),
        })
    }
}

/// A fully in-memory [`LedgerStore`].
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/debug helper: every entry ever written, in insertion order.
    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().await.entries.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn record_token_call(
        &self,
        args: TokenCallArgs,
    ) -> Result<LedgerWriteOutcome, LedgerStoreError> {
        let mut state = self.state.lock().await;

        let dedupe_key = (args.org_id, args.idempotency_key.clone());
        if let Some(existing) = state.seen_keys.get(&dedupe_key) {
            return Ok(LedgerWriteOutcome {
                deduplicated: true,
                ..existing.clone()
            });
        }

        let balance = state.balance_mut(args.org_id);
        if balance.balance_usd < args.cost_usd {
            return Err(LedgerStoreError::InsufficientFunds {
                required: args.cost_usd,
                balance: balance.balance_usd,
            });
        }
        balance.balance_usd -= args.cost_usd;
        balance.updated_at = Utc::now();
        let new_balance = balance.balance_usd;

        let entry_id = Uuid::new_v4();
        state.entries.push(LedgerEntry {
            id: entry_id,
            org_id: args.org_id,
            amount_usd: args.cost_usd,
            direction: Direction::Debit,
            transaction_type: TransactionType::TokenUsage,
            run_id: args.run_id,
            step_id: args.step_id.clone(),
            idempotency_key: args.idempotency_key.clone(),
            reason: None,
            created_at: Utc::now(),
        });
        state.token_records.push(TokenRecord {
            id: Uuid::new_v4(),
            org_id: args.org_id,
            run_id: args.run_id,
            step_id: args.step_id,
            idempotency_key: args.idempotency_key.clone(),
            input_tokens: args.input_tokens,
            output_tokens: args.output_tokens,
            model: args.model,
            provider: args.provider,
            cost_usd: args.cost_usd,
            is_estimated: args.is_estimated,
            created_at: Utc::now(),
        });

        let outcome = LedgerWriteOutcome {
            entry_id,
            new_balance_usd: new_balance,
            deduplicated: false,
        };
        state.seen_keys.insert(dedupe_key, outcome.clone());
        Ok(outcome)
    }

    async fn add_credits(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        transaction_type: TransactionType,
        reason: String,
        idempotency_key: String,
    ) -> Result<LedgerWriteOutcome, LedgerStoreError> {
        let mut state = self.state.lock().await;

        let dedupe_key = (org_id, idempotency_key.clone());
        if let Some(existing) = state.seen_keys.get(&dedupe_key) {
            return Ok(LedgerWriteOutcome {
                deduplicated: true,
                ..existing.clone()
            });
        }

        let balance = state.balance_mut(org_id);
        balance.balance_usd += amount_usd;
        balance.updated_at = Utc::now();
        let new_balance = balance.balance_usd;

        let entry_id = Uuid::new_v4();
        state.entries.push(LedgerEntry {
            id: entry_id,
            org_id,
            amount_usd,
            direction: Direction::Credit,
            transaction_type,
            run_id: None,
            step_id: None,
            idempotency_key: idempotency_key.clone(),
            reason: Some(reason),
            created_at: Utc::now(),
        });

        let outcome = LedgerWriteOutcome {
            entry_id,
            new_balance_usd: new_balance,
            deduplicated: false,
        };
        state.seen_keys.insert(dedupe_key, outcome.clone());
        Ok(outcome)
    }

    async fn apply_adjustment(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        run_id: Option<RunId>,
        reason: String,
        idempotency_key: String,
    ) -> Result<LedgerWriteOutcome, LedgerStoreError> {
        let mut state = self.state.lock().await;

        let dedupe_key = (org_id, idempotency_key.clone());
        if let Some(existing) = state.seen_keys.get(&dedupe_key) {
            return Ok(LedgerWriteOutcome {
                deduplicated: true,
                ..existing.clone()
            });
        }

        let (direction, magnitude) = if amount_usd >= Decimal::ZERO {
            (Direction::Debit, amount_usd)
        } else {
            (Direction::Credit, -amount_usd)
        };

        let balance = state.balance_mut(org_id);
        match direction {
            Direction::Debit => balance.balance_usd -= magnitude,
            Direction::Credit => balance.balance_usd += magnitude,
        }
        balance.updated_at = Utc::now();
        let new_balance = balance.balance_usd;

        let entry_id = Uuid::new_v4();
        state.entries.push(LedgerEntry {
            id: entry_id,
            org_id,
            amount_usd: magnitude,
            direction,
            transaction_type: TransactionType::Adjustment,
            run_id,
            step_id: None,
            idempotency_key: idempotency_key.clone(),
            reason: Some(reason),
            created_at: Utc::now(),
        });

        let outcome = LedgerWriteOutcome {
            entry_id,
            new_balance_usd: new_balance,
            deduplicated: false,
        };
        state.seen_keys.insert(dedupe_key, outcome.clone());
        Ok(outcome)
    }

    async fn get_balance(&self, org_id: OrgId) -> Result<Option<CreditBalance>, LedgerStoreError> {
        Ok(self.state.lock().await.balances.get(&org_id).cloned())
    }

    async fn get_or_create_balance(
        &self,
        org_id: OrgId,
    ) -> Result<CreditBalance, LedgerStoreError> {
        Ok(self.state.lock().await.balance_mut(org_id).clone())
    }

    async fn reserve_credits(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        _run_id: RunId,
    ) -> Result<bool, LedgerStoreError> {
        let mut state = self.state.lock().await;
        let balance = state.balance_mut(org_id);
        if balance.available_usd() < amount_usd {
            return Ok(false);
        }
        balance.reserved_usd += amount_usd;
        balance.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_reserved(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        _run_id: RunId,
    ) -> Result<(), LedgerStoreError> {
        let mut state = self.state.lock().await;
        let balance = state.balance_mut(org_id);
        balance.reserved_usd = (balance.reserved_usd - amount_usd).max(Decimal::ZERO);
        balance.updated_at = Utc::now();
        Ok(())
    }

    async fn history(
        &self,
        org_id: OrgId,
        query: HistoryQuery,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|e| e.org_id == org_id)
            .filter(|e| {
                query
                    .transaction_type
                    .map_or(true, |t| e.transaction_type == t)
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let entries: Vec<LedgerEntry> = entries
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(entries)
    }

    async fn token_records_for_run(
        &self,
        run_id: RunId,
        include_estimated: bool,
    ) -> Result<Vec<TokenRecord>, LedgerStoreError> {
        let state = self.state.lock().await;
        Ok(state
            .token_records
            .iter()
            .filter(|r| r.run_id == Some(run_id))
            .filter(|r| include_estimated || !r.is_estimated)
            .cloned()
            .collect())
    }

    async fn mark_token_record_actual(
        &self,
        org_id: OrgId,
        idempotency_key: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: Decimal,
    ) -> Result<Option<TokenRecord>, LedgerStoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .token_records
            .iter_mut()
            .find(|r| r.org_id == org_id && r.idempotency_key == idempotency_key);
        match record {
            Some(record) => {
                let previous = record.clone();
                record.input_tokens = input_tokens;
                record.output_tokens = output_tokens;
                record.cost_usd = cost_usd;
                record.is_estimated = false;
                Ok(Some(previous))
            }
            None => Ok(None),
        }
    }

    async fn insert_reconciliation(
        &self,
        reconciliation: TokenReconciliation,
    ) -> Result<(), LedgerStoreError> {
        self.state.lock().await.reconciliations.push(reconciliation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn usage_args(org_id: OrgId, key: &str, cost: Decimal) -> TokenCallArgs {
        TokenCallArgs {
            org_id,
            run_id: None,
            step_id: None,
            idempotency_key: key.to_string(),
            input_tokens: 100,
            output_tokens: 50,
            model: "gpt-4o".to_string(),
            provider: crate::types::Provider::Openai,
            cost_usd: cost,
            is_estimated: false,
        }
    }

    #[tokio::test]
    async fn charge_decrements_balance_atomically() {
        let ledger = MemoryLedger::new();
        let org = OrgId::generate();
        ledger
            .add_credits(org, dec!(10.00), TransactionType::Purchase, "seed".into(), "c1".into())
            .await
            .unwrap();

        let outcome = ledger
            .record_token_call(usage_args(org, "k1", dec!(0.02)))
            .await
            .unwrap();
        assert!(!outcome.deduplicated);
        assert_eq!(outcome.new_balance_usd, dec!(9.98));

        let balance = ledger.get_balance(org).await.unwrap().unwrap();
        assert_eq!(balance.balance_usd, dec!(9.98));
    }

    #[tokio::test]
    async fn retries_with_same_key_write_once() {
        let ledger = MemoryLedger::new();
        let org = OrgId::generate();
        ledger
            .add_credits(org, dec!(5.00), TransactionType::Purchase, "seed".into(), "c1".into())
            .await
            .unwrap();

        for attempt in 0..5 {
            let outcome = ledger
                .record_token_call(usage_args(org, "step-key", dec!(1.00)))
                .await
                .unwrap();
            assert_eq!(outcome.deduplicated, attempt > 0);
        }

        let balance = ledger.get_balance(org).await.unwrap().unwrap();
        assert_eq!(balance.balance_usd, dec!(4.00));

        let debits: Vec<_> = ledger
            .entries()
            .await
            .into_iter()
            .filter(|e| e.direction == Direction::Debit)
            .collect();
        assert_eq!(debits.len(), 1);
    }

    #[tokio::test]
    async fn charge_fails_below_zero() {
        let ledger = MemoryLedger::new();
        let org = OrgId::generate();
        let err = ledger
            .record_token_call(usage_args(org, "k", dec!(0.50)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerStoreError::InsufficientFunds { .. }));
        assert!(ledger.entries().await.is_empty());
    }

    #[tokio::test]
    async fn zero_cost_call_succeeds_on_zero_balance() {
        let ledger = MemoryLedger::new();
        let org = OrgId::generate();
        let outcome = ledger
            .record_token_call(usage_args(org, "k", Decimal::ZERO))
            .await
            .unwrap();
        assert_eq!(outcome.new_balance_usd, Decimal::ZERO);
    }

    #[tokio::test]
    async fn reservations_are_advisory_holds() {
        let ledger = MemoryLedger::new();
        let org = OrgId::generate();
        let run = RunId::generate();
        ledger
            .add_credits(org, dec!(10.00), TransactionType::Purchase, "seed".into(), "c1".into())
            .await
            .unwrap();

        assert!(ledger.reserve_credits(org, dec!(8.00), run).await.unwrap());
        // Not enough available for a second large hold.
        assert!(!ledger.reserve_credits(org, dec!(5.00), run).await.unwrap());

        let balance = ledger.get_balance(org).await.unwrap().unwrap();
        assert_eq!(balance.available_usd(), dec!(2.00));

        ledger.release_reserved(org, dec!(8.00), run).await.unwrap();
        let balance = ledger.get_balance(org).await.unwrap().unwrap();
        assert_eq!(balance.reserved_usd, Decimal::ZERO);
    }

    #[tokio::test]
    async fn release_clamps_at_zero() {
        let ledger = MemoryLedger::new();
        let org = OrgId::generate();
        let run = RunId::generate();
        ledger.release_reserved(org, dec!(3.00), run).await.unwrap();
        let balance = ledger.get_balance(org).await.unwrap().unwrap();
        assert_eq!(balance.reserved_usd, Decimal::ZERO);
    }

    #[tokio::test]
    async fn adjustment_sign_picks_direction() {
        let ledger = MemoryLedger::new();
        let org = OrgId::generate();
        ledger
            .add_credits(org, dec!(10.00), TransactionType::Purchase, "seed".into(), "c1".into())
            .await
            .unwrap();

        ledger
            .apply_adjustment(org, dec!(1.00), None, "reconcile".into(), "a1".into())
            .await
            .unwrap();
        ledger
            .apply_adjustment(org, dec!(-0.25), None, "reconcile".into(), "a2".into())
            .await
            .unwrap();

        let balance = ledger.get_balance(org).await.unwrap().unwrap();
        assert_eq!(balance.balance_usd, dec!(9.25));

        let entries = ledger.entries().await;
        assert_eq!(entries[1].direction, Direction::Debit);
        assert_eq!(entries[2].direction, Direction::Credit);
        assert_eq!(entries[2].amount_usd, dec!(0.25));
    }

    proptest::proptest! {
        /// Balance always equals credits minus debits, and never goes
        /// negative, across arbitrary interleavings of credits and charges.
        #[test]
        fn balance_equals_credits_minus_debits(ops in proptest::collection::vec((0u8..2, 1u32..500), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async move {
                let ledger = MemoryLedger::new();
                let org = OrgId::generate();

                for (i, (kind, cents)) in ops.iter().enumerate() {
                    let amount = Decimal::new(*cents as i64, 2);
                    match kind {
                        0 => {
                            ledger
                                .add_credits(
                                    org,
                                    amount,
                                    TransactionType::Purchase,
                                    "prop".into(),
                                    format!("credit-{i}"),
                                )
                                .await
                                .unwrap();
                        }
                        _ => {
                            // Charges may fail on insufficient funds; that's fine.
                            let _ = ledger
                                .record_token_call(usage_args(org, &format!("debit-{i}"), amount))
                                .await;
                        }
                    }
                }

                let entries = ledger.entries().await;
                let credits: Decimal = entries
                    .iter()
                    .filter(|e| e.direction == Direction::Credit)
                    .map(|e| e.amount_usd)
                    .sum();
                let debits: Decimal = entries
                    .iter()
                    .filter(|e| e.direction == Direction::Debit)
                    .map(|e| e.amount_usd)
                    .sum();

                let balance = ledger.get_or_create_balance(org).await.unwrap();
                assert_eq!(balance.balance_usd, credits - debits);
                assert!(balance.balance_usd >= Decimal::ZERO);
            });
        }
    }
}
