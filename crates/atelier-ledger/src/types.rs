//! Ledger domain types.

use atelier_types::{OrgId, RunId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// LLM providers the billing layer prices against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Openai,
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Openai => "openai",
            Provider::Anthropic => "anthropic",
        }
    }
}

/// Whether an entry moves money out of or into the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Debit,
    Credit,
}

/// The closed set of transaction types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    TokenUsage,
    Purchase,
    Refund,
    Promo,
    Trial,
    Adjustment,
}

impl TransactionType {
    /// Types that may add credit to a balance.
    pub fn can_credit(&self) -> bool {
        matches!(
            self,
            TransactionType::Purchase
                | TransactionType::Refund
                | TransactionType::Promo
                | TransactionType::Trial
                | TransactionType::Adjustment
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::TokenUsage => "token_usage",
            TransactionType::Purchase => "purchase",
            TransactionType::Refund => "refund",
            TransactionType::Promo => "promo",
            TransactionType::Trial => "trial",
            TransactionType::Adjustment => "adjustment",
        }
    }
}

/// An immutable ledger row. Amounts are always positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub org_id: OrgId,
    pub amount_usd: Decimal,
    pub direction: Direction,
    pub transaction_type: TransactionType,
    pub run_id: Option<RunId>,
    /// The phase-step this charge belongs to, when run-scoped.
    pub step_id: Option<String>,
    pub idempotency_key: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Side-table row for a `token_usage` ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: Uuid,
    pub org_id: OrgId,
    pub run_id: Option<RunId>,
    pub step_id: Option<String>,
    pub idempotency_key: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub provider: Provider,
    pub cost_usd: Decimal,
    /// True while the counts came from estimation rather than the provider.
    pub is_estimated: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-org credit balance. Only the atomic store procedures write this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub org_id: OrgId,
    pub balance_usd: Decimal,
    /// Advisory holds for in-flight runs.
    pub reserved_usd: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl CreditBalance {
    pub fn available_usd(&self) -> Decimal {
        self.balance_usd - self.reserved_usd
    }
}

/// Arguments for the atomic token-call write.
#[derive(Debug, Clone)]
pub struct TokenCallArgs {
    pub org_id: OrgId,
    pub run_id: Option<RunId>,
    pub step_id: Option<String>,
    pub idempotency_key: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub provider: Provider,
    pub cost_usd: Decimal,
    pub is_estimated: bool,
}

/// Result of an atomic ledger write.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerWriteOutcome {
    pub entry_id: Uuid,
    pub new_balance_usd: Decimal,
    /// True when the idempotency key had already been recorded and the write
    /// was a no-op.
    pub deduplicated: bool,
}

/// Actual usage for one step, used at reconciliation time.
#[derive(Debug, Clone)]
pub struct ActualUsage {
    pub idempotency_key: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Decimal,
}

/// The outcome of reconciling a run's estimated records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenReconciliation {
    pub id: Uuid,
    pub run_id: RunId,
    pub org_id: OrgId,
    pub records_replaced: usize,
    pub estimated_cost_usd: Decimal,
    pub actual_cost_usd: Decimal,
    /// Positive means an extra debit was posted, negative a credit.
    pub adjustment_usd: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Aggregated usage over a period.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: Decimal,
    pub call_count: usize,
    pub by_model: HashMap<String, ModelUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Decimal,
    pub call_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn available_subtracts_reserved() {
        let balance = CreditBalance {
            org_id: OrgId::generate(),
            balance_usd: dec!(10.00),
            reserved_usd: dec!(2.50),
            updated_at: Utc::now(),
        };
        assert_eq!(balance.available_usd(), dec!(7.50));
    }

    #[test]
    fn token_usage_cannot_credit() {
        assert!(!TransactionType::TokenUsage.can_credit());
        assert!(TransactionType::Purchase.can_credit());
        assert!(TransactionType::Adjustment.can_credit());
    }

    #[test]
    fn transaction_type_wire_names() {
        let json = serde_json::to_string(&TransactionType::TokenUsage).unwrap();
        assert_eq!(json, "\"token_usage\"");
        let bad: Result<TransactionType, _> = serde_json::from_str("\"chargeback\"");
        assert!(bad.is_err());
    }
}
