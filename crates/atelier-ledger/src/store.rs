//! The atomic ledger store contract.
//!
//! Backends must make each mutating operation atomic: the ledger insert, the
//! token-record insert (when present), and the balance update commit together
//! or not at all, with per-org serialization on balance updates.

use crate::types::{
    CreditBalance, LedgerEntry, LedgerWriteOutcome, TokenCallArgs, TokenReconciliation,
    TokenRecord, TransactionType,
};
use atelier_types::{OrgId, RunId};
use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LedgerStoreError {
    #[error("Insufficient funds: required ${required}, balance ${balance}")]
    InsufficientFunds { required: Decimal, balance: Decimal },

    #[error("Balance not found for org {0}")]
    BalanceNotFound(OrgId),

    #[error("Ledger backend error: {0}")]
    Backend(String),
}

/// Filters for transaction history queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub transaction_type: Option<TransactionType>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// The main billing write: insert a token record plus a ledger debit and
    /// decrement the balance, atomically. A repeated idempotency key returns
    /// the original outcome with `deduplicated = true` and writes nothing.
    async fn record_token_call(
        &self,
        args: TokenCallArgs,
    ) -> Result<LedgerWriteOutcome, LedgerStoreError>;

    /// Insert a credit entry and increment the balance, atomically and
    /// idempotently.
    async fn add_credits(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        transaction_type: TransactionType,
        reason: String,
        idempotency_key: String,
    ) -> Result<LedgerWriteOutcome, LedgerStoreError>;

    /// Post a reconciliation adjustment: a debit when `amount_usd` is
    /// positive, a credit when negative. Idempotent on the key.
    async fn apply_adjustment(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        run_id: Option<RunId>,
        reason: String,
        idempotency_key: String,
    ) -> Result<LedgerWriteOutcome, LedgerStoreError>;

    async fn get_balance(&self, org_id: OrgId) -> Result<Option<CreditBalance>, LedgerStoreError>;

    /// Fetch the balance, creating a zero row when absent.
    async fn get_or_create_balance(
        &self,
        org_id: OrgId,
    ) -> Result<CreditBalance, LedgerStoreError>;

    /// Advisory hold: increase `reserved_usd` when enough is available.
    /// Returns false (without mutating) otherwise.
    async fn reserve_credits(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        run_id: RunId,
    ) -> Result<bool, LedgerStoreError>;

    /// Release an advisory hold, clamped at zero.
    async fn release_reserved(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        run_id: RunId,
    ) -> Result<(), LedgerStoreError>;

    async fn history(
        &self,
        org_id: OrgId,
        query: HistoryQuery,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError>;

    async fn token_records_for_run(
        &self,
        run_id: RunId,
        include_estimated: bool,
    ) -> Result<Vec<TokenRecord>, LedgerStoreError>;

    /// Flip an estimated token record to actual, updating its counts.
    /// Returns the previous record when one matched.
    async fn mark_token_record_actual(
        &self,
        org_id: OrgId,
        idempotency_key: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: Decimal,
    ) -> Result<Option<TokenRecord>, LedgerStoreError>;

    async fn insert_reconciliation(
        &self,
        reconciliation: TokenReconciliation,
    ) -> Result<(), LedgerStoreError>;
}
