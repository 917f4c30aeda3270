//! The token-billing ledger.
//!
//! The ledger is the single source of truth for money. It is append-only:
//! entries are never updated or deleted, amounts are always positive, and the
//! direction field carries the sign. Every externally-triggered insertion
//! carries an idempotency key that is unique within an organization, which is
//! what makes retries safe. Balance updates happen in the same atomic store
//! procedure as the ledger insert, so balance and ledger can never diverge.

#![deny(unsafe_code)]

pub mod memory;
pub mod service;
pub mod store;
pub mod types;

pub use memory::MemoryLedger;
pub use service::LedgerService;
pub use store::{LedgerStore, LedgerStoreError};
pub use types::{
    ActualUsage, CreditBalance, Direction, LedgerEntry, LedgerWriteOutcome, Provider,
    TokenCallArgs, TokenReconciliation, TokenRecord, TransactionType, UsageSummary,
};
