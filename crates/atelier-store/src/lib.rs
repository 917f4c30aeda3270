//! The durable store contract.
//!
//! Runs, jobs, checkpoints and run messages live behind these traits. The
//! store is where the two correctness disciplines are enforced:
//!
//! * **Optimistic concurrency with fencing**: every run write carries the
//!   expected `state_version` and the writer's lease token; the store rejects
//!   writes whose token is not the newest issued for that run, so a zombie
//!   worker whose lease lapsed cannot corrupt state.
//! * **Idempotent side-effects**: checkpoint writes are insert-once per
//!   `(run, key)`, which makes crash-recovery replay safe and cheap.

#![deny(unsafe_code)]

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use atelier_types::{CoreError, JobId, Plan, RunError, RunId, RunRecord, RunState, WorkerId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for CoreError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(msg) => CoreError::Validation(msg),
            StoreError::Conflict(msg) => CoreError::StoreConflict(msg),
            StoreError::InvalidTransition { from, to } => CoreError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            },
            StoreError::Backend(msg) => CoreError::StoreFailure(msg),
        }
    }
}

/// A worker's authority to mutate one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub run_id: RunId,
    pub worker_id: WorkerId,
    /// Strictly increasing per run across all leases ever issued.
    pub token: u64,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Partial update applied under the fencing guard. `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub state: Option<RunState>,
    pub plan: Option<Plan>,
    pub completed_phase: Option<usize>,
    pub add_cost_usd: Option<Decimal>,
    pub last_error: Option<RunError>,
    pub result: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
}

impl RunUpdate {
    pub fn transition(state: RunState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: RunRecord) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError>;

    /// The fenced write. Succeeds iff the run's stored `state_version`
    /// equals `expected_version` and `fencing_token` equals the newest lease
    /// token for the run; bumps `state_version` and returns the new record.
    /// State changes are additionally validated against the transition table.
    async fn update_run(
        &self,
        run_id: RunId,
        expected_version: u64,
        fencing_token: u64,
        update: RunUpdate,
    ) -> Result<RunRecord, StoreError>;

    /// Cancel from the control plane: transitions to CANCELLED at the
    /// current state if that edge is legal, bumping `state_version` so any
    /// in-flight worker write conflicts.
    async fn request_cancel(&self, run_id: RunId) -> Result<RunRecord, StoreError>;

    /// Issue a lease whose token is strictly greater than any token
    /// previously issued for this run.
    async fn acquire_lease(
        &self,
        run_id: RunId,
        worker_id: WorkerId,
        ttl: Duration,
    ) -> Result<Lease, StoreError>;

    /// Extend a lease the caller still holds. Fails with `Conflict` when the
    /// token has been superseded.
    async fn renew_lease(
        &self,
        run_id: RunId,
        token: u64,
        ttl: Duration,
    ) -> Result<Lease, StoreError>;

    async fn release_lease(&self, run_id: RunId, token: u64) -> Result<(), StoreError>;

    async fn get_lease(&self, run_id: RunId) -> Result<Option<Lease>, StoreError>;
}

/// Queue entry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Leased,
    Completed,
    Failed,
}

/// A pending-jobs queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be dequeued; pushed out by retry backoff.
    pub available_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job for a run. At most one uncompleted job per run may
    /// exist; a second enqueue conflicts.
    async fn enqueue(&self, run_id: RunId, priority: i32) -> Result<Job, StoreError>;

    /// Pop the oldest available job (FIFO within priority), marking it
    /// leased by `worker_id`.
    async fn dequeue(&self, worker_id: &WorkerId) -> Result<Option<Job>, StoreError>;

    async fn complete_job(&self, job_id: JobId) -> Result<(), StoreError>;

    async fn fail_job(&self, job_id: JobId) -> Result<(), StoreError>;

    /// Put a leased job back with an incremented retry count, not available
    /// before `delay` elapses.
    async fn requeue_job(&self, job_id: JobId, delay: Duration) -> Result<Job, StoreError>;

    /// Jobs currently pending (for metrics and backpressure signals).
    async fn pending_jobs(&self) -> Result<usize, StoreError>;
}

/// Result of an idempotent checkpoint write.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotentWrite {
    /// First write for this key; the value was stored.
    Inserted,
    /// The key was already present; the original value is returned and
    /// nothing was written.
    Existing(serde_json::Value),
}

impl IdempotentWrite {
    pub fn was_inserted(&self) -> bool {
        matches!(self, IdempotentWrite::Inserted)
    }
}

#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert-once per `(run, key)`. The dedupe here is what makes replayed
    /// side-effects safe.
    async fn insert_idempotent(
        &self,
        run_id: RunId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<IdempotentWrite, StoreError>;

    async fn get_checkpoint(
        &self,
        run_id: RunId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    async fn checkpoint_keys(&self, run_id: RunId) -> Result<Vec<String>, StoreError>;
}

/// Conversation roles on the run message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMessage {
    pub run_id: RunId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_message(
        &self,
        run_id: RunId,
        role: MessageRole,
        content: String,
    ) -> Result<(), StoreError>;

    async fn messages(&self, run_id: RunId) -> Result<Vec<RunMessage>, StoreError>;
}

/// The full store surface the orchestrator needs.
pub trait Store: RunStore + JobQueue + CheckpointStore + MessageStore {}

impl<T: RunStore + JobQueue + CheckpointStore + MessageStore> Store for T {}
