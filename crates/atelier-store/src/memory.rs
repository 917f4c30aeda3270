//! In-memory store backend for tests and single-process deployments.

use crate::{
    CheckpointStore, IdempotentWrite, Job, JobQueue, JobStatus, Lease, MessageRole, MessageStore,
    RunMessage, RunStore, RunUpdate, StoreError,
};
use atelier_types::{JobId, RunId, RunRecord, RunState, WorkerId};
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;

fn chrono_ttl(ttl: Duration) -> ChronoDuration {
    ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(30))
}

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, RunRecord>,
    leases: HashMap<RunId, Lease>,
    /// Highest token ever issued per run; survives lease release.
    token_high_water: HashMap<RunId, u64>,
    jobs: Vec<Job>,
    checkpoints: HashMap<(RunId, String), serde_json::Value>,
    messages: Vec<RunMessage>,
}

/// An in-memory [`crate::Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, run: RunRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        inner.runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.inner.read().await.runs.get(&run_id).cloned())
    }

    async fn update_run(
        &self,
        run_id: RunId,
        expected_version: u64,
        fencing_token: u64,
        update: RunUpdate,
    ) -> Result<RunRecord, StoreError> {
        let mut inner = self.inner.write().await;

        let newest_token = *inner
            .token_high_water
            .get(&run_id)
            .ok_or_else(|| StoreError::Conflict(format!("no lease ever issued for run {run_id}")))?;
        if fencing_token != newest_token {
            return Err(StoreError::Conflict(format!(
                "fencing token {fencing_token} superseded by {newest_token}"
            )));
        }

        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;

        if run.state_version != expected_version {
            return Err(StoreError::Conflict(format!(
                "state_version {} != expected {expected_version}",
                run.state_version
            )));
        }

        if let Some(next) = update.state {
            if !run.state.can_transition(next) {
                return Err(StoreError::InvalidTransition {
                    from: run.state,
                    to: next,
                });
            }
            run.state = next;
        }
        if let Some(plan) = update.plan {
            run.plan = Some(plan);
        }
        if let Some(phase) = update.completed_phase {
            run.completed_phase = Some(phase);
        }
        if let Some(add) = update.add_cost_usd {
            let current = Decimal::from_str(&run.cost_usd).unwrap_or(Decimal::ZERO);
            run.cost_usd = (current + add).to_string();
        }
        if let Some(error) = update.last_error {
            run.last_error = Some(error);
        }
        if let Some(result) = update.result {
            run.result = Some(result);
        }
        if let Some(deadline) = update.deadline {
            run.deadline = Some(deadline);
        }

        run.state_version += 1;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn request_cancel(&self, run_id: RunId) -> Result<RunRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;

        if !run.state.can_transition(RunState::Cancelled) {
            return Err(StoreError::InvalidTransition {
                from: run.state,
                to: RunState::Cancelled,
            });
        }
        run.state = RunState::Cancelled;
        run.state_version += 1;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn acquire_lease(
        &self,
        run_id: RunId,
        worker_id: WorkerId,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.leases.get(&run_id) {
            if !existing.is_expired() && existing.worker_id != worker_id {
                return Err(StoreError::Conflict(format!(
                    "run {run_id} is leased by {}",
                    existing.worker_id
                )));
            }
        }

        let token = inner
            .token_high_water
            .get(&run_id)
            .copied()
            .unwrap_or(0)
            + 1;
        let lease = Lease {
            run_id,
            worker_id,
            token,
            expires_at: Utc::now() + chrono_ttl(ttl),
        };
        inner.token_high_water.insert(run_id, token);
        inner.leases.insert(run_id, lease.clone());
        Ok(lease)
    }

    async fn renew_lease(
        &self,
        run_id: RunId,
        token: u64,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let mut inner = self.inner.write().await;
        let lease = inner
            .leases
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("lease for run {run_id}")))?;
        if lease.token != token {
            return Err(StoreError::Conflict(format!(
                "lease token {token} superseded by {}",
                lease.token
            )));
        }
        lease.expires_at = Utc::now() + chrono_ttl(ttl);
        Ok(lease.clone())
    }

    async fn release_lease(&self, run_id: RunId, token: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(lease) = inner.leases.get(&run_id) {
            if lease.token == token {
                inner.leases.remove(&run_id);
            }
        }
        Ok(())
    }

    async fn get_lease(&self, run_id: RunId) -> Result<Option<Lease>, StoreError> {
        Ok(self.inner.read().await.leases.get(&run_id).cloned())
    }
}

#[async_trait::async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(&self, run_id: RunId, priority: i32) -> Result<Job, StoreError> {
        let mut inner = self.inner.write().await;
        let open = inner.jobs.iter().any(|j| {
            j.run_id == run_id && matches!(j.status, JobStatus::Pending | JobStatus::Leased)
        });
        if open {
            return Err(StoreError::Conflict(format!(
                "run {run_id} already has an uncompleted job"
            )));
        }
        let now = Utc::now();
        let job = Job {
            id: JobId::generate(),
            run_id,
            status: JobStatus::Pending,
            priority,
            retry_count: 0,
            enqueued_at: now,
            available_at: now,
        };
        inner.jobs.push(job.clone());
        Ok(job)
    }

    async fn dequeue(&self, _worker_id: &WorkerId) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let candidate = inner
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending && j.available_at <= now)
            .min_by_key(|j| (std::cmp::Reverse(j.priority), j.enqueued_at));
        match candidate {
            Some(job) => {
                job.status = JobStatus::Leased;
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn complete_job(&self, job_id: JobId) -> Result<(), StoreError> {
        self.set_job_status(job_id, JobStatus::Completed).await
    }

    async fn fail_job(&self, job_id: JobId) -> Result<(), StoreError> {
        self.set_job_status(job_id, JobStatus::Failed).await
    }

    async fn requeue_job(&self, job_id: JobId, delay: Duration) -> Result<Job, StoreError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        job.status = JobStatus::Pending;
        job.retry_count += 1;
        job.available_at = Utc::now() + chrono_ttl(delay);
        Ok(job.clone())
    }

    async fn pending_jobs(&self) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .count())
    }
}

impl MemoryStore {
    async fn set_job_status(&self, job_id: JobId, status: JobStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        job.status = status;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryStore {
    async fn insert_idempotent(
        &self,
        run_id: RunId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<IdempotentWrite, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.checkpoints.get(&(run_id, key.to_string())) {
            Some(existing) => Ok(IdempotentWrite::Existing(existing.clone())),
            None => {
                inner.checkpoints.insert((run_id, key.to_string()), value);
                Ok(IdempotentWrite::Inserted)
            }
        }
    }

    async fn get_checkpoint(
        &self,
        run_id: RunId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .get(&(run_id, key.to_string()))
            .cloned())
    }

    async fn checkpoint_keys(&self, run_id: RunId) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .keys()
            .filter(|(r, _)| *r == run_id)
            .map(|(_, k)| k.clone())
            .collect())
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
    async fn append_message(
        &self,
        run_id: RunId,
        role: MessageRole,
        content: String,
    ) -> Result<(), StoreError> {
        self.inner.write().await.messages.push(RunMessage {
            run_id,
            role,
            content,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn messages(&self, run_id: RunId) -> Result<Vec<RunMessage>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_types::{OrgId, RunRecord, RunState};
    use rust_decimal_macros::dec;

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name)
    }

    async fn seeded_run(store: &MemoryStore) -> RunRecord {
        let run = RunRecord::new(OrgId::generate(), "do something");
        store.insert_run(run.clone()).await.unwrap();
        run
    }

    #[tokio::test]
    async fn fenced_update_transitions_and_bumps_version() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        let lease = store
            .acquire_lease(run.id, worker("w1"), Duration::from_secs(30))
            .await
            .unwrap();

        let updated = store
            .update_run(run.id, 0, lease.token, RunUpdate::transition(RunState::Validating))
            .await
            .unwrap();
        assert_eq!(updated.state, RunState::Validating);
        assert_eq!(updated.state_version, 1);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_state_unchanged() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        let lease = store
            .acquire_lease(run.id, worker("w1"), Duration::from_secs(30))
            .await
            .unwrap();

        let err = store
            .update_run(run.id, 0, lease.token, RunUpdate::transition(RunState::Executing))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let current = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(current.state, RunState::Created);
        assert_eq!(current.state_version, 0);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        let lease = store
            .acquire_lease(run.id, worker("w1"), Duration::from_secs(30))
            .await
            .unwrap();

        store
            .update_run(run.id, 0, lease.token, RunUpdate::transition(RunState::Validating))
            .await
            .unwrap();
        let err = store
            .update_run(run.id, 0, lease.token, RunUpdate::transition(RunState::Decomposing))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn superseded_token_cannot_write() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        let old = store
            .acquire_lease(run.id, worker("w1"), Duration::from_millis(0))
            .await
            .unwrap();
        // The first lease is expired, so another worker takes over.
        let new = store
            .acquire_lease(run.id, worker("w2"), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(new.token > old.token);

        let err = store
            .update_run(run.id, 0, old.token, RunUpdate::transition(RunState::Validating))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // The new holder writes fine.
        store
            .update_run(run.id, 0, new.token, RunUpdate::transition(RunState::Validating))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn live_lease_blocks_other_workers() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        store
            .acquire_lease(run.id, worker("w1"), Duration::from_secs(30))
            .await
            .unwrap();
        let err = store
            .acquire_lease(run.id, worker("w2"), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn renew_rejects_superseded_token() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        let old = store
            .acquire_lease(run.id, worker("w1"), Duration::from_millis(0))
            .await
            .unwrap();
        store
            .acquire_lease(run.id, worker("w2"), Duration::from_secs(30))
            .await
            .unwrap();

        let err = store
            .renew_lease(run.id, old.token, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_bumps_version_so_workers_conflict() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        let lease = store
            .acquire_lease(run.id, worker("w1"), Duration::from_secs(30))
            .await
            .unwrap();

        store.request_cancel(run.id).await.unwrap();

        let err = store
            .update_run(run.id, 0, lease.token, RunUpdate::transition(RunState::Validating))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_terminal_run_is_rejected() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        store.request_cancel(run.id).await.unwrap();
        let err = store.request_cancel(run.id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn cost_accumulates() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        let lease = store
            .acquire_lease(run.id, worker("w1"), Duration::from_secs(30))
            .await
            .unwrap();

        let update = RunUpdate {
            add_cost_usd: Some(dec!(0.02)),
            ..Default::default()
        };
        store.update_run(run.id, 0, lease.token, update).await.unwrap();
        let update = RunUpdate {
            add_cost_usd: Some(dec!(0.03)),
            ..Default::default()
        };
        let run = store.update_run(run.id, 1, lease.token, update).await.unwrap();
        assert_eq!(run.cost_usd, "0.05");
    }

    #[tokio::test]
    async fn queue_is_fifo_and_one_job_per_run() {
        let store = MemoryStore::new();
        let run_a = seeded_run(&store).await;
        let run_b = seeded_run(&store).await;

        store.enqueue(run_a.id, 0).await.unwrap();
        store.enqueue(run_b.id, 0).await.unwrap();
        assert!(store.enqueue(run_a.id, 0).await.is_err());

        let first = store.dequeue(&worker("w")).await.unwrap().unwrap();
        assert_eq!(first.run_id, run_a.id);
        let second = store.dequeue(&worker("w")).await.unwrap().unwrap();
        assert_eq!(second.run_id, run_b.id);
        assert!(store.dequeue(&worker("w")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeued_job_waits_for_backoff() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        store.enqueue(run.id, 0).await.unwrap();
        let job = store.dequeue(&worker("w")).await.unwrap().unwrap();

        let requeued = store
            .requeue_job(job.id, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(requeued.retry_count, 1);
        assert!(store.dequeue(&worker("w")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_job_frees_the_run_for_reenqueue() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        let job = store.enqueue(run.id, 0).await.unwrap();
        store.dequeue(&worker("w")).await.unwrap();
        store.complete_job(job.id).await.unwrap();
        store.enqueue(run.id, 0).await.unwrap();
    }

    #[tokio::test]
    async fn checkpoints_deduplicate_by_key() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;

        let first = store
            .insert_idempotent(run.id, "phase-0:start", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        assert!(first.was_inserted());

        let second = store
            .insert_idempotent(run.id, "phase-0:start", serde_json::json!({"n": 2}))
            .await
            .unwrap();
        match second {
            IdempotentWrite::Existing(value) => assert_eq!(value["n"], 1),
            IdempotentWrite::Inserted => panic!("expected dedupe"),
        }
    }

    #[tokio::test]
    async fn messages_append_in_order() {
        let store = MemoryStore::new();
        let run = seeded_run(&store).await;
        store
            .append_message(run.id, MessageRole::User, "hi".into())
            .await
            .unwrap();
        store
            .append_message(run.id, MessageRole::Assistant, "hello".into())
            .await
            .unwrap();

        let messages = store.messages(run.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
    }
}
