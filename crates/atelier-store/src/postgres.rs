//! Postgres store backend over sqlx.
//!
//! All conditional writes happen inside transactions with the affected row
//! locked (`FOR UPDATE`), which gives the per-org serialization the ledger
//! contract requires and the compare-and-swap the fencing discipline
//! requires.

use crate::{
    CheckpointStore, IdempotentWrite, Job, JobQueue, JobStatus, Lease, MessageRole, MessageStore,
    RunMessage, RunStore, RunUpdate, StoreError,
};
use atelier_ledger::store::{HistoryQuery, LedgerStore, LedgerStoreError};
use atelier_ledger::types::{
    CreditBalance, Direction, LedgerEntry, LedgerWriteOutcome, Provider, TokenCallArgs,
    TokenReconciliation, TokenRecord, TransactionType,
};
use atelier_ot::{Document, DocumentPersistence, OperationBatch};
use atelier_types::{JobId, OrgId, RunError, RunId, RunRecord, RunState, WorkerId};
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = include_str!("schema.sql");

/// Store backed by Postgres.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await
            .map_err(backend)?;
        Ok(Self { pool })
    }

    /// Apply the schema. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn ledger_backend(err: sqlx::Error) -> LedgerStoreError {
    LedgerStoreError::Backend(err.to_string())
}

fn chrono_ttl(ttl: Duration) -> ChronoDuration {
    ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(30))
}

fn parse_run_state(value: &str) -> Result<RunState, StoreError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| StoreError::Backend(format!("unknown run state '{value}' in store")))
}

fn parse_job_status(value: &str) -> Result<JobStatus, StoreError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| StoreError::Backend(format!("unknown job status '{value}' in store")))
}

fn parse_message_role(value: &str) -> Result<MessageRole, StoreError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| StoreError::Backend(format!("unknown message role '{value}' in store")))
}

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Leased => "leased",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let plan: Option<serde_json::Value> = row.try_get("plan").map_err(backend)?;
    let plan = plan
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Backend(format!("malformed plan json: {e}")))?;
    let last_error: Option<serde_json::Value> = row.try_get("last_error").map_err(backend)?;
    let last_error: Option<RunError> = last_error
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Backend(format!("malformed error json: {e}")))?;
    let state: String = row.try_get("state").map_err(backend)?;
    let cost: Decimal = row.try_get("cost_usd").map_err(backend)?;
    let completed_phase: Option<i64> = row.try_get("completed_phase").map_err(backend)?;

    Ok(RunRecord {
        id: RunId(row.try_get::<Uuid, _>("id").map_err(backend)?),
        org_id: OrgId(row.try_get::<Uuid, _>("org_id").map_err(backend)?),
        prompt: row.try_get("prompt").map_err(backend)?,
        state: parse_run_state(&state)?,
        state_version: row.try_get::<i64, _>("state_version").map_err(backend)? as u64,
        plan,
        completed_phase: completed_phase.map(|p| p as usize),
        cost_usd: cost.to_string(),
        deadline: row.try_get("deadline").map_err(backend)?,
        last_error,
        result: row.try_get("result").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    Ok(Job {
        id: JobId(row.try_get::<Uuid, _>("id").map_err(backend)?),
        run_id: RunId(row.try_get::<Uuid, _>("run_id").map_err(backend)?),
        status: parse_job_status(&status)?,
        priority: row.try_get("priority").map_err(backend)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(backend)? as u32,
        enqueued_at: row.try_get("enqueued_at").map_err(backend)?,
        available_at: row.try_get("available_at").map_err(backend)?,
    })
}

fn lease_from_row(row: &PgRow) -> Result<Lease, StoreError> {
    Ok(Lease {
        run_id: RunId(row.try_get::<Uuid, _>("run_id").map_err(backend)?),
        worker_id: WorkerId(row.try_get("worker_id").map_err(backend)?),
        token: row.try_get::<i64, _>("token").map_err(backend)? as u64,
        expires_at: row.try_get("expires_at").map_err(backend)?,
    })
}

#[async_trait::async_trait]
impl RunStore for PostgresStore {
    async fn insert_run(&self, run: RunRecord) -> Result<(), StoreError> {
        let plan = run
            .plan
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let last_error = run
            .last_error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let cost = Decimal::from_str(&run.cost_usd).unwrap_or(Decimal::ZERO);

        sqlx::query(
            "INSERT INTO runs (id, org_id, prompt, state, state_version, plan, completed_phase, \
             cost_usd, deadline, last_error, result, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(run.id.0)
        .bind(run.org_id.0)
        .bind(&run.prompt)
        .bind(run.state.as_str())
        .bind(run.state_version as i64)
        .bind(plan)
        .bind(run.completed_phase.map(|p| p as i64))
        .bind(cost)
        .bind(run.deadline)
        .bind(last_error)
        .bind(&run.result)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(run_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn update_run(
        &self,
        run_id: RunId,
        expected_version: u64,
        fencing_token: u64,
        update: RunUpdate,
    ) -> Result<RunRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query("SELECT * FROM runs WHERE id = $1 FOR UPDATE")
            .bind(run_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        let current = run_from_row(&row)?;
        let newest_token = row.try_get::<i64, _>("last_lease_token").map_err(backend)? as u64;

        if newest_token == 0 {
            return Err(StoreError::Conflict(format!(
                "no lease ever issued for run {run_id}"
            )));
        }
        if fencing_token != newest_token {
            return Err(StoreError::Conflict(format!(
                "fencing token {fencing_token} superseded by {newest_token}"
            )));
        }
        if current.state_version != expected_version {
            return Err(StoreError::Conflict(format!(
                "state_version {} != expected {expected_version}",
                current.state_version
            )));
        }

        let next_state = match update.state {
            Some(next) => {
                if !current.state.can_transition(next) {
                    return Err(StoreError::InvalidTransition {
                        from: current.state,
                        to: next,
                    });
                }
                next
            }
            None => current.state,
        };

        let plan = match &update.plan {
            Some(plan) => Some(
                serde_json::to_value(plan).map_err(|e| StoreError::Backend(e.to_string()))?,
            ),
            None => None,
        };
        let last_error = match &update.last_error {
            Some(err) => Some(
                serde_json::to_value(err).map_err(|e| StoreError::Backend(e.to_string()))?,
            ),
            None => None,
        };
        let add_cost = update.add_cost_usd.unwrap_or(Decimal::ZERO);

        let row = sqlx::query(
            "UPDATE runs SET \
               state = $2, \
               state_version = state_version + 1, \
               plan = COALESCE($3, plan), \
               completed_phase = COALESCE($4, completed_phase), \
               cost_usd = cost_usd + $5, \
               last_error = COALESCE($6, last_error), \
               result = COALESCE($7, result), \
               deadline = COALESCE($8, deadline), \
               updated_at = $9 \
             WHERE id = $1 \
             RETURNING *",
        )
        .bind(run_id.0)
        .bind(next_state.as_str())
        .bind(plan)
        .bind(update.completed_phase.map(|p| p as i64))
        .bind(add_cost)
        .bind(last_error)
        .bind(&update.result)
        .bind(update.deadline)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        let updated = run_from_row(&row)?;
        tx.commit().await.map_err(backend)?;
        Ok(updated)
    }

    async fn request_cancel(&self, run_id: RunId) -> Result<RunRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query("SELECT * FROM runs WHERE id = $1 FOR UPDATE")
            .bind(run_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        let current = run_from_row(&row)?;

        if !current.state.can_transition(RunState::Cancelled) {
            return Err(StoreError::InvalidTransition {
                from: current.state,
                to: RunState::Cancelled,
            });
        }

        let row = sqlx::query(
            "UPDATE runs SET state = $2, state_version = state_version + 1, updated_at = $3 \
             WHERE id = $1 RETURNING *",
        )
        .bind(run_id.0)
        .bind(RunState::Cancelled.as_str())
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        let updated = run_from_row(&row)?;
        tx.commit().await.map_err(backend)?;
        Ok(updated)
    }

    async fn acquire_lease(
        &self,
        run_id: RunId,
        worker_id: WorkerId,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let existing = sqlx::query("SELECT * FROM run_leases WHERE run_id = $1 FOR UPDATE")
            .bind(run_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        if let Some(row) = &existing {
            let lease = lease_from_row(row)?;
            if !lease.is_expired() && lease.worker_id != worker_id {
                return Err(StoreError::Conflict(format!(
                    "run {run_id} is leased by {}",
                    lease.worker_id
                )));
            }
        }

        let token_row = sqlx::query(
            "UPDATE runs SET last_lease_token = last_lease_token + 1 \
             WHERE id = $1 RETURNING last_lease_token",
        )
        .bind(run_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        let token = token_row
            .try_get::<i64, _>("last_lease_token")
            .map_err(backend)? as u64;

        let expires_at = Utc::now() + chrono_ttl(ttl);
        sqlx::query(
            "INSERT INTO run_leases (run_id, worker_id, token, expires_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (run_id) DO UPDATE \
               SET worker_id = $2, token = $3, expires_at = $4",
        )
        .bind(run_id.0)
        .bind(worker_id.as_str())
        .bind(token as i64)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(Lease {
            run_id,
            worker_id,
            token,
            expires_at,
        })
    }

    async fn renew_lease(
        &self,
        run_id: RunId,
        token: u64,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let expires_at = Utc::now() + chrono_ttl(ttl);
        let row = sqlx::query(
            "UPDATE run_leases SET expires_at = $3 \
             WHERE run_id = $1 AND token = $2 RETURNING *",
        )
        .bind(run_id.0)
        .bind(token as i64)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => lease_from_row(&row),
            None => Err(StoreError::Conflict(format!(
                "lease token {token} for run {run_id} is gone or superseded"
            ))),
        }
    }

    async fn release_lease(&self, run_id: RunId, token: u64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM run_leases WHERE run_id = $1 AND token = $2")
            .bind(run_id.0)
            .bind(token as i64)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_lease(&self, run_id: RunId) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query("SELECT * FROM run_leases WHERE run_id = $1")
            .bind(run_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(lease_from_row).transpose()
    }
}

#[async_trait::async_trait]
impl JobQueue for PostgresStore {
    async fn enqueue(&self, run_id: RunId, priority: i32) -> Result<Job, StoreError> {
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
        let result = sqlx::query(
            "INSERT INTO jobs (id, run_id, status, priority, retry_count, enqueued_at, available_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(job.id.0)
        .bind(run_id.0)
        .bind(job_status_str(job.status))
        .bind(priority)
        .bind(0i32)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict(
                format!("run {run_id} already has an uncompleted job"),
            )),
            Err(err) => Err(backend(err)),
        }
    }

    async fn dequeue(&self, _worker_id: &WorkerId) -> Result<Option<Job>, StoreError> {
        // SKIP LOCKED lets several workers poll the queue without contention.
        let row = sqlx::query(
            "UPDATE jobs SET status = 'leased' \
             WHERE id = ( \
               SELECT id FROM jobs \
               WHERE status = 'pending' AND available_at <= $1 \
               ORDER BY priority DESC, enqueued_at \
               FOR UPDATE SKIP LOCKED \
               LIMIT 1 \
             ) RETURNING *",
        )
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete_job(&self, job_id: JobId) -> Result<(), StoreError> {
        self.set_job_status(job_id, JobStatus::Completed).await
    }

    async fn fail_job(&self, job_id: JobId) -> Result<(), StoreError> {
        self.set_job_status(job_id, JobStatus::Failed).await
    }

    async fn requeue_job(&self, job_id: JobId, delay: Duration) -> Result<Job, StoreError> {
        let row = sqlx::query(
            "UPDATE jobs SET status = 'pending', retry_count = retry_count + 1, available_at = $2 \
             WHERE id = $1 RETURNING *",
        )
        .bind(job_id.0)
        .bind(Utc::now() + chrono_ttl(delay))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        job_from_row(&row)
    }

    async fn pending_jobs(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count as usize)
    }
}

impl PostgresStore {
    async fn set_job_status(&self, job_id: JobId, status: JobStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET status = $2 WHERE id = $1")
            .bind(job_id.0)
            .bind(job_status_str(status))
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CheckpointStore for PostgresStore {
    async fn insert_idempotent(
        &self,
        run_id: RunId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<IdempotentWrite, StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO checkpoints (run_id, key, value, created_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (run_id, key) DO NOTHING",
        )
        .bind(run_id.0)
        .bind(key)
        .bind(&value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(backend)?
        .rows_affected();

        if inserted > 0 {
            return Ok(IdempotentWrite::Inserted);
        }

        let existing: serde_json::Value =
            sqlx::query_scalar("SELECT value FROM checkpoints WHERE run_id = $1 AND key = $2")
                .bind(run_id.0)
                .bind(key)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
        Ok(IdempotentWrite::Existing(existing))
    }

    async fn get_checkpoint(
        &self,
        run_id: RunId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        sqlx::query_scalar("SELECT value FROM checkpoints WHERE run_id = $1 AND key = $2")
            .bind(run_id.0)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)
    }

    async fn checkpoint_keys(&self, run_id: RunId) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar("SELECT key FROM checkpoints WHERE run_id = $1 ORDER BY created_at")
            .bind(run_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)
    }
}

#[async_trait::async_trait]
impl MessageStore for PostgresStore {
    async fn append_message(
        &self,
        run_id: RunId,
        role: MessageRole,
        content: String,
    ) -> Result<(), StoreError> {
        let role = serde_json::to_value(role)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "user".to_string());
        sqlx::query(
            "INSERT INTO run_messages (run_id, role, content, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(run_id.0)
        .bind(role)
        .bind(content)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn messages(&self, run_id: RunId) -> Result<Vec<RunMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_id, role, content, created_at FROM run_messages \
             WHERE run_id = $1 ORDER BY id",
        )
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| {
                let role: String = row.try_get("role").map_err(backend)?;
                Ok(RunMessage {
                    run_id: RunId(row.try_get::<Uuid, _>("run_id").map_err(backend)?),
                    role: parse_message_role(&role)?,
                    content: row.try_get("content").map_err(backend)?,
                    created_at: row.try_get("created_at").map_err(backend)?,
                })
            })
            .collect()
    }
}

// ── Ledger backend ───────────────────────────────────────────────────

fn parse_direction(value: &str) -> Result<Direction, LedgerStoreError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| LedgerStoreError::Backend(format!("unknown direction '{value}'")))
}

fn parse_transaction_type(value: &str) -> Result<TransactionType, LedgerStoreError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| LedgerStoreError::Backend(format!("unknown transaction type '{value}'")))
}

fn parse_provider(value: &str) -> Result<Provider, LedgerStoreError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| LedgerStoreError::Backend(format!("unknown provider '{value}'")))
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Debit => "debit",
        Direction::Credit => "credit",
    }
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, LedgerStoreError> {
    let direction: String = row.try_get("direction").map_err(ledger_backend)?;
    let transaction_type: String = row.try_get("transaction_type").map_err(ledger_backend)?;
    Ok(LedgerEntry {
        id: row.try_get("id").map_err(ledger_backend)?,
        org_id: OrgId(row.try_get::<Uuid, _>("org_id").map_err(ledger_backend)?),
        amount_usd: row.try_get("amount_usd").map_err(ledger_backend)?,
        direction: parse_direction(&direction)?,
        transaction_type: parse_transaction_type(&transaction_type)?,
        run_id: row
            .try_get::<Option<Uuid>, _>("run_id")
            .map_err(ledger_backend)?
            .map(RunId),
        step_id: row.try_get("step_id").map_err(ledger_backend)?,
        idempotency_key: row.try_get("idempotency_key").map_err(ledger_backend)?,
        reason: row.try_get("reason").map_err(ledger_backend)?,
        created_at: row.try_get("created_at").map_err(ledger_backend)?,
    })
}

fn token_record_from_row(row: &PgRow) -> Result<TokenRecord, LedgerStoreError> {
    let provider: String = row.try_get("provider").map_err(ledger_backend)?;
    Ok(TokenRecord {
        id: row.try_get("id").map_err(ledger_backend)?,
        org_id: OrgId(row.try_get::<Uuid, _>("org_id").map_err(ledger_backend)?),
        run_id: row
            .try_get::<Option<Uuid>, _>("run_id")
            .map_err(ledger_backend)?
            .map(RunId),
        step_id: row.try_get("step_id").map_err(ledger_backend)?,
        idempotency_key: row.try_get("idempotency_key").map_err(ledger_backend)?,
        input_tokens: row.try_get::<i64, _>("input_tokens").map_err(ledger_backend)? as u64,
        output_tokens: row.try_get::<i64, _>("output_tokens").map_err(ledger_backend)? as u64,
        model: row.try_get("model").map_err(ledger_backend)?,
        provider: parse_provider(&provider)?,
        cost_usd: row.try_get("cost_usd").map_err(ledger_backend)?,
        is_estimated: row.try_get("is_estimated").map_err(ledger_backend)?,
        created_at: row.try_get("created_at").map_err(ledger_backend)?,
    })
}

fn balance_from_row(row: &PgRow) -> Result<CreditBalance, LedgerStoreError> {
    Ok(CreditBalance {
        org_id: OrgId(row.try_get::<Uuid, _>("org_id").map_err(ledger_backend)?),
        balance_usd: row.try_get("balance_usd").map_err(ledger_backend)?,
        reserved_usd: row.try_get("reserved_usd").map_err(ledger_backend)?,
        updated_at: row.try_get("updated_at").map_err(ledger_backend)?,
    })
}

impl PostgresStore {
    /// Look up a previously recorded write for this (org, key), returning a
    /// deduplicated outcome with the current balance.
    async fn existing_outcome(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        org_id: OrgId,
        idempotency_key: &str,
    ) -> Result<Option<LedgerWriteOutcome>, LedgerStoreError> {
        let existing = sqlx::query(
            "SELECT id FROM ledger_entries WHERE org_id = $1 AND idempotency_key = $2",
        )
        .bind(org_id.0)
        .bind(idempotency_key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(ledger_backend)?;

        let Some(row) = existing else {
            return Ok(None);
        };
        let entry_id: Uuid = row.try_get("id").map_err(ledger_backend)?;
        let balance: Decimal =
            sqlx::query_scalar("SELECT balance_usd FROM credit_balances WHERE org_id = $1")
                .bind(org_id.0)
                .fetch_optional(&mut **tx)
                .await
                .map_err(ledger_backend)?
                .unwrap_or(Decimal::ZERO);
        Ok(Some(LedgerWriteOutcome {
            entry_id,
            new_balance_usd: balance,
            deduplicated: true,
        }))
    }

    /// Lock (creating if needed) the org's balance row.
    async fn lock_balance(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        org_id: OrgId,
    ) -> Result<CreditBalance, LedgerStoreError> {
        sqlx::query(
            "INSERT INTO credit_balances (org_id, balance_usd, reserved_usd, updated_at) \
             VALUES ($1, 0, 0, $2) ON CONFLICT (org_id) DO NOTHING",
        )
        .bind(org_id.0)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .map_err(ledger_backend)?;

        let row = sqlx::query("SELECT * FROM credit_balances WHERE org_id = $1 FOR UPDATE")
            .bind(org_id.0)
            .fetch_one(&mut **tx)
            .await
            .map_err(ledger_backend)?;
        balance_from_row(&row)
    }

    async fn write_entry(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entry: &LedgerEntry,
    ) -> Result<(), LedgerStoreError> {
        sqlx::query(
            "INSERT INTO ledger_entries \
             (id, org_id, amount_usd, direction, transaction_type, run_id, step_id, \
              idempotency_key, reason, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(entry.id)
        .bind(entry.org_id.0)
        .bind(entry.amount_usd)
        .bind(direction_str(entry.direction))
        .bind(entry.transaction_type.as_str())
        .bind(entry.run_id.map(|r| r.0))
        .bind(&entry.step_id)
        .bind(&entry.idempotency_key)
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(ledger_backend)?;
        Ok(())
    }

    async fn set_balance(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        org_id: OrgId,
        balance_usd: Decimal,
        reserved_usd: Decimal,
    ) -> Result<(), LedgerStoreError> {
        sqlx::query(
            "UPDATE credit_balances SET balance_usd = $2, reserved_usd = $3, updated_at = $4 \
             WHERE org_id = $1",
        )
        .bind(org_id.0)
        .bind(balance_usd)
        .bind(reserved_usd)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .map_err(ledger_backend)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresStore {
    async fn record_token_call(
        &self,
        args: TokenCallArgs,
    ) -> Result<LedgerWriteOutcome, LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(ledger_backend)?;

        if let Some(outcome) = self
            .existing_outcome(&mut tx, args.org_id, &args.idempotency_key)
            .await?
        {
            return Ok(outcome);
        }

        let balance = self.lock_balance(&mut tx, args.org_id).await?;
        if balance.balance_usd < args.cost_usd {
            return Err(LedgerStoreError::InsufficientFunds {
                required: args.cost_usd,
                balance: balance.balance_usd,
            });
        }
        let new_balance = balance.balance_usd - args.cost_usd;
        self.set_balance(&mut tx, args.org_id, new_balance, balance.reserved_usd)
            .await?;

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            org_id: args.org_id,
            amount_usd: args.cost_usd,
            direction: Direction::Debit,
            transaction_type: TransactionType::TokenUsage,
            run_id: args.run_id,
            step_id: args.step_id.clone(),
            idempotency_key: args.idempotency_key.clone(),
            reason: None,
            created_at: Utc::now(),
        };
        self.write_entry(&mut tx, &entry).await?;

        sqlx::query(
            "INSERT INTO token_records \
             (id, org_id, run_id, step_id, idempotency_key, input_tokens, output_tokens, \
              model, provider, cost_usd, is_estimated, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(Uuid::new_v4())
        .bind(args.org_id.0)
        .bind(args.run_id.map(|r| r.0))
        .bind(&args.step_id)
        .bind(&args.idempotency_key)
        .bind(args.input_tokens as i64)
        .bind(args.output_tokens as i64)
        .bind(&args.model)
        .bind(args.provider.as_str())
        .bind(args.cost_usd)
        .bind(args.is_estimated)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(ledger_backend)?;

        tx.commit().await.map_err(ledger_backend)?;
        Ok(LedgerWriteOutcome {
            entry_id: entry.id,
            new_balance_usd: new_balance,
            deduplicated: false,
        })
    }

    async fn add_credits(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        transaction_type: TransactionType,
        reason: String,
        idempotency_key: String,
    ) -> Result<LedgerWriteOutcome, LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(ledger_backend)?;

        if let Some(outcome) = self
            .existing_outcome(&mut tx, org_id, &idempotency_key)
            .await?
        {
            return Ok(outcome);
        }

        let balance = self.lock_balance(&mut tx, org_id).await?;
        let new_balance = balance.balance_usd + amount_usd;
        self.set_balance(&mut tx, org_id, new_balance, balance.reserved_usd)
            .await?;

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            org_id,
            amount_usd,
            direction: Direction::Credit,
            transaction_type,
            run_id: None,
            step_id: None,
            idempotency_key,
            reason: Some(reason),
            created_at: Utc::now(),
        };
        self.write_entry(&mut tx, &entry).await?;

        tx.commit().await.map_err(ledger_backend)?;
        Ok(LedgerWriteOutcome {
            entry_id: entry.id,
            new_balance_usd: new_balance,
            deduplicated: false,
        })
    }

    async fn apply_adjustment(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        run_id: Option<RunId>,
        reason: String,
        idempotency_key: String,
    ) -> Result<LedgerWriteOutcome, LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(ledger_backend)?;

        if let Some(outcome) = self
            .existing_outcome(&mut tx, org_id, &idempotency_key)
            .await?
        {
            return Ok(outcome);
        }

        let (direction, magnitude) = if amount_usd >= Decimal::ZERO {
            (Direction::Debit, amount_usd)
        } else {
            (Direction::Credit, -amount_usd)
        };

        let balance = self.lock_balance(&mut tx, org_id).await?;
        let new_balance = match direction {
            Direction::Debit => balance.balance_usd - magnitude,
            Direction::Credit => balance.balance_usd + magnitude,
        };
        self.set_balance(&mut tx, org_id, new_balance, balance.reserved_usd)
            .await?;

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            org_id,
            amount_usd: magnitude,
            direction,
            transaction_type: TransactionType::Adjustment,
            run_id,
            step_id: None,
            idempotency_key,
            reason: Some(reason),
            created_at: Utc::now(),
        };
        self.write_entry(&mut tx, &entry).await?;

        tx.commit().await.map_err(ledger_backend)?;
        Ok(LedgerWriteOutcome {
            entry_id: entry.id,
            new_balance_usd: new_balance,
            deduplicated: false,
        })
    }

    async fn get_balance(&self, org_id: OrgId) -> Result<Option<CreditBalance>, LedgerStoreError> {
        let row = sqlx::query("SELECT * FROM credit_balances WHERE org_id = $1")
            .bind(org_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(ledger_backend)?;
        row.as_ref().map(balance_from_row).transpose()
    }

    async fn get_or_create_balance(
        &self,
        org_id: OrgId,
    ) -> Result<CreditBalance, LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(ledger_backend)?;
        let balance = self.lock_balance(&mut tx, org_id).await?;
        tx.commit().await.map_err(ledger_backend)?;
        Ok(balance)
    }

    async fn reserve_credits(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        _run_id: RunId,
    ) -> Result<bool, LedgerStoreError> {
        let result = sqlx::query(
            "UPDATE credit_balances SET reserved_usd = reserved_usd + $2, updated_at = $3 \
             WHERE org_id = $1 AND balance_usd - reserved_usd >= $2",
        )
        .bind(org_id.0)
        .bind(amount_usd)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(ledger_backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_reserved(
        &self,
        org_id: OrgId,
        amount_usd: Decimal,
        _run_id: RunId,
    ) -> Result<(), LedgerStoreError> {
        sqlx::query(
            "UPDATE credit_balances \
             SET reserved_usd = GREATEST(0, reserved_usd - $2), updated_at = $3 \
             WHERE org_id = $1",
        )
        .bind(org_id.0)
        .bind(amount_usd)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(ledger_backend)?;
        Ok(())
    }

    async fn history(
        &self,
        org_id: OrgId,
        query: HistoryQuery,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError> {
        let limit = query.limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows = match query.transaction_type {
            Some(transaction_type) => {
                sqlx::query(
                    "SELECT * FROM ledger_entries \
                     WHERE org_id = $1 AND transaction_type = $2 \
                     ORDER BY created_at DESC OFFSET $3 LIMIT $4",
                )
                .bind(org_id.0)
                .bind(transaction_type.as_str())
                .bind(query.offset as i64)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM ledger_entries WHERE org_id = $1 \
                     ORDER BY created_at DESC OFFSET $2 LIMIT $3",
                )
                .bind(org_id.0)
                .bind(query.offset as i64)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(ledger_backend)?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn token_records_for_run(
        &self,
        run_id: RunId,
        include_estimated: bool,
    ) -> Result<Vec<TokenRecord>, LedgerStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM token_records \
             WHERE run_id = $1 AND (is_estimated = false OR $2) \
             ORDER BY created_at",
        )
        .bind(run_id.0)
        .bind(include_estimated)
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_backend)?;
        rows.iter().map(token_record_from_row).collect()
    }

    async fn mark_token_record_actual(
        &self,
        org_id: OrgId,
        idempotency_key: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: Decimal,
    ) -> Result<Option<TokenRecord>, LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(ledger_backend)?;

        let row = sqlx::query(
            "SELECT * FROM token_records \
             WHERE org_id = $1 AND idempotency_key = $2 FOR UPDATE",
        )
        .bind(org_id.0)
        .bind(idempotency_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(ledger_backend)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let previous = token_record_from_row(&row)?;

        sqlx::query(
            "UPDATE token_records \
             SET input_tokens = $3, output_tokens = $4, cost_usd = $5, is_estimated = false \
             WHERE org_id = $1 AND idempotency_key = $2",
        )
        .bind(org_id.0)
        .bind(idempotency_key)
        .bind(input_tokens as i64)
        .bind(output_tokens as i64)
        .bind(cost_usd)
        .execute(&mut *tx)
        .await
        .map_err(ledger_backend)?;

        tx.commit().await.map_err(ledger_backend)?;
        Ok(Some(previous))
    }

    async fn insert_reconciliation(
        &self,
        reconciliation: TokenReconciliation,
    ) -> Result<(), LedgerStoreError> {
        sqlx::query(
            "INSERT INTO token_reconciliations \
             (id, run_id, org_id, records_replaced, estimated_cost_usd, actual_cost_usd, \
              adjustment_usd, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(reconciliation.id)
        .bind(reconciliation.run_id.0)
        .bind(reconciliation.org_id.0)
        .bind(reconciliation.records_replaced as i64)
        .bind(reconciliation.estimated_cost_usd)
        .bind(reconciliation.actual_cost_usd)
        .bind(reconciliation.adjustment_usd)
        .bind(reconciliation.created_at)
        .execute(&self.pool)
        .await
        .map_err(ledger_backend)?;
        Ok(())
    }
}

// ── OT persistence ───────────────────────────────────────────────────

#[async_trait::async_trait]
impl DocumentPersistence for PostgresStore {
    async fn load_document(&self, document_id: &str) -> Option<Document> {
        let row = sqlx::query("SELECT * FROM ot_documents WHERE id = $1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await
            .ok()??;
        let content: String = row.try_get("content").ok()?;
        let version = row.try_get::<i64, _>("version").ok()? as u64;

        let history_rows = sqlx::query(
            "SELECT batch FROM ot_operation_history WHERE document_id = $1 ORDER BY version",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .ok()?;

        let mut history: Vec<OperationBatch> = Vec::with_capacity(history_rows.len());
        for row in &history_rows {
            let value: serde_json::Value = row.try_get("batch").ok()?;
            history.push(serde_json::from_value(value).ok()?);
        }

        Some(Document::restore(document_id, content, version, history))
    }

    async fn save_batch(&self, document: &Document, batch: &OperationBatch) {
        let batch_json = match serde_json::to_value(batch) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(document_id = %document.id, %err, "Failed to serialize batch");
                return;
            }
        };

        let result = sqlx::query(
            "INSERT INTO ot_documents (id, content, version, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET content = $2, version = $3, updated_at = $4",
        )
        .bind(&document.id)
        .bind(&document.content)
        .bind(document.version as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            tracing::error!(document_id = %document.id, %err, "Failed to persist document");
            return;
        }

        let result = sqlx::query(
            "INSERT INTO ot_operation_history (document_id, version, batch, created_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (document_id, version) DO NOTHING",
        )
        .bind(&document.id)
        .bind(document.version as i64)
        .bind(batch_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            tracing::error!(document_id = %document.id, %err, "Failed to persist batch");
        }
    }
}
