//! The control-plane surface: execute actions and run reads.

use atelier_ledger::LedgerService;
use atelier_store::{MessageRole, Store, StoreError};
use atelier_types::{CoreError, CoreResult, ExecuteAction, OrgId, RunId, RunRecord, RunState};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteOutcome {
    pub run_id: RunId,
    pub status: RunState,
    pub message: String,
}

/// Handles `execute` actions from the edge and read access to runs.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    ledger: LedgerService,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, ledger: LedgerService) -> Self {
        Self { store, ledger }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub async fn execute(
        &self,
        action: ExecuteAction,
        org_id: OrgId,
        prompt: Option<String>,
        run_id: Option<RunId>,
    ) -> CoreResult<ExecuteOutcome> {
        match action {
            ExecuteAction::Create => self.create(org_id, prompt).await,
            ExecuteAction::Start => self.start(self.require_run_id(run_id)?).await,
            ExecuteAction::Stop => self.stop(self.require_run_id(run_id)?).await,
            ExecuteAction::Retry => self.retry(org_id, self.require_run_id(run_id)?).await,
            ExecuteAction::Resume => self.resume(self.require_run_id(run_id)?).await,
        }
    }

    fn require_run_id(&self, run_id: Option<RunId>) -> CoreResult<RunId> {
        run_id.ok_or_else(|| CoreError::Validation("run_id is required for this action".into()))
    }

    async fn load_run(&self, run_id: RunId) -> CoreResult<RunRecord> {
        self.store
            .get_run(run_id)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::Validation(format!("run {run_id} not found")))
    }

    /// Create a run and enqueue it.
    async fn create(&self, org_id: OrgId, prompt: Option<String>) -> CoreResult<ExecuteOutcome> {
        let prompt = prompt
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| CoreError::Validation("prompt is required".into()))?;

        let balance = self.ledger.get_or_create_balance(org_id).await?;
        if balance.available_usd() <= Decimal::ZERO {
            return Err(CoreError::InsufficientCredits {
                required: "> 0".to_string(),
                available: balance.available_usd().to_string(),
            });
        }

        let run = RunRecord::new(org_id, prompt.clone());
        let run_id = run.id;
        self.store.insert_run(run).await.map_err(CoreError::from)?;
        self.store
            .append_message(run_id, MessageRole::User, prompt)
            .await
            .map_err(CoreError::from)?;
        self.store.enqueue(run_id, 0).await.map_err(CoreError::from)?;

        tracing::info!(%run_id, %org_id, "Run created and enqueued");
        Ok(ExecuteOutcome {
            run_id,
            status: RunState::Created,
            message: "Run created and queued for processing".to_string(),
        })
    }

    /// Enqueue a created run that is not queued yet.
    async fn start(&self, run_id: RunId) -> CoreResult<ExecuteOutcome> {
        let run = self.load_run(run_id).await?;
        if run.state != RunState::Created {
            return Err(CoreError::Validation(format!(
                "cannot start run in state {}",
                run.state
            )));
        }

        match self.store.enqueue(run_id, 0).await {
            Ok(_) => Ok(ExecuteOutcome {
                run_id,
                status: run.state,
                message: "Run queued for processing".to_string(),
            }),
            Err(StoreError::Conflict(_)) => Ok(ExecuteOutcome {
                run_id,
                status: run.state,
                message: "Run is already queued".to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Cancel at the earliest legal state.
    async fn stop(&self, run_id: RunId) -> CoreResult<ExecuteOutcome> {
        self.load_run(run_id).await?;
        let run = self
            .store
            .request_cancel(run_id)
            .await
            .map_err(|err| match err {
                StoreError::InvalidTransition { from, .. } => {
                    CoreError::Validation(format!("cannot cancel run in state {from}"))
                }
                other => other.into(),
            })?;

        tracing::info!(%run_id, "Run cancelled");
        Ok(ExecuteOutcome {
            run_id,
            status: run.state,
            message: "Run cancelled".to_string(),
        })
    }

    /// Clone a failed run's prompt into a fresh run.
    async fn retry(&self, org_id: OrgId, run_id: RunId) -> CoreResult<ExecuteOutcome> {
        let run = self.load_run(run_id).await?;
        if run.state != RunState::Failed {
            return Err(CoreError::Validation(format!(
                "cannot retry run in state {}",
                run.state
            )));
        }
        self.create(org_id, Some(run.prompt)).await
    }

    /// Re-enqueue a run parked mid-execution (after a crash or exhausted
    /// retries) so a worker picks it up again.
    async fn resume(&self, run_id: RunId) -> CoreResult<ExecuteOutcome> {
        let run = self.load_run(run_id).await?;
        if run.state.is_terminal() || run.state == RunState::Created {
            return Err(CoreError::Validation(format!(
                "cannot resume run in state {}",
                run.state
            )));
        }

        match self.store.enqueue(run_id, 0).await {
            Ok(_) => Ok(ExecuteOutcome {
                run_id,
                status: run.state,
                message: "Run resumed".to_string(),
            }),
            Err(StoreError::Conflict(_)) => Ok(ExecuteOutcome {
                run_id,
                status: run.state,
                message: "Run already has a pending job".to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_run(&self, run_id: RunId) -> CoreResult<Option<RunRecord>> {
        Ok(self.store.get_run(run_id).await.map_err(CoreError::from)?)
    }

    pub async fn messages(
        &self,
        run_id: RunId,
    ) -> CoreResult<Vec<atelier_store::RunMessage>> {
        Ok(self.store.messages(run_id).await.map_err(CoreError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_ledger::{MemoryLedger, TransactionType};
    use atelier_store::MemoryStore;
    use rust_decimal_macros::dec;

    async fn orchestrator_with_credit() -> (Orchestrator, OrgId) {
        let store = Arc::new(MemoryStore::new());
        let ledger = LedgerService::new(Arc::new(MemoryLedger::new()));
        let org = OrgId::generate();
        ledger
            .add_credits(org, dec!(10.00), TransactionType::Purchase, "seed", "c1")
            .await
            .unwrap();
        (Orchestrator::new(store, ledger), org)
    }

    #[tokio::test]
    async fn create_inserts_and_enqueues() {
        let (orchestrator, org) = orchestrator_with_credit().await;
        let outcome = orchestrator
            .execute(ExecuteAction::Create, org, Some("do a task".into()), None)
            .await
            .unwrap();

        let run = orchestrator.get_run(outcome.run_id).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Created);

        let messages = orchestrator.messages(outcome.run_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "do a task");
    }

    #[tokio::test]
    async fn create_requires_prompt() {
        let (orchestrator, org) = orchestrator_with_credit().await;
        let err = orchestrator
            .execute(ExecuteAction::Create, org, Some("   ".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn create_requires_credit() {
        let store = Arc::new(MemoryStore::new());
        let ledger = LedgerService::new(Arc::new(MemoryLedger::new()));
        let orchestrator = Orchestrator::new(store, ledger);

        let err = orchestrator
            .execute(ExecuteAction::Create, OrgId::generate(), Some("task".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientCredits { .. }));
    }

    #[tokio::test]
    async fn stop_cancels_at_earliest_state() {
        let (orchestrator, org) = orchestrator_with_credit().await;
        let created = orchestrator
            .execute(ExecuteAction::Create, org, Some("task".into()), None)
            .await
            .unwrap();

        let stopped = orchestrator
            .execute(ExecuteAction::Stop, org, None, Some(created.run_id))
            .await
            .unwrap();
        assert_eq!(stopped.status, RunState::Cancelled);

        // A second stop is an invalid-state request.
        let err = orchestrator
            .execute(ExecuteAction::Stop, org, None, Some(created.run_id))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_run_is_reported() {
        let (orchestrator, org) = orchestrator_with_credit().await;
        let err = orchestrator
            .execute(ExecuteAction::Stop, org, None, Some(RunId::generate()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn retry_requires_failed_state() {
        let (orchestrator, org) = orchestrator_with_credit().await;
        let created = orchestrator
            .execute(ExecuteAction::Create, org, Some("task".into()), None)
            .await
            .unwrap();

        let err = orchestrator
            .execute(ExecuteAction::Retry, org, None, Some(created.run_id))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn start_is_idempotent_about_existing_jobs() {
        let (orchestrator, org) = orchestrator_with_credit().await;
        let created = orchestrator
            .execute(ExecuteAction::Create, org, Some("task".into()), None)
            .await
            .unwrap();

        // Create already enqueued; start reports that gracefully.
        let outcome = orchestrator
            .execute(ExecuteAction::Start, org, None, Some(created.run_id))
            .await
            .unwrap();
        assert!(outcome.message.contains("already"));
    }
}
