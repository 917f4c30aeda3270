//! The run lifecycle.
//!
//! A run moves through a fixed state graph; any edge outside the table below
//! is rejected without touching state. Every accepted transition bumps the
//! run's `state_version`, which together with the fencing token forms the
//! optimistic-concurrency guard on all run writes.

use crate::error::CoreError;
use crate::ids::{OrgId, RunId};
use crate::plan::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run lifecycle states.
///
/// ```text
/// CREATED -> VALIDATING | CANCELLED
/// VALIDATING -> DECOMPOSING | FAILED | CANCELLED
/// DECOMPOSING -> SCHEDULING | FAILED | CANCELLED
/// SCHEDULING -> EXECUTING | FAILED | CANCELLED
/// EXECUTING -> AGGREGATING | FAILED | CANCELLED
/// AGGREGATING -> FINALIZING | FAILED | CANCELLED
/// FINALIZING -> COMPLETED | FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Validating,
    Decomposing,
    Scheduling,
    Executing,
    Aggregating,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    /// Legal successor states.
    pub fn successors(&self) -> &'static [RunState] {
        use RunState::*;
        match self {
            Created => &[Validating, Cancelled],
            Validating => &[Decomposing, Failed, Cancelled],
            Decomposing => &[Scheduling, Failed, Cancelled],
            Scheduling => &[Executing, Failed, Cancelled],
            Executing => &[Aggregating, Failed, Cancelled],
            Aggregating => &[Finalizing, Failed, Cancelled],
            Finalizing => &[Completed, Failed],
            Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition(&self, next: RunState) -> bool {
        self.successors().contains(&next)
    }

    /// Validate an edge, producing the taxonomy error on violation.
    pub fn guard(&self, next: RunState) -> Result<(), CoreError> {
        if self.can_transition(next) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Validating => "validating",
            RunState::Decomposing => "decomposing",
            RunState::Scheduling => "scheduling",
            RunState::Executing => "executing",
            RunState::Aggregating => "aggregating",
            RunState::Finalizing => "finalizing",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The most recent structured error for a run.
///
/// Distinct errors across retries are not collapsed; each write replaces the
/// previous record wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl RunError {
    pub fn from_core(err: &CoreError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            occurred_at: Utc::now(),
        }
    }
}

/// The durable run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub org_id: OrgId,
    pub prompt: String,
    pub state: RunState,
    /// Bumped on every accepted transition; fences stale writers.
    pub state_version: u64,
    pub plan: Option<Plan>,
    /// Index of the last phase known to have completed, if any.
    pub completed_phase: Option<usize>,
    /// Accumulated cost in USD, updated as phases charge.
    pub cost_usd: String,
    pub deadline: Option<DateTime<Utc>>,
    pub last_error: Option<RunError>,
    /// Final output once the run completes.
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(org_id: OrgId, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            org_id,
            prompt: prompt.into(),
            state: RunState::Created,
            state_version: 0,
            plan: None,
            completed_phase: None,
            cost_usd: "0".to_string(),
            deadline: None,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Actions accepted by the control-plane `execute` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteAction {
    Create,
    Start,
    Stop,
    Retry,
    Resume,
}
