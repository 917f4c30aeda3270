//! The cross-cutting error taxonomy.
//!
//! Adapters convert third-party failures into these variants at the boundary;
//! the orchestrator and gateway only ever observe this set. Each variant
//! carries a human message and, where meaningful, a retry-after hint.

use std::time::Duration;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Insufficient credits: required ${required}, available ${available}")]
    InsufficientCredits { required: String, available: String },

    #[error("Per-call cost limit exceeded: {0}")]
    PerCallLimit(String),

    #[error("Run budget exceeded: {0}")]
    RunBudget(String),

    #[error("Rate limited: {scope}")]
    RateLimited {
        scope: String,
        retry_after: Duration,
    },

    #[error("Transient provider failure: {0}")]
    TransientProvider(String),

    #[error("Sandbox unhealthy: {0}")]
    SandboxUnhealthy(String),

    #[error("Tool call failed: {0}")]
    ToolError(String),

    #[error("Store conflict: {0}")]
    StoreConflict(String),

    #[error("Store failure: {0}")]
    StoreFailure(String),

    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Plan rejected: {0}")]
    PlanRejected(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

impl CoreError {
    /// Whether the operation may be retried by the caller.
    ///
    /// Rate limits are retryable after their hint; transient provider and
    /// unexpected store failures are retryable with backoff. Everything else
    /// must be surfaced.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::RateLimited { .. }
                | CoreError::TransientProvider(_)
                | CoreError::StoreFailure(_)
        )
    }

    /// Retry hint, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Stable machine-readable code for wire frames and run error records.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::AuthorizationDenied(_) => "authorization_denied",
            CoreError::InsufficientCredits { .. } => "insufficient_credits",
            CoreError::PerCallLimit(_) => "per_call_limit",
            CoreError::RunBudget(_) => "run_budget",
            CoreError::RateLimited { .. } => "rate_limited",
            CoreError::TransientProvider(_) => "transient_provider",
            CoreError::SandboxUnhealthy(_) => "sandbox_unhealthy",
            CoreError::ToolError(_) => "tool_error",
            CoreError::StoreConflict(_) => "store_conflict",
            CoreError::StoreFailure(_) => "store_failure",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::PlanRejected(_) => "plan_rejected",
            CoreError::Cancelled => "cancelled",
            CoreError::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_split() {
        assert!(CoreError::TransientProvider("503".into()).is_retryable());
        assert!(CoreError::StoreFailure("io".into()).is_retryable());
        assert!(!CoreError::Validation("bad".into()).is_retryable());
        assert!(!CoreError::InsufficientCredits {
            required: "0.50".into(),
            available: "0.01".into()
        }
        .is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
    }

    #[test]
    fn rate_limit_carries_hint() {
        let err = CoreError::RateLimited {
            scope: "ops".into(),
            retry_after: Duration::from_secs(2),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(err.code(), "rate_limited");
    }
}
