//! Liveness, readiness, and the aggregated health report.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn rank(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    /// The worse of two statuses.
    pub fn combine(self, other: HealthStatus) -> HealthStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub detail: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            detail: None,
        }
    }

    pub fn degraded(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            detail: Some(detail.into()),
        }
    }

    pub fn unhealthy(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> ComponentHealth;
    /// Whether this check gates readiness (as opposed to being reported
    /// only in the aggregate).
    fn required_for_readiness(&self) -> bool {
        true
    }
}

/// Holds the registered checks and answers the three health questions.
#[derive(Default)]
pub struct HealthRegistry {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, check: Arc<dyn HealthCheck>) {
        self.checks.push(check);
    }

    /// Liveness: the process is up and responding.
    pub fn liveness(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    /// Readiness: every readiness-gating check passes.
    pub async fn readiness(&self) -> HealthStatus {
        let mut status = HealthStatus::Healthy;
        for check in self.checks.iter().filter(|c| c.required_for_readiness()) {
            status = status.combine(check.check().await.status);
        }
        status
    }

    /// The aggregated report across all checks.
    pub async fn report(&self) -> HealthReport {
        let mut components = Vec::with_capacity(self.checks.len());
        let mut status = HealthStatus::Healthy;
        for check in &self.checks {
            let health = check.check().await;
            status = status.combine(health.status);
            components.push(health);
        }
        HealthReport {
            status,
            components,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticCheck {
        name: String,
        status: HealthStatus,
        gating: bool,
    }

    #[async_trait]
    impl HealthCheck for StaticCheck {
        fn name(&self) -> &str {
            &self.name
        }

        async fn check(&self) -> ComponentHealth {
            ComponentHealth {
                component: self.name.clone(),
                status: self.status,
                detail: None,
            }
        }

        fn required_for_readiness(&self) -> bool {
            self.gating
        }
    }

    fn check(name: &str, status: HealthStatus, gating: bool) -> Arc<dyn HealthCheck> {
        Arc::new(StaticCheck {
            name: name.to_string(),
            status,
            gating,
        })
    }

    #[tokio::test]
    async fn aggregate_takes_the_worst_status() {
        let mut registry = HealthRegistry::new();
        registry.register(check("store", HealthStatus::Healthy, true));
        registry.register(check("billing", HealthStatus::Degraded, true));

        let report = registry.report().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.components.len(), 2);
    }

    #[tokio::test]
    async fn readiness_ignores_non_gating_checks() {
        let mut registry = HealthRegistry::new();
        registry.register(check("store", HealthStatus::Healthy, true));
        registry.register(check("collab", HealthStatus::Unhealthy, false));

        assert_eq!(registry.readiness().await, HealthStatus::Healthy);
        assert_eq!(registry.report().await.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn liveness_is_always_healthy() {
        assert_eq!(HealthRegistry::new().liveness(), HealthStatus::Healthy);
    }
}
