//! Observability: Prometheus metrics, health checks, and alerting with
//! HMAC-signed webhooks.

#![deny(unsafe_code)]

pub mod alerting;
pub mod health;
pub mod metrics;
pub mod webhook;

pub use alerting::{Alert, AlertManager, AlertSeverity, AlertSink};
pub use health::{ComponentHealth, HealthCheck, HealthRegistry, HealthReport, HealthStatus};
pub use metrics::{export_metrics, CoreMetrics};
pub use webhook::{sign_payload, verify_signature, WebhookConfig, WebhookSink};
