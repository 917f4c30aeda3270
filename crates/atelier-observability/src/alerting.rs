//! Alert routing with dedup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Event name, e.g. `circuit_breaker.open`.
    pub event: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(event: impl Into<String>, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            severity,
            message: message.into(),
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert);
}

/// Fans alerts out to sinks, suppressing repeats of the same event within
/// the dedup window.
pub struct AlertManager {
    sinks: Vec<Arc<dyn AlertSink>>,
    dedup_window: Duration,
    recent: Mutex<HashMap<String, Instant>>,
}

impl AlertManager {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            sinks: Vec::new(),
            dedup_window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn AlertSink>) {
        self.sinks.push(sink);
    }

    /// Dispatch an alert. Returns false when suppressed by dedup.
    pub async fn fire(&self, alert: Alert) -> bool {
        {
            let mut recent = self.recent.lock().await;
            let now = Instant::now();
            recent.retain(|_, t| now.duration_since(*t) < self.dedup_window);
            if recent.contains_key(&alert.event) {
                tracing::debug!(event = %alert.event, "Alert suppressed by dedup window");
                return false;
            }
            recent.insert(alert.event.clone(), now);
        }

        tracing::info!(event = %alert.event, severity = ?alert.severity, "Alert fired");
        for sink in &self.sinks {
            sink.deliver(&alert).await;
        }
        true
    }
}
