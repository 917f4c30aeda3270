//! Server configuration, loaded from the environment once at startup and
//! immutable afterwards.

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Postgres URL; absent means the in-memory store (single-node/dev).
    pub database_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    /// Outbound alert webhook endpoint and signing secret.
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub execution_model: String,
    pub worker_count: usize,
    pub run_deadline: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().expect("static addr parses"),
            database_url: None,
            openai_api_key: None,
            anthropic_api_key: None,
            webhook_url: None,
            webhook_secret: None,
            execution_model: "gpt-4o".to_string(),
            worker_count: 2,
            run_deadline: Duration::from_secs(600),
        }
    }
}

impl ServerConfig {
    /// Read configuration from `ATELIER_*` environment variables, falling
    /// back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: std::env::var("ATELIER_LISTEN_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.listen_addr),
            database_url: std::env::var("ATELIER_DATABASE_URL").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            webhook_url: std::env::var("ATELIER_WEBHOOK_URL").ok(),
            webhook_secret: std::env::var("ATELIER_WEBHOOK_SECRET").ok(),
            execution_model: std::env::var("ATELIER_MODEL")
                .unwrap_or(defaults.execution_model),
            worker_count: std::env::var("ATELIER_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.worker_count),
            run_deadline: std::env::var("ATELIER_RUN_DEADLINE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_deadline),
        }
    }
}
