//! Routing, retry and fallback.

use crate::types::{CompletionRequest, CompletionResponse};
use crate::LlmProvider;
use atelier_types::{CoreError, CoreResult, Ctx};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Retries per provider on retryable errors.
    pub max_retries: u32,
    pub base_backoff: Duration,
    /// Cap on honored rate-limit hints; longer hints surface instead.
    pub max_retry_after: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
            max_retry_after: Duration::from_secs(10),
        }
    }
}

/// Routes model ids to providers and shields callers from transient provider
/// failures.
pub struct LlmGateway {
    /// Longest-prefix match on the model id.
    routes: Vec<(String, Arc<dyn LlmProvider>)>,
    primary: Arc<dyn LlmProvider>,
    fallback: Option<Arc<dyn LlmProvider>>,
    config: GatewayConfig,
}

impl LlmGateway {
    pub fn new(primary: Arc<dyn LlmProvider>, config: GatewayConfig) -> Self {
        Self {
            routes: Vec::new(),
            primary,
            fallback: None,
            config,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn LlmProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Route model ids starting with `prefix` to `provider`.
    pub fn with_route(mut self, prefix: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        self.routes.push((prefix.into(), provider));
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    fn route(&self, model: &str) -> Arc<dyn LlmProvider> {
        self.routes
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, provider)| Arc::clone(provider))
            .unwrap_or_else(|| Arc::clone(&self.primary))
    }

    async fn try_provider(
        &self,
        provider: &Arc<dyn LlmProvider>,
        request: &CompletionRequest,
        ctx: &Ctx,
    ) -> CoreResult<CompletionResponse> {
        let mut last_error = CoreError::TransientProvider("no attempt made".to_string());

        for attempt in 0..=self.config.max_retries {
            ctx.checkpoint()?;
            match provider.complete(request, ctx).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = match err.retry_after() {
                        Some(hint) if hint <= self.config.max_retry_after => hint,
                        Some(_) => return Err(err),
                        None => self.config.base_backoff * 2u32.pow(attempt),
                    };
                    tracing::warn!(
                        provider = provider.name(),
                        attempt,
                        ?delay,
                        error = %err,
                        "Provider call failed, retrying"
                    );
                    last_error = err;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error)
    }

    /// Complete a request, retrying transients and falling back once the
    /// routed provider is exhausted.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        ctx: &Ctx,
    ) -> CoreResult<CompletionResponse> {
        let provider = self.route(&request.model);

        match self.try_provider(&provider, request, ctx).await {
            Ok(response) => Ok(response),
            Err(err) if err.is_retryable() => {
                let Some(fallback) = &self.fallback else {
                    return Err(err);
                };
                if fallback.name() == provider.name() {
                    return Err(err);
                }
                tracing::warn!(
                    from = provider.name(),
                    to = fallback.name(),
                    error = %err,
                    "Falling back to secondary provider"
                );
                self.try_provider(fallback, request, ctx).await
            }
            Err(err) => Err(err),
        }
    }
}
