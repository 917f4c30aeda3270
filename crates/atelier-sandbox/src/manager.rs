//! The sandbox manager.

use crate::limits::{ResourceLimits, SandboxTier};
use crate::provider::{ExecutionResult, FileEntry, SandboxProvider};
use atelier_types::{CoreError, CoreResult, Ctx, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const PROBE_PATH: &str = "/tmp/.atelier-probe";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SandboxManagerConfig {
    /// Process-wide cap on concurrent environments.
    pub max_concurrent: usize,
    /// Idle environments past this age are destroyed on the next sweep.
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for SandboxManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            idle_ttl: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Cumulative per-environment metrics for the current run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxMetrics {
    pub executions: u64,
    pub exit_codes: HashMap<i32, u64>,
    pub total_execute_time: Duration,
    pub consecutive_health_failures: u32,
    pub recreations: u32,
}

struct SandboxState {
    provider_id: String,
    limits: ResourceLimits,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    metrics: SandboxMetrics,
}

/// Leases one environment per run and keeps it healthy.
pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    config: SandboxManagerConfig,
    sandboxes: Mutex<HashMap<RunId, SandboxState>>,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: SandboxManagerConfig) -> Self {
        Self {
            provider,
            config,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure an environment exists for the run.
    pub async fn get_or_create(&self, run_id: RunId, tier: SandboxTier) -> CoreResult<()> {
        let mut sandboxes = self.sandboxes.lock().await;
        if sandboxes.contains_key(&run_id) {
            return Ok(());
        }
        if sandboxes.len() >= self.config.max_concurrent {
            return Err(CoreError::ToolError(format!(
                "sandbox capacity reached ({})",
                self.config.max_concurrent
            )));
        }

        let limits = tier.limits();
        let provider_id = self.provider.create(&limits).await?;
        tracing::info!(%run_id, %provider_id, ?tier, "Sandbox created");
        sandboxes.insert(
            run_id,
            SandboxState {
                provider_id,
                limits,
                created_at: Utc::now(),
                last_activity: Utc::now(),
                metrics: SandboxMetrics::default(),
            },
        );
        Ok(())
    }

    async fn provider_id(&self, run_id: RunId) -> CoreResult<String> {
        let sandboxes = self.sandboxes.lock().await;
        sandboxes
            .get(&run_id)
            .map(|s| s.provider_id.clone())
            .ok_or_else(|| CoreError::ToolError(format!("no sandbox for run {run_id}")))
    }

    /// Trivial filesystem + shell probe.
    async fn probe(&self, provider_id: &str) -> bool {
        let fs_ok = self
            .provider
            .write_file(provider_id, PROBE_PATH, "ok")
            .await
            .is_ok()
            && matches!(
                self.provider.read_file(provider_id, PROBE_PATH).await,
                Ok(content) if content == "ok"
            );
        if !fs_ok {
            return false;
        }
        matches!(
            self.provider
                .execute_shell(provider_id, "echo probe", PROBE_TIMEOUT)
                .await,
            Ok(result) if result.exit_code == 0
        )
    }

    /// Health-check the run's environment, recreating it transparently once.
    /// A second failure surfaces as `SandboxUnhealthy`, which the enclosing
    /// tool call reports as `ToolError`.
    async fn ensure_healthy(&self, run_id: RunId) -> CoreResult<String> {
        let provider_id = self.provider_id(run_id).await?;
        if self.probe(&provider_id).await {
            let mut sandboxes = self.sandboxes.lock().await;
            if let Some(state) = sandboxes.get_mut(&run_id) {
                state.metrics.consecutive_health_failures = 0;
            }
            return Ok(provider_id);
        }

        tracing::warn!(%run_id, %provider_id, "Sandbox failed health probe, recreating");
        let limits = {
            let mut sandboxes = self.sandboxes.lock().await;
            let state = sandboxes
                .get_mut(&run_id)
                .ok_or_else(|| CoreError::ToolError(format!("no sandbox for run {run_id}")))?;
            state.metrics.consecutive_health_failures += 1;
            state.limits
        };
        let _ = self.provider.destroy(&provider_id).await;

        let new_id = self.provider.create(&limits).await?;
        {
            let mut sandboxes = self.sandboxes.lock().await;
            let state = sandboxes
                .get_mut(&run_id)
                .ok_or_else(|| CoreError::ToolError(format!("no sandbox for run {run_id}")))?;
            state.provider_id = new_id.clone();
            state.created_at = Utc::now();
            state.metrics.recreations += 1;
        }

        if self.probe(&new_id).await {
            Ok(new_id)
        } else {
            Err(CoreError::SandboxUnhealthy(format!(
                "environment for run {run_id} failed probe after recreation"
            )))
        }
    }

    async fn record_execution(&self, run_id: RunId, result: &ExecutionResult) {
        let mut sandboxes = self.sandboxes.lock().await;
        if let Some(state) = sandboxes.get_mut(&run_id) {
            state.last_activity = Utc::now();
            state.metrics.executions += 1;
            *state.metrics.exit_codes.entry(result.exit_code).or_insert(0) += 1;
            state.metrics.total_execute_time += result.duration;
        }
    }

    async fn touch(&self, run_id: RunId) {
        let mut sandboxes = self.sandboxes.lock().await;
        if let Some(state) = sandboxes.get_mut(&run_id) {
            state.last_activity = Utc::now();
        }
    }

    pub async fn execute_code(
        &self,
        run_id: RunId,
        language: &str,
        code: &str,
        timeout: Duration,
        ctx: &Ctx,
    ) -> CoreResult<ExecutionResult> {
        ctx.checkpoint()?;
        let provider_id = self.ensure_healthy(run_id).await.map_err(to_tool_error)?;
        let result = self
            .provider
            .execute_code(&provider_id, language, code, timeout)
            .await?;
        self.record_execution(run_id, &result).await;
        Ok(result)
    }

    pub async fn execute_shell(
        &self,
        run_id: RunId,
        command: &str,
        timeout: Duration,
        ctx: &Ctx,
    ) -> CoreResult<ExecutionResult> {
        ctx.checkpoint()?;
        let provider_id = self.ensure_healthy(run_id).await.map_err(to_tool_error)?;
        let result = self
            .provider
            .execute_shell(&provider_id, command, timeout)
            .await?;
        self.record_execution(run_id, &result).await;
        Ok(result)
    }

    pub async fn read_file(&self, run_id: RunId, path: &str) -> CoreResult<String> {
        let provider_id = self.provider_id(run_id).await?;
        let content = self.provider.read_file(&provider_id, path).await?;
        self.touch(run_id).await;
        Ok(content)
    }

    pub async fn write_file(&self, run_id: RunId, path: &str, content: &str) -> CoreResult<()> {
        let provider_id = self.provider_id(run_id).await?;
        self.provider.write_file(&provider_id, path, content).await?;
        self.touch(run_id).await;
        Ok(())
    }

    pub async fn list_files(&self, run_id: RunId, path: &str) -> CoreResult<Vec<FileEntry>> {
        let provider_id = self.provider_id(run_id).await?;
        let entries = self.provider.list_files(&provider_id, path).await?;
        self.touch(run_id).await;
        Ok(entries)
    }

    pub async fn download_file(&self, run_id: RunId, path: &str) -> CoreResult<Vec<u8>> {
        let provider_id = self.provider_id(run_id).await?;
        let bytes = self.provider.download_file(&provider_id, path).await?;
        self.touch(run_id).await;
        Ok(bytes)
    }

    pub async fn metrics(&self, run_id: RunId) -> Option<SandboxMetrics> {
        let sandboxes = self.sandboxes.lock().await;
        sandboxes.get(&run_id).map(|s| s.metrics.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.sandboxes.lock().await.len()
    }

    /// Destroy the run's environment and forget it.
    pub async fn cleanup(&self, run_id: RunId) -> CoreResult<()> {
        let state = self.sandboxes.lock().await.remove(&run_id);
        if let Some(state) = state {
            self.provider.destroy(&state.provider_id).await?;
            tracing::info!(%run_id, "Sandbox cleaned up");
        }
        Ok(())
    }

    /// Destroy environments idle past the TTL. Returns how many were swept.
    pub async fn sweep_idle(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.idle_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(900));
        let stale: Vec<(RunId, String)> = {
            let sandboxes = self.sandboxes.lock().await;
            sandboxes
                .iter()
                .filter(|(_, s)| s.last_activity < cutoff)
                .map(|(run_id, s)| (*run_id, s.provider_id.clone()))
                .collect()
        };

        let mut swept = 0;
        for (run_id, provider_id) in stale {
            self.sandboxes.lock().await.remove(&run_id);
            let _ = self.provider.destroy(&provider_id).await;
            tracing::info!(%run_id, "Idle sandbox swept");
            swept += 1;
        }
        swept
    }

    /// Background sweeping loop; exits on cancellation.
    pub async fn run_sweeper(self: Arc<Self>, ctx: Ctx) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_idle().await;
                }
                _ = ctx.cancelled() => return,
            }
        }
    }
}

fn to_tool_error(err: CoreError) -> CoreError {
    match err {
        CoreError::SandboxUnhealthy(msg) => CoreError::ToolError(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    /// A provider with an in-memory filesystem per sandbox and a togglable
    /// health switch.
    #[derive(Default)]
    struct MockProvider {
        next_id: AtomicU32,
        files: AsyncMutex<HashMap<(String, String), String>>,
        unhealthy: AtomicBool,
        /// When set, environments stay broken even after recreation.
        permanently_broken: AtomicBool,
        created: AtomicU32,
        destroyed: AtomicU32,
    }

    impl MockProvider {
        fn healthy(&self) -> bool {
            !self.unhealthy.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SandboxProvider for MockProvider {
        async fn create(&self, _limits: &ResourceLimits) -> CoreResult<String> {
            self.created.fetch_add(1, Ordering::SeqCst);
            // Recreation heals the environment unless permanently broken.
            if !self.permanently_broken.load(Ordering::SeqCst) {
                self.unhealthy.store(false, Ordering::SeqCst);
            }
            Ok(format!("sb-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
        }

        async fn execute_code(
            &self,
            _sandbox_id: &str,
            _language: &str,
            code: &str,
            _timeout: Duration,
        ) -> CoreResult<ExecutionResult> {
            Ok(ExecutionResult {
                stdout: format!("ran: {code}"),
                stderr: String::new(),
                exit_code: 0,
                duration: Duration::from_millis(10),
            })
        }

        async fn execute_shell(
            &self,
            _sandbox_id: &str,
            command: &str,
            _timeout: Duration,
        ) -> CoreResult<ExecutionResult> {
            if !self.healthy() {
                return Err(CoreError::SandboxUnhealthy("shell probe failed".into()));
            }
            Ok(ExecutionResult {
                stdout: command.to_string(),
                stderr: String::new(),
                exit_code: 0,
                duration: Duration::from_millis(1),
            })
        }

        async fn read_file(&self, sandbox_id: &str, path: &str) -> CoreResult<String> {
            if !self.healthy() {
                return Err(CoreError::SandboxUnhealthy("fs probe failed".into()));
            }
            self.files
                .lock()
                .await
                .get(&(sandbox_id.to_string(), path.to_string()))
                .cloned()
                .ok_or_else(|| CoreError::ToolError(format!("no such file {path}")))
        }

        async fn write_file(
            &self,
            sandbox_id: &str,
            path: &str,
            content: &str,
        ) -> CoreResult<()> {
            if !self.healthy() {
                return Err(CoreError::SandboxUnhealthy("fs probe failed".into()));
            }
            self.files
                .lock()
                .await
                .insert((sandbox_id.to_string(), path.to_string()), content.to_string());
            Ok(())
        }

        async fn list_files(&self, sandbox_id: &str, path: &str) -> CoreResult<Vec<FileEntry>> {
            let files = self.files.lock().await;
            Ok(files
                .iter()
                .filter(|((sb, p), _)| sb == sandbox_id && p.starts_with(path))
                .map(|((_, p), content)| FileEntry {
                    path: p.clone(),
                    size: content.len() as u64,
                    is_dir: false,
                })
                .collect())
        }

        async fn download_file(&self, sandbox_id: &str, path: &str) -> CoreResult<Vec<u8>> {
            Ok(self.read_file(sandbox_id, path).await?.into_bytes())
        }

        async fn destroy(&self, _sandbox_id: &str) -> CoreResult<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(provider: Arc<MockProvider>) -> SandboxManager {
        SandboxManager::new(provider, SandboxManagerConfig::default())
    }

    #[tokio::test]
    async fn execute_tracks_metrics() {
        let provider = Arc::new(MockProvider::default());
        let manager = manager(provider);
        let run = RunId::generate();
        let (ctx, _handle) = Ctx::background();

        manager.get_or_create(run, SandboxTier::Standard).await.unwrap();
        let result = manager
            .execute_code(run, "python", "print(1)", Duration::from_secs(5), &ctx)
            .await
            .unwrap();
        assert!(result.succeeded());

        let metrics = manager.metrics(run).await.unwrap();
        assert_eq!(metrics.executions, 1);
        assert_eq!(metrics.exit_codes.get(&0), Some(&1));
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let provider = Arc::new(MockProvider::default());
        let manager = manager(provider.clone());
        let run = RunId::generate();

        manager.get_or_create(run, SandboxTier::Free).await.unwrap();
        manager.get_or_create(run, SandboxTier::Free).await.unwrap();
        assert_eq!(provider.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhealthy_environment_is_recreated_transparently() {
        let provider = Arc::new(MockProvider::default());
        let manager = manager(provider.clone());
        let run = RunId::generate();
        let (ctx, _handle) = Ctx::background();

        manager.get_or_create(run, SandboxTier::Standard).await.unwrap();
        provider.unhealthy.store(true, Ordering::SeqCst);

        let result = manager
            .execute_shell(run, "ls", Duration::from_secs(5), &ctx)
            .await
            .unwrap();
        assert!(result.succeeded());

        let metrics = manager.metrics(run).await.unwrap();
        assert_eq!(metrics.recreations, 1);
        assert_eq!(provider.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_failure_surfaces_as_tool_error() {
        let provider = Arc::new(MockProvider::default());
        provider.permanently_broken.store(true, Ordering::SeqCst);
        let manager = manager(provider.clone());
        let run = RunId::generate();
        let (ctx, _handle) = Ctx::background();

        manager.get_or_create(run, SandboxTier::Standard).await.unwrap();
        provider.unhealthy.store(true, Ordering::SeqCst);

        let err = manager
            .execute_shell(run, "ls", Duration::from_secs(5), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ToolError(_)));
    }

    #[tokio::test]
    async fn concurrency_cap_is_enforced() {
        let provider = Arc::new(MockProvider::default());
        let manager = SandboxManager::new(
            provider,
            SandboxManagerConfig {
                max_concurrent: 1,
                ..Default::default()
            },
        );

        manager
            .get_or_create(RunId::generate(), SandboxTier::Free)
            .await
            .unwrap();
        let err = manager
            .get_or_create(RunId::generate(), SandboxTier::Free)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ToolError(_)));
    }

    #[tokio::test]
    async fn cleanup_destroys_and_frees_capacity() {
        let provider = Arc::new(MockProvider::default());
        let manager = manager(provider.clone());
        let run = RunId::generate();

        manager.get_or_create(run, SandboxTier::Free).await.unwrap();
        manager.cleanup(run).await.unwrap();
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(provider.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_sweep_removes_stale_environments() {
        let provider = Arc::new(MockProvider::default());
        let manager = SandboxManager::new(
            provider,
            SandboxManagerConfig {
                idle_ttl: Duration::from_millis(0),
                ..Default::default()
            },
        );
        let run = RunId::generate();
        manager.get_or_create(run, SandboxTier::Free).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.sweep_idle().await, 1);
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn file_roundtrip_through_manager() {
        let provider = Arc::new(MockProvider::default());
        let manager = manager(provider);
        let run = RunId::generate();
        manager.get_or_create(run, SandboxTier::Free).await.unwrap();

        manager.write_file(run, "/work/out.txt", "data").await.unwrap();
        assert_eq!(manager.read_file(run, "/work/out.txt").await.unwrap(), "data");
        let files = manager.list_files(run, "/work").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(manager.download_file(run, "/work/out.txt").await.unwrap(), b"data");
    }
}
