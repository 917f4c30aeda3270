//! Tool dispatch for phase steps.
//!
//! A tool invocation is one idempotency-keyed step regardless of how many
//! provider calls it makes underneath; replay after a crash reuses the
//! persisted output instead of re-invoking.

use atelier_sandbox::{SandboxManager, SandboxTier};
use atelier_types::{CoreError, CoreResult, Ctx, PlanPhase, RunId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Tool names the executor can dispatch; feeds the scorer's
    /// feasibility context.
    fn available_tools(&self) -> Vec<String>;

    /// Invoke a tool for a phase. `input` is the phase accumulator so far
    /// (typically the LLM step's output).
    async fn invoke(
        &self,
        run_id: RunId,
        tool: &str,
        phase: &PlanPhase,
        input: &str,
        ctx: &Ctx,
    ) -> CoreResult<String>;
}

const EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Dispatches the sandbox-backed tools.
pub struct SandboxToolDispatcher {
    manager: Arc<SandboxManager>,
    tier: SandboxTier,
}

impl SandboxToolDispatcher {
    pub fn new(manager: Arc<SandboxManager>, tier: SandboxTier) -> Self {
        Self { manager, tier }
    }
}

#[async_trait]
impl ToolDispatcher for SandboxToolDispatcher {
    fn available_tools(&self) -> Vec<String> {
        vec![
            "execute_code".to_string(),
            "execute_shell".to_string(),
            "write_file".to_string(),
        ]
    }

    async fn invoke(
        &self,
        run_id: RunId,
        tool: &str,
        phase: &PlanPhase,
        input: &str,
        ctx: &Ctx,
    ) -> CoreResult<String> {
        self.manager.get_or_create(run_id, self.tier).await?;

        match tool {
            "execute_code" => {
                let result = self
                    .manager
                    .execute_code(run_id, "python", input, EXEC_TIMEOUT, ctx)
                    .await?;
                if result.succeeded() {
                    Ok(result.stdout)
                } else {
                    Err(CoreError::ToolError(format!(
                        "execute_code exited {}: {}",
                        result.exit_code, result.stderr
                    )))
                }
            }
            "execute_shell" => {
                let result = self
                    .manager
                    .execute_shell(run_id, input, EXEC_TIMEOUT, ctx)
                    .await?;
                if result.succeeded() {
                    Ok(result.stdout)
                } else {
                    Err(CoreError::ToolError(format!(
                        "execute_shell exited {}: {}",
                        result.exit_code, result.stderr
                    )))
                }
            }
            "write_file" => {
                let path = format!("/workspace/{}.md", phase.id);
                self.manager.write_file(run_id, &path, input).await?;
                Ok(path)
            }
            other => Err(CoreError::ToolError(format!("unknown tool '{other}'"))),
        }
    }
}
