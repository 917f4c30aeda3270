//! The consumed sandbox provider interface.

use crate::limits::ResourceLimits;
use atelier_types::CoreResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Output of one code or shell execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// What the external sandbox vendor must offer. The manager is a consumer of
/// this shape and does not dictate the provider's wire protocol.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision an environment; returns the provider's id for it.
    async fn create(&self, limits: &ResourceLimits) -> CoreResult<String>;

    async fn execute_code(
        &self,
        sandbox_id: &str,
        language: &str,
        code: &str,
        timeout: Duration,
    ) -> CoreResult<ExecutionResult>;

    async fn execute_shell(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> CoreResult<ExecutionResult>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> CoreResult<String>;

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> CoreResult<()>;

    async fn list_files(&self, sandbox_id: &str, path: &str) -> CoreResult<Vec<FileEntry>>;

    async fn download_file(&self, sandbox_id: &str, path: &str) -> CoreResult<Vec<u8>>;

    async fn destroy(&self, sandbox_id: &str) -> CoreResult<()>;
}
