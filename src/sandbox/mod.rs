//! Sandbox gateway: isolated command execution, one environment per task.
//!
//! The container manager itself is an external service; this module defines
//! the capability the pipeline depends on (rebuilds and dependency installs
//! after merges) plus a local-process implementation used in development and
//! tests.

mod local;

pub use local::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Cap for build/install commands run through the sandbox.
pub const BUILD_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Result of one sandboxed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Descriptor for a task's sandbox environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxDescriptor {
    pub sandbox_id: String,
    pub task_id: String,
}

/// Capability set for executing commands in a task's isolated environment.
#[async_trait]
pub trait SandboxGateway: Send + Sync {
    /// Execute a shell command for the task, bounded by `timeout`.
    async fn exec(
        &self,
        task_id: &str,
        command: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> anyhow::Result<ExecOutcome>;

    /// The task's sandbox descriptor, when one exists.
    async fn sandbox(&self, task_id: &str) -> Option<SandboxDescriptor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_outcome_success() {
        let outcome = ExecOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(outcome.success());
        let outcome = ExecOutcome {
            exit_code: 1,
            ..outcome
        };
        assert!(!outcome.success());
    }
}
